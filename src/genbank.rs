//! GenBank parsing and per-key CDS feature selection.

use std::collections::HashMap;

use gb_io::reader::SeqReader;
use gb_io::seq::{Feature, Location, Seq};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{CodingRegion, NucleotideCandidate, QueryKey, Strand};
use crate::error::CdsError;
use crate::translate::reverse_complement;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NucleotideRecord {
    pub accession: String,
    pub sequence: String,
    pub features: Vec<CodingFeature>,
}

/// 0-based inclusive span on the record's forward strand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodingFeature {
    pub protein_id: Option<String>,
    pub locus_tag: Option<String>,
    pub gene: Option<String>,
    /// Segments in transcription order. Empty when the location could not
    /// be mapped onto this record (remote parts, gaps).
    pub segments: Vec<Segment>,
    pub codon_start: usize,
}

pub fn parse_genbank(data: &[u8]) -> Result<Vec<NucleotideRecord>, CdsError> {
    SeqReader::new(data)
        .map(|seq| {
            seq.map(to_record)
                .map_err(|err| CdsError::GenbankParse(err.to_string()))
        })
        .collect()
}

fn to_record(seq: Seq) -> NucleotideRecord {
    let accession = seq
        .version
        .clone()
        .or_else(|| seq.accession.clone())
        .or_else(|| seq.name.clone())
        .unwrap_or_default();
    let features = seq
        .features
        .iter()
        .filter(|feature| feature.kind.to_string() == "CDS")
        .map(to_coding_feature)
        .collect();
    NucleotideRecord {
        accession,
        sequence: String::from_utf8_lossy(&seq.seq).to_uppercase(),
        features,
    }
}

fn to_coding_feature(feature: &Feature) -> CodingFeature {
    let first = |key: &str| feature.qualifier_values(key.into()).next().map(str::to_string);
    let codon_start = first("codon_start")
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| (1..=3).contains(value))
        .unwrap_or(1);
    CodingFeature {
        protein_id: first("protein_id"),
        locus_tag: first("locus_tag"),
        gene: first("gene"),
        segments: location_segments(&feature.location).unwrap_or_default(),
        codon_start,
    }
}

fn location_segments(location: &Location) -> Option<Vec<Segment>> {
    match location {
        Location::Range((from, _), (to, _)) => {
            let start = usize::try_from(*from).ok()?;
            let end = usize::try_from(*to).ok()?.checked_sub(1)?;
            (start <= end).then_some(vec![Segment {
                start,
                end,
                reverse: false,
            }])
        }
        Location::Complement(inner) => {
            let mut segments = location_segments(inner)?;
            segments.reverse();
            for segment in &mut segments {
                segment.reverse = !segment.reverse;
            }
            Some(segments)
        }
        Location::Join(parts) | Location::Order(parts) => {
            let mut segments = Vec::new();
            for part in parts {
                segments.extend(location_segments(part)?);
            }
            Some(segments)
        }
        _ => None,
    }
}

pub(crate) fn bare_accession(accession: &str) -> &str {
    accession.split_once('.').map_or(accession, |(bare, _)| bare)
}

impl NucleotideRecord {
    /// Picks the CDS feature describing `key`'s protein.
    pub fn select_feature(&self, key: &QueryKey) -> Option<&CodingFeature> {
        let matched = match key {
            QueryKey::NcbiAccession(accession) => self.features.iter().find(|feature| {
                feature.protein_id.as_deref().is_some_and(|id| {
                    id == accession.as_str() || bare_accession(id) == bare_accession(accession)
                })
            }),
            QueryKey::UniprotGene { gene, .. } => {
                let gene = Some(gene.as_str());
                let features = &self.features;
                features
                    .iter()
                    .find(|feature| feature.locus_tag.as_deref() == gene)
                    .or_else(|| features.iter().find(|f| f.protein_id.as_deref() == gene))
                    .or_else(|| features.iter().find(|f| f.gene.as_deref() == gene))
            }
            QueryKey::Uniparc(_) => None,
        };
        matched.or(match self.features.as_slice() {
            [only] => Some(only),
            _ => None,
        })
    }

    pub fn candidate_for(&self, key: &QueryKey) -> NucleotideCandidate {
        let source_id = Some(self.accession.clone());
        let sequence = self.sequence.as_bytes();
        let Some(feature) = self.select_feature(key) else {
            debug!(accession = %self.accession, %key, "no CDS feature selected");
            return NucleotideCandidate::unannotated(source_id, sequence);
        };
        let phase = feature.codon_start - 1;
        let in_bounds = feature
            .segments
            .iter()
            .all(|segment| segment.end < sequence.len());

        match feature.segments.as_slice() {
            [segment] if in_bounds => {
                let mut candidate = NucleotideCandidate::unannotated(source_id, sequence);
                candidate.coding_region = Some(CodingRegion {
                    start: segment.start,
                    stop: segment.end,
                    strand: if segment.reverse {
                        Strand::Reverse
                    } else {
                        Strand::Forward
                    },
                    phase,
                });
                candidate
            }
            segments if segments.len() > 1 && in_bounds => {
                let mut spliced = Vec::new();
                for segment in segments {
                    let piece = &sequence[segment.start..=segment.end];
                    if segment.reverse {
                        spliced.extend(reverse_complement(piece));
                    } else {
                        spliced.extend_from_slice(piece);
                    }
                }
                let mut candidate = NucleotideCandidate::unannotated(source_id, &spliced);
                candidate.oriented = true;
                candidate.coding_region = candidate.sequence.len().checked_sub(1).map(|stop| {
                    CodingRegion {
                        start: 0,
                        stop,
                        strand: Strand::Forward,
                        phase,
                    }
                });
                candidate
            }
            _ => NucleotideCandidate::unannotated(source_id, sequence),
        }
    }
}

/// Extracts `/coded_by` nucleotide accessions from GenPept flat text, keyed
/// by both the versioned and the bare protein accession.
pub fn parse_coded_by(text: &str) -> HashMap<String, Vec<String>> {
    let mut results = HashMap::new();
    for record in text.split("\n//") {
        let mut accession: Option<&str> = None;
        let mut version: Option<&str> = None;
        let mut coded_by: Option<String> = None;
        let mut lines = record.lines();

        while let Some(line) = lines.next() {
            let tag = line.get(..12).unwrap_or(line).trim();
            let rest = line.get(12..).unwrap_or("").trim();
            match tag {
                "ACCESSION" => accession = rest.split_whitespace().next(),
                "VERSION" => version = rest.split_whitespace().next(),
                _ => {}
            }
            let trimmed = line.trim();
            if coded_by.is_none() {
                if let Some(value) = trimmed.strip_prefix("/coded_by=\"") {
                    let mut collected = value.to_string();
                    // Qualifier values may wrap onto continuation lines.
                    while !collected.ends_with('"') {
                        match lines.next() {
                            Some(next) => collected.push_str(next.trim()),
                            None => break,
                        }
                    }
                    coded_by = Some(collected.trim_end_matches('"').to_string());
                }
            }
        }

        let Some(coded_by) = coded_by else {
            continue;
        };
        let nucleotides = coded_by_accessions(&coded_by);
        if nucleotides.is_empty() {
            continue;
        }
        for protein in [version, accession].into_iter().flatten() {
            results.insert(protein.to_string(), nucleotides.clone());
            results.insert(bare_accession(protein).to_string(), nucleotides.clone());
        }
    }
    results
}

/// `complement(join(NC_1.1:10..20,NC_1.1:30..40))` -> `["NC_1.1"]`.
pub fn coded_by_accessions(location: &str) -> Vec<String> {
    let mut accessions: Vec<String> = Vec::new();
    for part in location.split(',') {
        let part = part
            .trim()
            .trim_start_matches("complement(")
            .trim_start_matches("join(")
            .trim_start_matches("order(");
        let Some((accession, _)) = part.split_once(':') else {
            continue;
        };
        let accession = accession.trim();
        if !accession.is_empty() && !accessions.iter().any(|known| known == accession) {
            accessions.push(accession.to_string());
        }
    }
    accessions
}
