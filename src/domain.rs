use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::CdsError;

static UNIPROT_ACCESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[OPQ][0-9][A-Z0-9]{3}[0-9]|[A-NR-Z][0-9](?:[A-Z][A-Z0-9]{2}[0-9]){1,2})$")
        .unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniprotAccession(String);

impl UniprotAccession {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_match(value: &str) -> bool {
        UNIPROT_ACCESSION.is_match(value)
    }
}

impl fmt::Display for UniprotAccession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniprotAccession {
    type Err = CdsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // Isoform suffixes (P69905-2) resolve through the canonical accession.
        let canonical = trimmed.split_once('-').map_or(trimmed, |(acc, _)| acc);
        let normalized = canonical.to_uppercase();
        if !UNIPROT_ACCESSION.is_match(&normalized) {
            return Err(CdsError::InvalidUniprotId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Sub-region of a full-length protein, 1-based and inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub start: usize,
    pub stop: usize,
}

impl Region {
    pub fn new(start: usize, stop: usize) -> Option<Self> {
        (start >= 1 && start <= stop).then_some(Self { start, stop })
    }

    pub fn residue_count(&self) -> usize {
        self.stop - self.start + 1
    }

    /// Residue offset of the region start within the full-length protein.
    pub fn offset(&self) -> usize {
        self.start - 1
    }

    pub fn nucleotide_span(&self) -> (usize, usize) {
        (self.start * 3 - 2, self.stop * 3)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.stop)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProteinRecord {
    pub id: String,
    pub description: String,
    pub sequence: Vec<u8>,
    pub region: Option<Region>,
}

impl ProteinRecord {
    pub fn new(id: impl Into<String>, description: impl Into<String>, sequence: &[u8]) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            sequence: sequence.to_vec(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: Option<Region>) -> Self {
        self.region = region;
        self
    }

    /// Residues as compared against translations: upper-case, without
    /// alignment gaps, without a terminal stop.
    pub fn residues(&self) -> Vec<u8> {
        let mut residues: Vec<u8> = self
            .sequence
            .iter()
            .filter(|base| !matches!(base, b'-' | b'.') && !base.is_ascii_whitespace())
            .map(|base| base.to_ascii_uppercase())
            .collect();
        if residues.last() == Some(&b'*') {
            residues.pop();
        }
        residues
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum QueryKey {
    NcbiAccession(String),
    /// `taxon` is the NCBI taxonomy id from the header's `OX=` token.
    UniprotGene {
        accession: UniprotAccession,
        gene: String,
        taxon: Option<u32>,
    },
    Uniparc(String),
}

impl QueryKey {
    pub fn scheme(&self) -> &'static str {
        match self {
            QueryKey::NcbiAccession(_) => "ncbi",
            QueryKey::UniprotGene { .. } => "uniprot",
            QueryKey::Uniparc(_) => "uniparc",
        }
    }

    /// Term sent to the remote lookup for this key. Gene names are fielded
    /// and, when the organism is known, restricted to it.
    pub fn lookup_term(&self) -> Option<String> {
        match self {
            QueryKey::NcbiAccession(acc) => Some(acc.clone()),
            QueryKey::UniprotGene {
                gene,
                taxon: Some(taxon),
                ..
            } => Some(format!("{gene}[Gene Name] AND txid{taxon}[Organism:exp]")),
            QueryKey::UniprotGene { gene, .. } => Some(format!("{gene}[Gene Name]")),
            QueryKey::Uniparc(_) => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::NcbiAccession(acc) => write!(f, "ncbi:{acc}"),
            QueryKey::UniprotGene {
                accession,
                gene,
                taxon: Some(taxon),
            } => write!(f, "uniprot:{accession}:{gene}:{taxon}"),
            QueryKey::UniprotGene { accession, gene, .. } => {
                write!(f, "uniprot:{accession}:{gene}")
            }
            QueryKey::Uniparc(acc) => write!(f, "uniparc:{acc}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strand {
    Forward,
    Reverse,
}

/// Annotated CDS span on a candidate, 0-based inclusive forward-strand
/// coordinates; `phase` is the GenBank `codon_start` minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingRegion {
    pub start: usize,
    pub stop: usize,
    pub strand: Strand,
    pub phase: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NucleotideCandidate {
    pub source_id: Option<String>,
    pub sequence: Vec<u8>,
    pub coding_region: Option<CodingRegion>,
    /// Set when the sequence is already a CDS read 5'->3' so only the
    /// forward strand is worth searching.
    pub oriented: bool,
    pub retrieved_at: DateTime<Utc>,
}

impl NucleotideCandidate {
    pub fn unannotated(source_id: Option<String>, sequence: &[u8]) -> Self {
        Self {
            source_id,
            sequence: strip_gaps(sequence),
            coding_region: None,
            oriented: false,
            retrieved_at: Utc::now(),
        }
    }

    pub fn strand_sequence(&self, strand: Strand) -> Vec<u8> {
        match strand {
            Strand::Forward => self.sequence.clone(),
            Strand::Reverse => crate::translate::reverse_complement(&self.sequence),
        }
    }
}

pub fn strip_gaps(sequence: &[u8]) -> Vec<u8> {
    sequence
        .iter()
        .copied()
        .filter(|base| !matches!(base, b'-' | b'.' | b'~') && !base.is_ascii_whitespace())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SkipReason {
    UnsupportedIdentifierScheme,
    RetrievalFailed,
    NoValidFrame,
    RegionTrimFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::UnsupportedIdentifierScheme => "unsupported identifier scheme",
            SkipReason::RetrievalFailed => "retrieval failed",
            SkipReason::NoValidFrame => "no valid reading frame",
            SkipReason::RegionTrimFailed => "region trim failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputIdSource {
    #[default]
    Nucleotide,
    Protein,
}

impl fmt::Display for OutputIdSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputIdSource::Nucleotide => write!(f, "nucleotide"),
            OutputIdSource::Protein => write!(f, "protein"),
        }
    }
}
