use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::domain::{QueryKey, Region, UniprotAccession};

static UNIPARC_ACCESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^UPI[0-9A-F]{10}$").unwrap());

static UNIPROT_GENE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)GN=(\S+)").unwrap());

static UNIPROT_TAXON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)OX=(\d+)(?:\s|$)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("empty sequence identifier")]
    EmptyIdentifier,

    #[error("UniProt accession {0} has no GN= gene name in its description")]
    MissingGeneName(String),
}

/// Maps a FASTA header onto the identifier scheme used to query for its CDS.
///
/// UniParc wins over everything else, UniProt accessions need a `GN=` token,
/// and anything unrecognised is queried as an NCBI accession verbatim.
pub fn classify(identifier: &str, description: &str) -> Result<QueryKey, ClassificationError> {
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return Err(ClassificationError::EmptyIdentifier);
    }

    let fields = identifier.split('|').collect::<Vec<_>>();
    if let Some(uniparc) = fields.iter().find(|field| UNIPARC_ACCESSION.is_match(field)) {
        return Ok(QueryKey::Uniparc(uniparc.to_string()));
    }

    let uniprot = match fields.as_slice() {
        [db, accession, ..] if matches!(*db, "sp" | "tr") => accession.parse().ok(),
        [single] => single.parse::<UniprotAccession>().ok(),
        _ => None,
    };

    match uniprot {
        Some(accession) => match gene_name(description) {
            Some(gene) => Ok(QueryKey::UniprotGene {
                accession,
                gene: gene.to_string(),
                taxon: taxon_id(description),
            }),
            None => Err(ClassificationError::MissingGeneName(accession.to_string())),
        },
        None => Ok(QueryKey::NcbiAccession(identifier.to_string())),
    }
}

pub fn gene_name(description: &str) -> Option<&str> {
    UNIPROT_GENE_NAME
        .captures(description)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// NCBI taxonomy id of a UniProt header's `OX=` token.
pub fn taxon_id(description: &str) -> Option<u32> {
    UNIPROT_TAXON
        .captures(description)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Splits a Stockholm `/start-stop` suffix off an identifier.
///
/// A malformed suffix leaves the identifier untouched and yields no region.
pub fn extract_region(identifier: &str) -> (String, Option<Region>) {
    let Some((base, suffix)) = identifier.rsplit_once('/') else {
        return (identifier.to_string(), None);
    };
    let bound = |digits: &str| {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<usize>().ok()
    };
    let region = suffix
        .split_once('-')
        .and_then(|(start, stop)| Region::new(bound(start)?, bound(stop)?));
    match region {
        Some(region) if !base.is_empty() => (base.to_string(), Some(region)),
        _ => (identifier.to_string(), None),
    }
}
