use thiserror::Error;

use crate::domain::{NucleotideCandidate, Region, strip_gaps};
use crate::frame::ResolvedFrame;
use crate::translate::{MatchRules, validate_cds};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrimError {
    #[error("resolved span {start}-{stop} lies outside the {len} bp candidate")]
    FrameOutOfBounds {
        start: usize,
        stop: usize,
        len: usize,
    },

    #[error("region {region} needs {needed} bp but the resolved CDS has {available}")]
    RegionOutOfBounds {
        region: Region,
        needed: usize,
        available: usize,
    },

    #[error("trimmed CDS no longer translates to the protein")]
    TranslationMismatch,
}

/// Cuts the resolved CDS out of its candidate, without the stop codon.
///
/// With a region, the cut is further narrowed to the codons covering the
/// region's residues (`offset` codons in from the CDS start).
pub fn trim(
    candidate: &NucleotideCandidate,
    frame: &ResolvedFrame,
    region: Option<Region>,
) -> Result<Vec<u8>, TrimError> {
    let oriented = candidate.strand_sequence(frame.strand);
    if frame.start > frame.stop || frame.stop >= oriented.len() {
        return Err(TrimError::FrameOutOfBounds {
            start: frame.start,
            stop: frame.stop,
            len: oriented.len(),
        });
    }
    let sense_end = frame.start + frame.sense_codons() * 3;
    let cds = &oriented[frame.start..sense_end];

    let cut = match region {
        None => cds,
        Some(region) => {
            let begin = region.offset() * 3;
            let end = region.stop * 3;
            if end > cds.len() {
                return Err(TrimError::RegionOutOfBounds {
                    region,
                    needed: end,
                    available: cds.len(),
                });
            }
            &cds[begin..end]
        }
    };
    Ok(strip_gaps(cut))
}

/// [`trim`] followed by re-checking that the output still translates to
/// `residues` exactly.
pub fn trim_and_validate(
    candidate: &NucleotideCandidate,
    frame: &ResolvedFrame,
    region: Option<Region>,
    residues: &[u8],
    rules: MatchRules,
) -> Result<Vec<u8>, TrimError> {
    let cds = trim(candidate, frame, region)?;
    // Only a full-length CDS begins at the initiator codon.
    let rules = if region.is_some_and(|region| region.start > 1) {
        MatchRules::default()
    } else {
        rules
    };
    match validate_cds(&cds, residues, rules) {
        Some(false) => Ok(cds),
        _ => Err(TrimError::TranslationMismatch),
    }
}
