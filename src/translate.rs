//! Standard genetic code translation and the residue comparison rule used
//! to validate a CDS against its protein.

use bio::alphabets::dna;

/// NCBI translation table 1, codons ordered TCAG x TCAG x TCAG.
const STANDARD_CODE: &[u8; 64] =
    b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

pub const WILDCARD: u8 = b'X';
pub const STOP: u8 = b'*';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchRules {
    /// Tolerate a mismatch at the first residue (non-ATG initiator codons).
    pub alternative_start: bool,
}

fn base_index(base: u8) -> Option<usize> {
    match base.to_ascii_uppercase() {
        b'T' | b'U' => Some(0),
        b'C' => Some(1),
        b'A' => Some(2),
        b'G' => Some(3),
        _ => None,
    }
}

/// Any codon containing a non-ACGT symbol translates to the wildcard.
pub fn translate_codon(codon: &[u8]) -> u8 {
    if codon.len() != 3 {
        return WILDCARD;
    }
    match (
        base_index(codon[0]),
        base_index(codon[1]),
        base_index(codon[2]),
    ) {
        (Some(b1), Some(b2), Some(b3)) => STANDARD_CODE[b1 * 16 + b2 * 4 + b3],
        _ => WILDCARD,
    }
}

pub fn is_stop_codon(codon: &[u8]) -> bool {
    translate_codon(codon) == STOP
}

/// Translates whole codons from `frame`, dropping a trailing partial codon.
pub fn translate_frame(sequence: &[u8], frame: usize) -> Vec<u8> {
    if frame >= sequence.len() {
        return Vec::new();
    }
    sequence[frame..]
        .chunks_exact(3)
        .map(translate_codon)
        .collect()
}

pub fn translate(sequence: &[u8]) -> Vec<u8> {
    translate_frame(sequence, 0)
}

pub fn reverse_complement(sequence: &[u8]) -> Vec<u8> {
    dna::revcomp(sequence)
}

/// Residue-for-residue comparison where a translated wildcard matches
/// anything.
pub fn residues_match(translated: &[u8], protein: &[u8], rules: MatchRules) -> bool {
    if translated.len() != protein.len() {
        return false;
    }
    translated
        .iter()
        .zip(protein)
        .enumerate()
        .all(|(idx, (aa, expected))| {
            *aa == WILDCARD
                || aa.eq_ignore_ascii_case(expected)
                || (idx == 0 && rules.alternative_start)
        })
}

/// Checks that `cds` translates to `protein`, allowing one trailing stop
/// codon. Returns whether that stop codon was present.
pub fn validate_cds(cds: &[u8], protein: &[u8], rules: MatchRules) -> Option<bool> {
    if cds.len() % 3 != 0 {
        return None;
    }
    let translated = translate(cds);
    let (body, has_stop) = match translated.split_last() {
        Some((&STOP, body)) => (body, true),
        _ => (translated.as_slice(), false),
    };
    residues_match(body, protein, rules).then_some(has_stop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_standard_codons() {
        assert_eq!(translate(b"ATGCGTACAAAGTAA"), b"MRTK*".to_vec());
        assert_eq!(translate(b"atgtgg"), b"MW".to_vec());
        assert_eq!(translate(b"AUGUAG"), b"M*".to_vec());
    }

    #[test]
    fn ambiguous_codons_are_wildcards() {
        assert_eq!(translate_codon(b"NAT"), WILDCARD);
        assert_eq!(translate_codon(b"A-G"), WILDCARD);
        assert_eq!(translate_codon(b"AT"), WILDCARD);
    }

    #[test]
    fn frames_drop_partial_codons() {
        assert_eq!(translate_frame(b"NATGCGTACAAAGTAA", 1), b"MRTK*".to_vec());
        assert_eq!(translate_frame(b"AT", 2), Vec::<u8>::new());
    }

    #[test]
    fn reverse_complement_keeps_ambiguity() {
        assert_eq!(reverse_complement(b"ATGNC"), b"GNCAT".to_vec());
    }

    #[test]
    fn wildcard_matches_any_residue() {
        assert!(residues_match(b"MXTK", b"MRTK", MatchRules::default()));
        assert!(!residues_match(b"MRTK", b"MXTK", MatchRules::default()));
        assert!(!residues_match(b"MRT", b"MRTK", MatchRules::default()));
    }

    #[test]
    fn alternative_start_only_relaxes_first_residue() {
        let rules = MatchRules {
            alternative_start: true,
        };
        assert!(residues_match(b"VRTK", b"MRTK", rules));
        assert!(!residues_match(b"MRTV", b"MRTK", rules));
    }

    #[test]
    fn validate_cds_strips_single_stop() {
        let rules = MatchRules::default();
        assert_eq!(validate_cds(b"ATGCGTACAAAGTAA", b"MRTK", rules), Some(true));
        assert_eq!(validate_cds(b"ATGCGTACAAAG", b"MRTK", rules), Some(false));
        assert_eq!(validate_cds(b"ATGCGTACAAAGTAATAA", b"MRTK", rules), None);
        assert_eq!(validate_cds(b"ATGCGTACAAA", b"MRTK", rules), None);
    }
}
