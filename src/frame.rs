//! Reading-frame discovery: find the stretch of a candidate nucleotide
//! sequence whose translation reconciles with the target protein.

use serde::Serialize;
use tracing::trace;

use crate::domain::{NucleotideCandidate, Region, Strand};
use crate::translate::{MatchRules, STOP, residues_match, translate, translate_frame};

/// Residues to reconcile. `offset` counts the full-length protein residues
/// that precede `residues`. Only a `full_length` target is anchored to the
/// stop codon; a sub-region may sit anywhere inside the CDS, even at offset 0.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub residues: &'a [u8],
    pub offset: usize,
    pub full_length: bool,
}

impl<'a> Target<'a> {
    pub fn full(residues: &'a [u8]) -> Self {
        Self {
            residues,
            offset: 0,
            full_length: true,
        }
    }

    pub fn region(residues: &'a [u8], region: Region) -> Self {
        Self {
            residues,
            offset: region.offset(),
            full_length: false,
        }
    }
}

/// `start..=stop` index the strand-oriented candidate sequence and cover
/// the whole CDS, including its stop codon when `has_stop` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedFrame {
    pub source_id: Option<String>,
    pub strand: Strand,
    pub frame: usize,
    pub start: usize,
    pub stop: usize,
    pub has_stop: bool,
    pub annotated: bool,
}

impl ResolvedFrame {
    pub fn sense_codons(&self) -> usize {
        let span = self.stop + 1 - self.start;
        span / 3 - usize::from(self.has_stop)
    }
}

pub fn resolve(
    target: Target<'_>,
    candidate: &NucleotideCandidate,
    rules: MatchRules,
) -> Option<ResolvedFrame> {
    if target.residues.is_empty() {
        return None;
    }
    if let Some(frame) = resolve_annotated(target, candidate, rules) {
        return Some(frame);
    }

    let strands: &[Strand] = if candidate.oriented {
        &[Strand::Forward]
    } else {
        &[Strand::Forward, Strand::Reverse]
    };
    for &strand in strands {
        let sequence = candidate.strand_sequence(strand);
        for frame in 0..3 {
            let translated = translate_frame(&sequence, frame);
            if let Some((first, end, has_stop)) = search_segments(&translated, target, rules) {
                trace!(?strand, frame, first, end, "frame search accepted");
                return Some(ResolvedFrame {
                    source_id: candidate.source_id.clone(),
                    strand,
                    frame,
                    start: frame + first * 3,
                    stop: frame + (end + usize::from(has_stop)) * 3 - 1,
                    has_stop,
                    annotated: false,
                });
            }
        }
    }
    None
}

fn resolve_annotated(
    target: Target<'_>,
    candidate: &NucleotideCandidate,
    rules: MatchRules,
) -> Option<ResolvedFrame> {
    let region = candidate.coding_region?;
    let len = candidate.sequence.len();
    if region.stop >= len || region.start > region.stop {
        return None;
    }
    let (start, stop) = match region.strand {
        Strand::Forward => (region.start, region.stop),
        Strand::Reverse => (len - 1 - region.stop, len - 1 - region.start),
    };
    let begin = start + region.phase;
    if begin > stop {
        return None;
    }
    let sequence = candidate.strand_sequence(region.strand);
    let whole = (stop + 1 - begin) / 3 * 3;
    let translated = translate(&sequence[begin..begin + whole]);

    let body_end = translated
        .iter()
        .position(|aa| *aa == STOP)
        .unwrap_or(translated.len());
    let has_stop = body_end < translated.len();
    // An annotated CDS may carry nothing after its (single) stop codon.
    if has_stop && body_end + 1 != translated.len() {
        return None;
    }
    if !window_fits(&translated[..body_end], target, rules) {
        return None;
    }
    Some(ResolvedFrame {
        source_id: candidate.source_id.clone(),
        strand: region.strand,
        frame: begin % 3,
        start: begin,
        stop: begin + (body_end + usize::from(has_stop)) * 3 - 1,
        has_stop,
        annotated: true,
    })
}

/// Walks stop-delimited segments of one translated frame. Returns the
/// codon range of the first reconciling CDS and whether a stop follows it.
fn search_segments(
    translated: &[u8],
    target: Target<'_>,
    rules: MatchRules,
) -> Option<(usize, usize, bool)> {
    let mut segment_start = 0;
    for idx in 0..=translated.len() {
        let at_end = idx == translated.len();
        if !at_end && translated[idx] != STOP {
            continue;
        }
        let segment = &translated[segment_start..idx];
        if let Some(first) = first_fit(segment, target, rules) {
            return Some((segment_start + first, idx, !at_end));
        }
        segment_start = idx + 1;
    }
    None
}

fn first_fit(segment: &[u8], target: Target<'_>, rules: MatchRules) -> Option<usize> {
    let needed = target.offset + target.residues.len();
    if segment.len() < needed {
        return None;
    }
    if target.full_length {
        // The CDS runs up to the stop, so the protein must end the segment.
        let first = segment.len() - needed;
        return window_fits(&segment[first..], target, rules).then_some(first);
    }
    (0..=segment.len() - needed).find(|&first| window_fits(&segment[first..], target, rules))
}

fn window_fits(body: &[u8], target: Target<'_>, rules: MatchRules) -> bool {
    let begin = target.offset;
    let end = begin + target.residues.len();
    if end > body.len() {
        return false;
    }
    if target.full_length && end != body.len() {
        return false;
    }
    let rules = if target.offset == 0 {
        rules
    } else {
        // The initiator only sits at the start of the full-length protein.
        MatchRules::default()
    };
    residues_match(&body[begin..end], target.residues, rules)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::domain::CodingRegion;
    use crate::translate::reverse_complement;

    fn candidate(sequence: &[u8]) -> NucleotideCandidate {
        NucleotideCandidate {
            source_id: Some("NM_TEST.1".to_string()),
            sequence: sequence.to_vec(),
            coding_region: None,
            oriented: false,
            retrieved_at: Utc::now(),
        }
    }

    #[test]
    fn resolves_leading_ambiguous_base_in_frame_one() {
        let frame = resolve(
            Target::full(b"MRTK"),
            &candidate(b"NATGCGTACAAAGTAA"),
            MatchRules::default(),
        )
        .unwrap();
        assert_eq!(frame.strand, Strand::Forward);
        assert_eq!(frame.frame, 1);
        assert_eq!((frame.start, frame.stop), (1, 15));
        assert!(frame.has_stop);
        assert_eq!(frame.sense_codons(), 4);
    }

    #[test]
    fn untranslated_wildcard_leader_is_excluded() {
        // frame 1 reads XMRTK*; the leading X is not part of the protein
        let frame = resolve(
            Target::full(b"MRTK"),
            &candidate(b"CNNNATGCGTACAAAGTAA"),
            MatchRules::default(),
        )
        .unwrap();
        assert_eq!(frame.frame, 1);
        assert_eq!(frame.start, 4);
        assert_eq!(frame.sense_codons(), 4);
    }

    #[test]
    fn wildcard_inside_protein_is_accepted() {
        let frame = resolve(
            Target::full(b"MRTK"),
            &candidate(b"ATGCGNACAAAGTAA"),
            MatchRules::default(),
        )
        .unwrap();
        assert_eq!((frame.frame, frame.start, frame.stop), (0, 0, 14));
    }

    #[test]
    fn protein_must_end_at_stop_codon() {
        // MRTKL* never reconciles with MRTK: the search runs up to the stop
        let result = resolve(
            Target::full(b"MRTK"),
            &candidate(b"ATGCGTACAAAGCTGTAA"),
            MatchRules::default(),
        );
        assert!(result.is_none());
    }

    #[test]
    fn forward_frames_win_over_reverse() {
        let forward = b"ATGCGTACAAAGTAA";
        let mut sequence = forward.to_vec();
        sequence.extend_from_slice(&reverse_complement(forward));
        let frame = resolve(
            Target::full(b"MRTK"),
            &candidate(&sequence),
            MatchRules::default(),
        )
        .unwrap();
        assert_eq!(frame.strand, Strand::Forward);
        assert_eq!(frame.start, 0);
    }

    #[test]
    fn resolves_reverse_strand_when_direction_ambiguous() {
        let sequence = reverse_complement(b"GGATGCGTACAAAGTAACC");
        let frame = resolve(
            Target::full(b"MRTK"),
            &candidate(&sequence),
            MatchRules::default(),
        )
        .unwrap();
        assert_eq!(frame.strand, Strand::Reverse);
        assert_eq!(frame.frame, 2);
        assert_eq!((frame.start, frame.stop), (2, 16));
    }

    #[test]
    fn oriented_candidates_skip_reverse_strand() {
        let mut oriented = candidate(&reverse_complement(b"ATGCGTACAAAGTAA"));
        oriented.oriented = true;
        assert!(resolve(Target::full(b"MRTK"), &oriented, MatchRules::default()).is_none());
    }

    #[test]
    fn annotated_region_is_tried_first() {
        let mut annotated = candidate(b"CCCATGCGTACAAAGTAAGG");
        annotated.coding_region = Some(CodingRegion {
            start: 3,
            stop: 17,
            strand: Strand::Forward,
            phase: 0,
        });
        let frame = resolve(Target::full(b"MRTK"), &annotated, MatchRules::default()).unwrap();
        assert!(frame.annotated);
        assert_eq!((frame.start, frame.stop), (3, 17));
    }

    #[test]
    fn annotated_reverse_region_maps_coordinates() {
        let mut sequence = b"TT".to_vec();
        sequence.extend_from_slice(&reverse_complement(b"ATGCGTACAAAGTAA"));
        sequence.extend_from_slice(b"GGG");
        let mut annotated = candidate(&sequence);
        annotated.coding_region = Some(CodingRegion {
            start: 2,
            stop: 16,
            strand: Strand::Reverse,
            phase: 0,
        });
        let frame = resolve(Target::full(b"MRTK"), &annotated, MatchRules::default()).unwrap();
        assert!(frame.annotated);
        assert_eq!(frame.strand, Strand::Reverse);
        assert_eq!((frame.start, frame.stop), (3, 17));
    }

    #[test]
    fn bad_annotation_falls_back_to_search() {
        let mut annotated = candidate(b"GATGCGTACAAAGTAA");
        annotated.coding_region = Some(CodingRegion {
            start: 0,
            stop: 14,
            strand: Strand::Forward,
            phase: 0,
        });
        let frame = resolve(Target::full(b"MRTK"), &annotated, MatchRules::default()).unwrap();
        assert!(!frame.annotated);
        assert_eq!(frame.start, 1);
    }

    #[test]
    fn region_target_locates_full_cds() {
        // full protein MRTKLG, region 3-4 => TK
        let frame = resolve(
            Target::region(b"TK", Region::new(3, 4).unwrap()),
            &candidate(b"AATGCGTACAAAGCTGGGTAA"),
            MatchRules::default(),
        )
        .unwrap();
        assert_eq!(frame.frame, 1);
        assert_eq!(frame.start, 1);
        assert_eq!(frame.sense_codons(), 6);
    }

    #[test]
    fn leading_region_is_not_anchored_to_the_stop() {
        // full protein MRTKLG, region 1-3 => MRT
        let cds = candidate(b"ATGCGTACAAAGCTGGGTTAA");
        let region = Region::new(1, 3).unwrap();
        assert!(resolve(Target::full(b"MRT"), &cds, MatchRules::default()).is_none());
        let frame = resolve(Target::region(b"MRT", region), &cds, MatchRules::default()).unwrap();
        assert_eq!((frame.frame, frame.start, frame.stop), (0, 0, 20));
        assert_eq!(frame.sense_codons(), 6);
    }

    #[test]
    fn alternative_start_codon_needs_opt_in() {
        let cds = candidate(b"GTGCGTACAAAGTAA");
        assert!(resolve(Target::full(b"MRTK"), &cds, MatchRules::default()).is_none());
        let rules = MatchRules {
            alternative_start: true,
        };
        assert!(resolve(Target::full(b"MRTK"), &cds, rules).is_some());
    }
}
