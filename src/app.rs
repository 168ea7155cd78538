use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::domain::{
    NucleotideCandidate, OutputIdSource, ProteinRecord, QueryKey, Region, SkipReason,
};
use crate::error::CdsError;
use crate::frame::{ResolvedFrame, Target, resolve};
use crate::header::{classify, extract_region};
use crate::ncbi::SequenceService;
use crate::retrieval::RetrievalClient;
use crate::translate::MatchRules;
use crate::trim::trim_and_validate;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub stockholm: bool,
    pub output_id: OutputIdSource,
    pub rules: MatchRules,
}

impl From<&RunConfig> for PipelineOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            stockholm: config.stockholm,
            output_id: config.output_id,
            rules: config.rules,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedCds {
    pub output_id: String,
    pub source_id: Option<String>,
    pub cds: String,
    pub frame: ResolvedFrame,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Matched(MatchedCds),
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    /// Position of the record in the input collection.
    pub index: usize,
    pub protein_id: String,
    pub outcome: Outcome,
}

impl MatchResult {
    pub fn matched(&self) -> Option<&MatchedCds> {
        match &self.outcome {
            Outcome::Matched(matched) => Some(matched),
            Outcome::Skipped { .. } => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self.outcome {
            Outcome::Skipped { reason } => Some(reason),
            Outcome::Matched(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub matched: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub results: Vec<MatchResult>,
    pub summary: RunSummary,
}

struct Prepared {
    key: Result<QueryKey, SkipReason>,
    region: Option<Region>,
}

pub struct Pipeline<'a, S> {
    retrieval: &'a RetrievalClient<S>,
    options: PipelineOptions,
}

impl<'a, S: SequenceService> Pipeline<'a, S> {
    pub fn new(retrieval: &'a RetrievalClient<S>, options: PipelineOptions) -> Self {
        Self { retrieval, options }
    }

    /// Drives every record through classification, retrieval, frame
    /// resolution and trimming. Results keep input order; per-record
    /// failures become skips and only run-level failures are errors.
    pub fn run(
        &self,
        records: &[ProteinRecord],
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, CdsError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Classify; {} records", records.len()),
            elapsed: None,
        });
        let prepared = records
            .iter()
            .map(|record| self.prepare(record))
            .collect::<Vec<_>>();

        let keys = prepared
            .iter()
            .filter_map(|prepared| prepared.key.as_ref().ok())
            .filter(|key| key.lookup_term().is_some());
        sink.event(ProgressEvent {
            message: "phase=Retrieve; querying NCBI".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let candidates = self.retrieval.fetch(keys)?;

        sink.event(ProgressEvent {
            message: "phase=Reconcile; resolving frames".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let results = records
            .par_iter()
            .zip(prepared.par_iter())
            .enumerate()
            .map(|(index, (record, prepared))| self.reconcile(index, record, prepared, &candidates))
            .collect::<Vec<_>>();

        let mut summary = RunSummary {
            total: results.len(),
            cancelled: self.retrieval.cancel_token().is_cancelled(),
            ..RunSummary::default()
        };
        for result in &results {
            match result.skip_reason() {
                Some(reason) => *summary.skipped.entry(reason).or_default() += 1,
                None => summary.matched += 1,
            }
        }
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; {} matched, {} skipped",
                summary.matched,
                summary.skipped_total()
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(RunReport { results, summary })
    }

    fn prepare(&self, record: &ProteinRecord) -> Prepared {
        let (identifier, region) = if self.options.stockholm {
            let (identifier, region) = extract_region(&record.id);
            (identifier, region.or(record.region))
        } else {
            (record.id.clone(), None)
        };
        let key = match classify(&identifier, &record.description) {
            Ok(QueryKey::Uniparc(accession)) => {
                debug!(%accession, "UniParc entries have no canonical CDS");
                Err(SkipReason::UnsupportedIdentifierScheme)
            }
            Ok(key) => Ok(key),
            Err(err) => {
                debug!(id = %record.id, error = %err, "unclassifiable header");
                Err(SkipReason::UnsupportedIdentifierScheme)
            }
        };
        Prepared { key, region }
    }

    fn reconcile(
        &self,
        index: usize,
        record: &ProteinRecord,
        prepared: &Prepared,
        candidates: &HashMap<QueryKey, Vec<NucleotideCandidate>>,
    ) -> MatchResult {
        let outcome = match &prepared.key {
            Ok(key) => self.match_candidates(record, prepared.region, key, candidates),
            Err(reason) => Err(*reason),
        };
        let outcome = match outcome {
            Ok(matched) => Outcome::Matched(matched),
            Err(reason) => {
                warn!(index, id = %record.id, %reason, "skipping protein");
                Outcome::Skipped { reason }
            }
        };
        MatchResult {
            index,
            protein_id: record.id.clone(),
            outcome,
        }
    }

    fn match_candidates(
        &self,
        record: &ProteinRecord,
        region: Option<Region>,
        key: &QueryKey,
        candidates: &HashMap<QueryKey, Vec<NucleotideCandidate>>,
    ) -> Result<MatchedCds, SkipReason> {
        let candidates = candidates
            .get(key)
            .filter(|candidates| !candidates.is_empty())
            .ok_or(SkipReason::RetrievalFailed)?;
        let residues = record.residues();
        let target = match region {
            Some(region) => Target::region(&residues, region),
            None => Target::full(&residues),
        };

        let mut reason = SkipReason::NoValidFrame;
        for candidate in candidates {
            let Some(frame) = resolve(target, candidate, self.options.rules) else {
                continue;
            };
            match trim_and_validate(candidate, &frame, region, &residues, self.options.rules) {
                Ok(cds) => {
                    return Ok(MatchedCds {
                        output_id: self.output_id(record, frame.source_id.as_deref(), region),
                        source_id: frame.source_id.clone(),
                        cds: String::from_utf8_lossy(&cds).into_owned(),
                        frame,
                    });
                }
                Err(err) => {
                    debug!(id = %record.id, source = ?frame.source_id, error = %err, "trim rejected");
                    if region.is_some() {
                        reason = SkipReason::RegionTrimFailed;
                    }
                }
            }
        }
        Err(reason)
    }

    fn output_id(
        &self,
        record: &ProteinRecord,
        source_id: Option<&str>,
        region: Option<Region>,
    ) -> String {
        match self.options.output_id {
            OutputIdSource::Protein => record.id.clone(),
            OutputIdSource::Nucleotide => match (source_id, region) {
                (Some(source), Some(region)) if self.options.stockholm => {
                    let (start, stop) = region.nucleotide_span();
                    format!("{source}/{start}-{stop}")
                }
                (Some(source), _) => source.to_string(),
                (None, _) => record.id.clone(),
            },
        }
    }
}
