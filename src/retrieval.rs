//! Batched, rate-limited, retrying retrieval of candidate nucleotide
//! sequences for query keys.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::domain::{NucleotideCandidate, QueryKey};
use crate::error::CdsError;
use crate::genbank::{NucleotideRecord, bare_accession};
use crate::ncbi::{LookupKind, RequestKind, SequenceService};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Run-level interrupt flag shared by everything that issues requests.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    PermanentFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    Retrying(usize),
    Succeeded,
    Failed,
}

impl BatchState {
    pub fn advance(self, outcome: AttemptOutcome, policy: &RetryPolicy) -> BatchState {
        match (self, outcome) {
            (BatchState::Succeeded | BatchState::Failed, _) => self,
            (_, AttemptOutcome::Success) => BatchState::Succeeded,
            (_, AttemptOutcome::PermanentFailure) => BatchState::Failed,
            (BatchState::Pending, AttemptOutcome::RetryableFailure) => {
                if policy.max_retries > 0 {
                    BatchState::Retrying(1)
                } else {
                    BatchState::Failed
                }
            }
            (BatchState::Retrying(n), AttemptOutcome::RetryableFailure) => {
                if n < policy.max_retries {
                    BatchState::Retrying(n + 1)
                } else {
                    BatchState::Failed
                }
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::Failed)
    }
}

/// Minimum spacing between request starts, shared by all workers.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
            clock,
        }
    }

    /// Reserves the next free slot and waits for it. The lock is released
    /// before sleeping so other workers can queue behind this one.
    pub fn acquire(&self) {
        let wait = {
            let mut next_slot = lock(&self.next_slot);
            let now = self.clock.now();
            let slot = match *next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            self.clock.sleep(wait);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalSettings {
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 2,
            retry: RetryPolicy::default(),
            rate_limit: Duration::from_millis(340),
        }
    }
}

enum BatchResult<T> {
    Succeeded(T),
    Failed { connection: bool, error: String },
    NotIssued,
}

impl<T> BatchResult<T> {
    fn succeeded(&self) -> Option<&T> {
        match self {
            BatchResult::Succeeded(value) => Some(value),
            _ => None,
        }
    }
}

pub struct RetrievalClient<S> {
    service: S,
    settings: RetrievalSettings,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    cache: Mutex<HashMap<QueryKey, Vec<NucleotideCandidate>>>,
}

impl<S: SequenceService> RetrievalClient<S> {
    pub fn new(service: S, settings: RetrievalSettings) -> Self {
        Self::with_clock(service, settings, Arc::new(SystemClock), CancelToken::new())
    }

    pub fn with_clock(
        service: S,
        settings: RetrievalSettings,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            limiter: RateLimiter::new(settings.rate_limit, Arc::clone(&clock)),
            service,
            settings,
            clock,
            cancel,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Resolves every key to its candidates, shortest sequence first.
    ///
    /// Keys whose batches failed (or were never issued after cancellation)
    /// map to an empty list and stay out of the run cache. The only error is
    /// every issued batch of a stage failing at the connection level.
    pub fn fetch<'a, I>(&self, keys: I) -> Result<HashMap<QueryKey, Vec<NucleotideCandidate>>, CdsError>
    where
        I: IntoIterator<Item = &'a QueryKey>,
    {
        let unique: BTreeSet<&QueryKey> = keys.into_iter().collect();
        let mut resolved = HashMap::new();
        let mut pending = Vec::new();
        {
            let cache = lock(&self.cache);
            for key in unique {
                match cache.get(key) {
                    Some(candidates) => {
                        resolved.insert(key.clone(), candidates.clone());
                    }
                    None if key.lookup_term().is_none() => {
                        resolved.insert(key.clone(), Vec::new());
                    }
                    None => pending.push(key.clone()),
                }
            }
        }
        debug!(
            cached = resolved.len(),
            pending = pending.len(),
            "retrieval cache checked"
        );
        if pending.is_empty() {
            return Ok(resolved);
        }

        let lookups = self.lookup_phase(&pending)?;
        let accessions: BTreeSet<String> = lookups
            .values()
            .flat_map(|found| found.iter().flatten().cloned())
            .collect();
        let records = self.fetch_phase(&accessions.into_iter().collect::<Vec<_>>())?;

        let mut cache = lock(&self.cache);
        for key in pending {
            let Some(Some(found)) = lookups.get(&key) else {
                resolved.insert(key, Vec::new());
                continue;
            };
            let mut complete = true;
            let mut candidates = Vec::new();
            for accession in found {
                match records.get(accession.as_str()) {
                    Some(Some(record)) => candidates.push(record.candidate_for(&key)),
                    Some(None) => {}
                    None => complete = false,
                }
            }
            candidates.sort_by_key(|candidate| candidate.sequence.len());
            if complete {
                cache.insert(key.clone(), candidates.clone());
            }
            resolved.insert(key, candidates);
        }
        Ok(resolved)
    }

    /// Phase one: key -> nucleotide accessions. `None` marks keys whose
    /// lookup batch failed.
    fn lookup_phase(
        &self,
        keys: &[QueryKey],
    ) -> Result<HashMap<QueryKey, Option<Vec<String>>>, CdsError> {
        let mut terms_by_kind: BTreeMap<LookupKind, BTreeSet<String>> = BTreeMap::new();
        for key in keys {
            if let (Some(kind), Some(term)) = (lookup_kind(key), key.lookup_term()) {
                terms_by_kind.entry(kind).or_default().insert(term);
            }
        }

        let mut batches = Vec::new();
        for (kind, terms) in terms_by_kind {
            let terms = terms.into_iter().collect::<Vec<_>>();
            for chunk in terms.chunks(self.batch_size(RequestKind::Lookup(kind))) {
                batches.push((kind, chunk.to_vec()));
            }
        }
        info!(keys = keys.len(), batches = batches.len(), "looking up nucleotide records");

        let results = self.run_batches(&batches, |(kind, terms)| {
            self.run_batch(RequestKind::Lookup(*kind), terms, |terms| {
                self.service.lookup(*kind, terms)
            })
        })?;
        ensure_reachable("lookup", &results)?;

        let mut by_term: HashMap<(LookupKind, &str), Option<Vec<String>>> = HashMap::new();
        for ((kind, terms), result) in batches.iter().zip(&results) {
            for term in terms {
                let found = result
                    .succeeded()
                    .map(|found| found.get(term).cloned().unwrap_or_default());
                by_term.insert((*kind, term.as_str()), found);
            }
        }

        Ok(keys
            .iter()
            .map(|key| {
                let found = match (lookup_kind(key), key.lookup_term()) {
                    (Some(kind), Some(term)) => {
                        by_term.get(&(kind, term.as_str())).cloned().flatten()
                    }
                    _ => None,
                };
                (key.clone(), found)
            })
            .collect())
    }

    /// Phase two: accession -> record. Missing entries mark failed batches,
    /// `Some(None)` an accession the service did not return.
    fn fetch_phase(
        &self,
        accessions: &[String],
    ) -> Result<HashMap<String, Option<NucleotideRecord>>, CdsError> {
        let batches = accessions
            .chunks(self.batch_size(RequestKind::Fetch))
            .map(<[String]>::to_vec)
            .collect::<Vec<_>>();
        info!(
            accessions = accessions.len(),
            batches = batches.len(),
            "fetching nucleotide records"
        );

        let results = self.run_batches(&batches, |chunk| {
            self.run_batch(RequestKind::Fetch, chunk, |chunk| {
                self.service.fetch_records(chunk)
            })
        })?;
        ensure_reachable("fetch", &results)?;

        let mut by_accession = HashMap::new();
        for (chunk, result) in batches.iter().zip(results) {
            let BatchResult::Succeeded(records) = result else {
                continue;
            };
            let mut returned: HashMap<String, NucleotideRecord> = HashMap::new();
            for record in records {
                returned.insert(bare_accession(&record.accession).to_string(), record.clone());
                returned.insert(record.accession.clone(), record);
            }
            for accession in chunk {
                let record = returned
                    .get(accession)
                    .or_else(|| returned.get(bare_accession(accession)))
                    .cloned();
                if record.is_none() {
                    debug!(accession, "record not returned");
                }
                by_accession.insert(accession.clone(), record);
            }
        }
        Ok(by_accession)
    }

    fn batch_size(&self, kind: RequestKind) -> usize {
        let limit = self.service.batch_limit(kind).unwrap_or(usize::MAX);
        self.settings.batch_size.min(limit).max(1)
    }

    /// Runs batches on at most `concurrency` workers; results come back in
    /// batch order.
    fn run_batches<B, T, F>(&self, batches: &[B], run: F) -> Result<Vec<BatchResult<T>>, CdsError>
    where
        B: Sync,
        T: Send,
        F: Fn(&B) -> BatchResult<T> + Sync,
    {
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        if self.settings.concurrency <= 1 {
            return Ok(batches.iter().map(run).collect());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.concurrency)
            .build()
            .map_err(|err| CdsError::InvalidConfig(format!("retrieval workers: {err}")))?;
        Ok(pool.install(|| batches.par_iter().map(&run).collect()))
    }

    fn run_batch<T>(
        &self,
        kind: RequestKind,
        terms: &[String],
        call: impl Fn(&[String]) -> Result<T, CdsError>,
    ) -> BatchResult<T> {
        let policy = &self.settings.retry;
        let mut state = BatchState::Pending;
        loop {
            if self.cancel.is_cancelled() {
                if state == BatchState::Pending {
                    debug!(%kind, terms = terms.len(), "cancelled before issue");
                    return BatchResult::NotIssued;
                }
                return BatchResult::Failed {
                    connection: false,
                    error: CdsError::Cancelled.to_string(),
                };
            }

            self.limiter.acquire();
            let result = call(terms);
            let outcome = match &result {
                Ok(_) => AttemptOutcome::Success,
                Err(err) if err.is_retryable() => AttemptOutcome::RetryableFailure,
                Err(_) => AttemptOutcome::PermanentFailure,
            };
            let next = state.advance(outcome, policy);
            debug!(%kind, terms = terms.len(), ?state, ?next, "batch attempt");

            match (result, next) {
                (Ok(value), _) => return BatchResult::Succeeded(value),
                (Err(err), BatchState::Retrying(retry)) => {
                    let delay = policy.delay(retry);
                    debug!(%kind, retry, ?delay, error = %err, "retrying batch");
                    self.clock.sleep(delay);
                    state = next;
                }
                (Err(err), _) => {
                    warn!(%kind, terms = terms.len(), error = %err, "batch failed");
                    return BatchResult::Failed {
                        connection: err.is_connection(),
                        error: err.to_string(),
                    };
                }
            }
        }
    }
}

fn lookup_kind(key: &QueryKey) -> Option<LookupKind> {
    match key {
        QueryKey::NcbiAccession(_) => Some(LookupKind::ProteinAccession),
        QueryKey::UniprotGene { .. } => Some(LookupKind::GeneName),
        QueryKey::Uniparc(_) => None,
    }
}

fn ensure_reachable<T>(stage: &str, results: &[BatchResult<T>]) -> Result<(), CdsError> {
    let mut issued = 0;
    let mut last_error = None;
    for result in results {
        match result {
            BatchResult::NotIssued => {}
            BatchResult::Failed {
                connection: true,
                error,
            } => {
                issued += 1;
                last_error = Some(error.clone());
            }
            _ => return Ok(()),
        }
    }
    match last_error {
        Some(last_error) => Err(CdsError::ServiceUnreachable {
            stage: stage.to_string(),
            batches: issued,
            last_error,
        }),
        None => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
