use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use assert_matches::assert_matches;

use kira_cds::domain::QueryKey;
use kira_cds::error::CdsError;
use kira_cds::genbank::{CodingFeature, NucleotideRecord, Segment};
use kira_cds::ncbi::{LookupKind, SequenceService};
use kira_cds::retrieval::{CancelToken, Clock, RetrievalClient, RetrievalSettings, RetryPolicy};

#[derive(Default)]
struct MockEntrez {
    lookups: HashMap<String, Vec<String>>,
    records: HashMap<String, NucleotideRecord>,
    /// Lookup batches containing one of these terms are rejected outright.
    rejected_terms: HashSet<String>,
    /// Number of leading lookup calls answered with 503.
    transient_failures: Mutex<usize>,
    offline: bool,
    /// Cancelled from inside the first record fetch.
    cancel_during_fetch: Option<CancelToken>,
    lookup_calls: Mutex<Vec<Vec<String>>>,
    fetch_calls: Mutex<Vec<Vec<String>>>,
}

impl MockEntrez {
    fn with_protein(mut self, protein: &str, nucleotide: &str) -> Self {
        self.lookups
            .insert(protein.to_string(), vec![nucleotide.to_string()]);
        self.records
            .insert(nucleotide.to_string(), record(nucleotide, protein));
        self
    }

    fn lookup_calls(&self) -> Vec<Vec<String>> {
        self.lookup_calls.lock().unwrap().clone()
    }

    fn fetch_calls(&self) -> Vec<Vec<String>> {
        self.fetch_calls.lock().unwrap().clone()
    }
}

impl SequenceService for MockEntrez {
    fn lookup(
        &self,
        _kind: LookupKind,
        terms: &[String],
    ) -> Result<HashMap<String, Vec<String>>, CdsError> {
        self.lookup_calls.lock().unwrap().push(terms.to_vec());
        if self.offline {
            return Err(CdsError::EntrezHttp("connection refused".to_string()));
        }
        {
            let mut transient = self.transient_failures.lock().unwrap();
            if *transient > 0 {
                *transient -= 1;
                return Err(CdsError::EntrezStatus {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
        }
        if terms.iter().any(|term| self.rejected_terms.contains(term)) {
            return Err(CdsError::EntrezStatus {
                status: 400,
                message: "bad request".to_string(),
            });
        }
        Ok(terms
            .iter()
            .filter_map(|term| {
                self.lookups
                    .get(term)
                    .map(|found| (term.clone(), found.clone()))
            })
            .collect())
    }

    fn fetch_records(&self, accessions: &[String]) -> Result<Vec<NucleotideRecord>, CdsError> {
        self.fetch_calls.lock().unwrap().push(accessions.to_vec());
        if let Some(token) = &self.cancel_during_fetch {
            token.cancel();
        }
        if self.offline {
            return Err(CdsError::EntrezHttp("connection refused".to_string()));
        }
        Ok(accessions
            .iter()
            .filter_map(|accession| self.records.get(accession).cloned())
            .collect())
    }
}

/// Advances instantly and remembers every sleep.
struct FakeClock {
    start: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
        self.sleeps.lock().unwrap().push(duration);
    }
}

fn record(accession: &str, protein: &str) -> NucleotideRecord {
    NucleotideRecord {
        accession: accession.to_string(),
        sequence: "CCATGCGTACAAAGTAAGG".to_string(),
        features: vec![CodingFeature {
            protein_id: Some(protein.to_string()),
            segments: vec![Segment {
                start: 2,
                end: 16,
                reverse: false,
            }],
            codon_start: 1,
            ..CodingFeature::default()
        }],
    }
}

fn settings(batch_size: usize, max_retries: usize) -> RetrievalSettings {
    RetrievalSettings {
        batch_size,
        concurrency: 1,
        retry: RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        rate_limit: Duration::ZERO,
    }
}

fn client(
    service: MockEntrez,
    settings: RetrievalSettings,
) -> (RetrievalClient<MockEntrez>, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::default());
    let client = RetrievalClient::with_clock(service, settings, clock.clone(), CancelToken::new());
    (client, clock)
}

fn ncbi(accession: &str) -> QueryKey {
    QueryKey::NcbiAccession(accession.to_string())
}

#[test]
fn duplicate_keys_share_one_request() {
    let service = MockEntrez::default().with_protein("NP_000001.1", "NM_000001.1");
    let (client, _) = client(service, settings(100, 0));
    let key = ncbi("NP_000001.1");

    let found = client.fetch([&key, &key, &key]).unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(found[&key].len(), 1);
    assert_eq!(found[&key][0].source_id.as_deref(), Some("NM_000001.1"));
    assert_eq!(
        client.service().lookup_calls(),
        vec![vec!["NP_000001.1".to_string()]]
    );
    assert_eq!(
        client.service().fetch_calls(),
        vec![vec!["NM_000001.1".to_string()]]
    );
}

#[test]
fn rejected_batch_only_affects_its_own_keys() {
    let mut service = MockEntrez::default()
        .with_protein("NP_000001.1", "NM_000001.1")
        .with_protein("NP_000002.1", "NM_000002.1");
    service.rejected_terms.insert("NP_000002.1".to_string());
    let (client, _) = client(service, settings(1, 3));
    let good = ncbi("NP_000001.1");
    let bad = ncbi("NP_000002.1");

    let found = client.fetch([&good, &bad]).unwrap();

    assert_eq!(found[&good].len(), 1);
    assert!(found[&bad].is_empty());
    // 400 is permanent: one attempt per batch, no retries
    assert_eq!(client.service().lookup_calls().len(), 2);
}

#[test]
fn transient_failures_back_off_on_the_clock() {
    let service = MockEntrez::default().with_protein("NP_000001.1", "NM_000001.1");
    *service.transient_failures.lock().unwrap() = 2;
    let (client, clock) = client(service, settings(100, 3));
    let key = ncbi("NP_000001.1");

    let found = client.fetch([&key]).unwrap();

    assert_eq!(found[&key].len(), 1);
    assert_eq!(client.service().lookup_calls().len(), 3);
    assert_eq!(
        *clock.sleeps.lock().unwrap(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[test]
fn exhausted_retries_are_not_cached() {
    let service = MockEntrez::default().with_protein("NP_000001.1", "NM_000001.1");
    *service.transient_failures.lock().unwrap() = 2;
    let (client, _) = client(service, settings(100, 1));
    let key = ncbi("NP_000001.1");

    let first = client.fetch([&key]).unwrap();
    assert!(first[&key].is_empty());
    assert_eq!(client.service().lookup_calls().len(), 2);

    let second = client.fetch([&key]).unwrap();
    assert_eq!(second[&key].len(), 1);
    assert_eq!(client.service().lookup_calls().len(), 3);
}

#[test]
fn successful_results_are_served_from_memory() {
    let service = MockEntrez::default().with_protein("NP_000001.1", "NM_000001.1");
    let (client, _) = client(service, settings(100, 0));
    let key = ncbi("NP_000001.1");

    let first = client.fetch([&key]).unwrap();
    let second = client.fetch([&key]).unwrap();

    assert_eq!(first[&key], second[&key]);
    assert_eq!(client.service().lookup_calls().len(), 1);
    assert_eq!(client.service().fetch_calls().len(), 1);
}

#[test]
fn unknown_proteins_resolve_to_nothing() {
    let service = MockEntrez::default().with_protein("NP_000001.1", "NM_000001.1");
    let (client, _) = client(service, settings(100, 0));
    let known = ncbi("NP_000001.1");
    let unknown = ncbi("NP_999999.1");

    let found = client.fetch([&known, &unknown]).unwrap();

    assert_eq!(found[&known].len(), 1);
    assert!(found[&unknown].is_empty());
    assert_eq!(client.service().fetch_calls().len(), 1);
}

fn gene(gene: &str, taxon: Option<u32>) -> QueryKey {
    QueryKey::UniprotGene {
        accession: "P69905".parse().unwrap(),
        gene: gene.to_string(),
        taxon,
    }
}

#[test]
fn gene_keys_use_the_gene_name() {
    let term = "HBA1[Gene Name] AND txid9606[Organism:exp]";
    let mut service = MockEntrez::default();
    service
        .lookups
        .insert(term.to_string(), vec!["NM_000558.5".to_string()]);
    service
        .records
        .insert("NM_000558.5".to_string(), record("NM_000558.5", "NP_000549.1"));
    let (client, _) = client(service, settings(100, 0));
    let key = gene("HBA1", Some(9606));

    let found = client.fetch([&key]).unwrap();

    assert_eq!(client.service().lookup_calls(), vec![vec![term.to_string()]]);
    // the sole CDS feature of the record is used
    assert!(found[&key][0].coding_region.is_some());
}

#[test]
fn same_gene_in_other_organisms_is_looked_up_separately() {
    let mut service = MockEntrez::default();
    for (taxon, accession) in [(9606, "NM_000558.5"), (10090, "NM_008218.2")] {
        service.lookups.insert(
            format!("HBA1[Gene Name] AND txid{taxon}[Organism:exp]"),
            vec![accession.to_string()],
        );
        service
            .records
            .insert(accession.to_string(), record(accession, "NP_000549.1"));
    }
    let (client, _) = client(service, settings(1, 0));
    let human = gene("HBA1", Some(9606));
    let mouse = gene("HBA1", Some(10090));

    let found = client.fetch([&human, &mouse]).unwrap();

    let mut terms = client.service().lookup_calls().concat();
    terms.sort();
    assert_eq!(
        terms,
        vec![
            "HBA1[Gene Name] AND txid10090[Organism:exp]".to_string(),
            "HBA1[Gene Name] AND txid9606[Organism:exp]".to_string(),
        ]
    );
    assert_eq!(found[&human][0].source_id.as_deref(), Some("NM_000558.5"));
    assert_eq!(found[&mouse][0].source_id.as_deref(), Some("NM_008218.2"));
}

#[test]
fn every_batch_unreachable_is_fatal() {
    let service = MockEntrez {
        offline: true,
        ..MockEntrez::default()
    };
    let (client, _) = client(service, settings(1, 0));
    let first = ncbi("NP_000001.1");
    let second = ncbi("NP_000002.1");

    let err = client.fetch([&first, &second]).unwrap_err();

    assert_matches!(
        err,
        CdsError::ServiceUnreachable { ref stage, batches: 2, .. } if stage == "lookup"
    );
}

#[test]
fn cancelled_runs_issue_nothing() {
    let service = MockEntrez::default().with_protein("NP_000001.1", "NM_000001.1");
    let (client, _) = client(service, settings(100, 0));
    client.cancel_token().cancel();
    let key = ncbi("NP_000001.1");

    let found = client.fetch([&key]).unwrap();

    assert!(found[&key].is_empty());
    assert!(client.service().lookup_calls().is_empty());
}

#[test]
fn cancelling_mid_run_lets_the_issued_batch_finish() {
    let token = CancelToken::new();
    let service = MockEntrez {
        cancel_during_fetch: Some(token.clone()),
        ..MockEntrez::default()
            .with_protein("NP_000001.1", "NM_000001.1")
            .with_protein("NP_000002.1", "NM_000002.1")
    };
    let client = RetrievalClient::with_clock(
        service,
        settings(1, 0),
        Arc::new(FakeClock::default()),
        token,
    );
    let keys = [ncbi("NP_000001.1"), ncbi("NP_000002.1")];

    let found = client.fetch(&keys).unwrap();

    assert_eq!(client.service().lookup_calls().len(), 2);
    let fetched = client.service().fetch_calls();
    assert_eq!(fetched.len(), 1);
    let resolved = keys
        .iter()
        .filter(|key| !found[*key].is_empty())
        .collect::<Vec<_>>();
    assert_eq!(resolved.len(), 1);
    assert_eq!(
        found[resolved[0]][0].source_id.as_deref(),
        Some(fetched[0][0].as_str())
    );

    // the finished batch was cached, the one never sent was not
    let again = client.fetch(&keys).unwrap();
    assert_eq!(again, found);
    assert_eq!(client.service().fetch_calls().len(), 1);
    assert!(client.cancel_token().is_cancelled());
}

#[test]
fn concurrent_batches_keep_results_per_key() {
    let mut service = MockEntrez::default();
    let mut keys = Vec::new();
    for idx in 1..=6 {
        let protein = format!("NP_00000{idx}.1");
        let nucleotide = format!("NM_00000{idx}.1");
        service = service.with_protein(&protein, &nucleotide);
        keys.push(ncbi(&protein));
    }
    let settings = RetrievalSettings {
        concurrency: 3,
        ..settings(2, 0)
    };
    let (client, _) = client(service, settings);

    let found = client.fetch(&keys).unwrap();

    assert_eq!(client.service().lookup_calls().len(), 3);
    for (idx, key) in keys.iter().enumerate() {
        let expected = format!("NM_00000{}.1", idx + 1);
        assert_eq!(found[key][0].source_id.as_deref(), Some(expected.as_str()));
    }
}
