use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CdsError;
use crate::genbank::NucleotideRecord;
use crate::ncbi::{LookupKind, RequestKind, SequenceService};

pub const DEFAULT_CACHE_STEM: &str = "ncfpcache";

/// On-disk cache shared between runs, laid out under
/// `<cache_dir>/<cache_stem>/{lookups,records}`.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLookup {
    pub term: String,
    pub accessions: Vec<String>,
    pub stored_at: String,
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: NucleotideRecord,
    pub stored_at: String,
    pub tool: String,
}

impl Store {
    pub fn default_cache_dir() -> Result<Utf8PathBuf, CdsError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-cds")).ok()
            })
            .ok_or_else(|| CdsError::Filesystem("unable to resolve cache directory".to_string()))
    }

    /// Opens the cache, wiping whatever a previous run left unless `keep`.
    pub fn open(cache_dir: &Utf8Path, stem: &str, keep: bool) -> Result<Self, CdsError> {
        let store = Self {
            root: cache_dir.join(stem),
        };
        if !keep && store.root.as_std_path().exists() {
            info!(path = %store.root, "resetting sequence cache");
            fs::remove_dir_all(store.root.as_std_path())
                .map_err(|err| CdsError::Filesystem(err.to_string()))?;
        }
        fs::create_dir_all(store.root.as_std_path())
            .map_err(|err| CdsError::Filesystem(err.to_string()))?;
        Ok(store)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn lookup_path(&self, kind: LookupKind, term: &str) -> Utf8PathBuf {
        let dir = match kind {
            LookupKind::ProteinAccession => "protein",
            LookupKind::GeneName => "gene",
        };
        self.root
            .join("lookups")
            .join(dir)
            .join(format!("{}.json", file_stem(term)))
    }

    pub fn record_path(&self, accession: &str) -> Utf8PathBuf {
        self.root
            .join("records")
            .join(format!("{}.json", file_stem(accession)))
    }

    pub fn read_lookup(&self, kind: LookupKind, term: &str) -> Option<StoredLookup> {
        read_json::<StoredLookup>(&self.lookup_path(kind, term)).filter(|stored| stored.term == term)
    }

    pub fn write_lookup(
        &self,
        kind: LookupKind,
        term: &str,
        accessions: &[String],
    ) -> Result<(), CdsError> {
        let stored = StoredLookup {
            term: term.to_string(),
            accessions: accessions.to_vec(),
            stored_at: Utc::now().to_rfc3339(),
            tool: tool_name(),
        };
        write_json_atomic(&self.lookup_path(kind, term), &stored)
    }

    pub fn read_record(&self, accession: &str) -> Option<NucleotideRecord> {
        read_json::<StoredRecord>(&self.record_path(accession)).map(|stored| stored.record)
    }

    pub fn write_record(&self, accession: &str, record: &NucleotideRecord) -> Result<(), CdsError> {
        let stored = StoredRecord {
            record: record.clone(),
            stored_at: Utc::now().to_rfc3339(),
            tool: tool_name(),
        };
        write_json_atomic(&self.record_path(accession), &stored)
    }
}

fn tool_name() -> String {
    format!("kira-cds/{}", env!("CARGO_PKG_VERSION"))
}

fn file_stem(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Option<T> {
    let content = fs::read(path.as_std_path()).ok()?;
    match serde_json::from_slice(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%path, error = %err, "ignoring unreadable cache entry");
            None
        }
    }
}

pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), CdsError> {
    let content =
        serde_json::to_vec_pretty(value).map_err(|err| CdsError::Filesystem(err.to_string()))?;
    write_bytes_atomic(path, &content)
}

pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CdsError> {
    let parent = path
        .parent()
        .ok_or_else(|| CdsError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CdsError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".kira-cds")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CdsError::Filesystem(err.to_string()))?;
    std::io::Write::write_all(&mut temp, content)
        .map_err(|err| CdsError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CdsError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Serves lookups and records from a [`Store`] where possible and records
/// everything the wrapped service returns.
pub struct CachedService<S> {
    inner: S,
    store: Store,
}

impl<S> CachedService<S> {
    pub fn new(inner: S, store: Store) -> Self {
        Self { inner, store }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl<S: SequenceService> SequenceService for CachedService<S> {
    fn lookup(
        &self,
        kind: LookupKind,
        terms: &[String],
    ) -> Result<HashMap<String, Vec<String>>, CdsError> {
        let mut results = HashMap::new();
        let mut misses = Vec::new();
        for term in terms {
            match self.store.read_lookup(kind, term) {
                Some(stored) => {
                    results.insert(term.clone(), stored.accessions);
                }
                None => misses.push(term.clone()),
            }
        }
        debug!(?kind, hits = results.len(), misses = misses.len(), "lookup cache");
        if misses.is_empty() {
            return Ok(results);
        }

        let fetched = self.inner.lookup(kind, &misses)?;
        for term in &misses {
            let accessions = fetched.get(term).cloned().unwrap_or_default();
            self.store.write_lookup(kind, term, &accessions)?;
            results.insert(term.clone(), accessions);
        }
        Ok(results)
    }

    fn fetch_records(&self, accessions: &[String]) -> Result<Vec<NucleotideRecord>, CdsError> {
        let mut records = Vec::new();
        let mut misses = Vec::new();
        for accession in accessions {
            match self.store.read_record(accession) {
                Some(record) => records.push(record),
                None => misses.push(accession.clone()),
            }
        }
        debug!(hits = records.len(), misses = misses.len(), "record cache");
        if misses.is_empty() {
            return Ok(records);
        }

        let fetched = self.inner.fetch_records(&misses)?;
        for record in &fetched {
            let requested = misses.iter().find(|accession| {
                *accession == &record.accession
                    || crate::genbank::bare_accession(accession)
                        == crate::genbank::bare_accession(&record.accession)
            });
            if let Some(accession) = requested {
                self.store.write_record(accession, record)?;
            }
        }
        records.extend(fetched);
        Ok(records)
    }

    fn batch_limit(&self, kind: RequestKind) -> Option<usize> {
        self.inner.batch_limit(kind)
    }
}
