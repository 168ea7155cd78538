use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::OutputIdSource;
use crate::error::CdsError;
use crate::retrieval::{RetrievalSettings, RetryPolicy};
use crate::store::{DEFAULT_CACHE_STEM, Store};
use crate::translate::MatchRules;

pub const DEFAULT_CONFIG_FILE: &str = "kira-cds.json";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 500;
pub const DEFAULT_RETRIES: usize = 10;
pub const MAX_RETRIES: usize = 50;
pub const DEFAULT_CONCURRENCY: usize = 2;
pub const MAX_CONCURRENCY: usize = 8;
pub const DEFAULT_FILESTEM: &str = "ncfp";
pub const DEFAULT_SKIPPED_FNAME: &str = "skipped.fasta";

/// NCBI allows 3 requests/s without an API key and 10 with one.
const MIN_INTERVAL_MS: u64 = 334;
const MIN_INTERVAL_WITH_KEY_MS: u64 = 100;
const DEFAULT_INTERVAL_MS: u64 = 340;
const DEFAULT_INTERVAL_WITH_KEY_MS: u64 = 110;

/// Settings as read from `kira-cds.json` or collected from the command line.
/// Every field is optional; [`ConfigLoader::resolve`] fills in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub stockholm: Option<bool>,
    #[serde(default)]
    pub output_id: Option<OutputIdSource>,
    #[serde(default)]
    pub alternative_start_codon: Option<bool>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub retries: Option<usize>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub cache_stem: Option<String>,
    #[serde(default)]
    pub keep_cache: Option<bool>,
    #[serde(default)]
    pub filestem: Option<String>,
    #[serde(default)]
    pub skipped_fname: Option<String>,
}

impl Config {
    /// Field-wise merge where `overrides` wins.
    pub fn merge(self, overrides: Config) -> Config {
        Config {
            schema_version: overrides.schema_version.or(self.schema_version),
            stockholm: overrides.stockholm.or(self.stockholm),
            output_id: overrides.output_id.or(self.output_id),
            alternative_start_codon: overrides
                .alternative_start_codon
                .or(self.alternative_start_codon),
            batch_size: overrides.batch_size.or(self.batch_size),
            retries: overrides.retries.or(self.retries),
            rate_limit_ms: overrides.rate_limit_ms.or(self.rate_limit_ms),
            concurrency: overrides.concurrency.or(self.concurrency),
            email: overrides.email.or(self.email),
            api_key: overrides.api_key.or(self.api_key),
            cache_dir: overrides.cache_dir.or(self.cache_dir),
            cache_stem: overrides.cache_stem.or(self.cache_stem),
            keep_cache: overrides.keep_cache.or(self.keep_cache),
            filestem: overrides.filestem.or(self.filestem),
            skipped_fname: overrides.skipped_fname.or(self.skipped_fname),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub dir: Utf8PathBuf,
    pub stem: String,
    pub keep: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    pub filestem: String,
    pub skipped_fname: String,
}

impl OutputNames {
    pub fn protein_path(&self, outdir: &Utf8Path) -> Utf8PathBuf {
        outdir.join(format!("{}_aa.fasta", self.filestem))
    }

    pub fn nucleotide_path(&self, outdir: &Utf8Path) -> Utf8PathBuf {
        outdir.join(format!("{}_nt.fasta", self.filestem))
    }

    pub fn skipped_path(&self, outdir: &Utf8Path) -> Utf8PathBuf {
        outdir.join(&self.skipped_fname)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub schema_version: u32,
    pub stockholm: bool,
    pub output_id: OutputIdSource,
    pub rules: MatchRules,
    pub retrieval: RetrievalSettings,
    pub email: Option<String>,
    pub api_key: Option<String>,
    /// `None` when no cache directory could be resolved.
    pub cache: Option<CacheSettings>,
    pub outputs: OutputNames,
}

impl RunConfig {
    /// NCBI Entrez requires a contact address on every request.
    pub fn require_email(&self) -> Result<&str, CdsError> {
        self.email.as_deref().ok_or_else(|| {
            CdsError::InvalidConfig(
                "an email address is required to query NCBI (--email)".to_string(),
            )
        })
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file. Without an explicit path a missing
    /// `kira-cds.json` is not an error.
    pub fn load(path: Option<&Utf8Path>) -> Result<Config, CdsError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Utf8PathBuf::from(DEFAULT_CONFIG_FILE),
        };
        if path.is_none() && !config_path.as_std_path().exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| CdsError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        serde_json::from_str(&content).map_err(|err| CdsError::ConfigParse(err.to_string()))
    }

    pub fn resolve(
        file: Config,
        overrides: Config,
        env_api_key: Option<String>,
    ) -> Result<RunConfig, CdsError> {
        let config = file.merge(overrides);
        let api_key = config
            .api_key
            .or(env_api_key)
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());

        let batch_size = config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(CdsError::InvalidConfig(format!(
                "batch size must be between 1 and {MAX_BATCH_SIZE}, got {batch_size}"
            )));
        }
        let retries = config.retries.unwrap_or(DEFAULT_RETRIES);
        if retries > MAX_RETRIES {
            return Err(CdsError::InvalidConfig(format!(
                "retry count must be at most {MAX_RETRIES}, got {retries}"
            )));
        }
        let concurrency = config.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
        if !(1..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(CdsError::InvalidConfig(format!(
                "concurrency must be between 1 and {MAX_CONCURRENCY}, got {concurrency}"
            )));
        }

        let (default_interval, min_interval) = match api_key {
            Some(_) => (DEFAULT_INTERVAL_WITH_KEY_MS, MIN_INTERVAL_WITH_KEY_MS),
            None => (DEFAULT_INTERVAL_MS, MIN_INTERVAL_MS),
        };
        let rate_limit_ms = config.rate_limit_ms.unwrap_or(default_interval);
        if rate_limit_ms < min_interval {
            return Err(CdsError::InvalidConfig(format!(
                "rate limit interval {rate_limit_ms} ms is below the NCBI minimum of \
                 {min_interval} ms{}",
                if api_key.is_some() {
                    ""
                } else {
                    " without an API key"
                }
            )));
        }

        let email = config
            .email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty());
        if let Some(email) = &email {
            if !email.contains('@') {
                return Err(CdsError::InvalidConfig(format!(
                    "email address {email:?} is not valid"
                )));
            }
        }

        let keep = config.keep_cache.unwrap_or(false);
        let stem = config
            .cache_stem
            .unwrap_or_else(|| DEFAULT_CACHE_STEM.to_string());
        if stem.trim().is_empty() || stem.contains('/') {
            return Err(CdsError::InvalidConfig(format!(
                "cache stem {stem:?} must be a plain directory name"
            )));
        }
        let cache_dir = match config.cache_dir {
            Some(dir) => Some(dir),
            None => Store::default_cache_dir().ok(),
        };
        let cache = match cache_dir {
            Some(dir) => Some(CacheSettings { dir, stem, keep }),
            None if keep => {
                return Err(CdsError::InvalidConfig(
                    "keep_cache requires a usable cache directory (--cache-dir)".to_string(),
                ));
            }
            None => None,
        };

        let filestem = config
            .filestem
            .unwrap_or_else(|| DEFAULT_FILESTEM.to_string());
        let skipped_fname = config
            .skipped_fname
            .unwrap_or_else(|| DEFAULT_SKIPPED_FNAME.to_string());
        for (label, name) in [("filestem", &filestem), ("skipped file name", &skipped_fname)] {
            if name.trim().is_empty() || name.contains('/') {
                return Err(CdsError::InvalidConfig(format!(
                    "{label} {name:?} must be a plain file name"
                )));
            }
        }

        Ok(RunConfig {
            schema_version: config.schema_version.unwrap_or(1),
            stockholm: config.stockholm.unwrap_or(false),
            output_id: config.output_id.unwrap_or_default(),
            rules: MatchRules {
                alternative_start: config.alternative_start_codon.unwrap_or(false),
            },
            retrieval: RetrievalSettings {
                batch_size,
                concurrency,
                retry: RetryPolicy {
                    max_retries: retries,
                    ..RetryPolicy::default()
                },
                rate_limit: Duration::from_millis(rate_limit_ms),
            },
            email,
            api_key,
            cache,
            outputs: OutputNames {
                filestem,
                skipped_fname,
            },
        })
    }
}
