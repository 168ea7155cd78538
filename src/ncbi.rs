use std::collections::HashMap;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CdsError;
use crate::genbank::{NucleotideRecord, parse_coded_by, parse_genbank};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const TOOL: &str = "kira-cds";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LookupKind {
    /// Protein accession to the nucleotide record(s) coding it.
    ProteinAccession,
    /// Gene name / locus tag to nucleotide records mentioning it.
    GeneName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Lookup(LookupKind),
    Fetch,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Lookup(LookupKind::ProteinAccession) => write!(f, "protein lookup"),
            RequestKind::Lookup(LookupKind::GeneName) => write!(f, "gene lookup"),
            RequestKind::Fetch => write!(f, "record fetch"),
        }
    }
}

/// Remote sequence database. Terms absent from a successful response map to
/// nothing; only transport or protocol failures are errors.
pub trait SequenceService: Send + Sync {
    fn lookup(
        &self,
        kind: LookupKind,
        terms: &[String],
    ) -> Result<HashMap<String, Vec<String>>, CdsError>;

    fn fetch_records(&self, accessions: &[String]) -> Result<Vec<NucleotideRecord>, CdsError>;

    /// Upper bound on terms per request, if the service imposes one.
    fn batch_limit(&self, _kind: RequestKind) -> Option<usize> {
        None
    }
}

impl<S: SequenceService + ?Sized> SequenceService for std::sync::Arc<S> {
    fn lookup(
        &self,
        kind: LookupKind,
        terms: &[String],
    ) -> Result<HashMap<String, Vec<String>>, CdsError> {
        (**self).lookup(kind, terms)
    }

    fn fetch_records(&self, accessions: &[String]) -> Result<Vec<NucleotideRecord>, CdsError> {
        (**self).fetch_records(accessions)
    }

    fn batch_limit(&self, kind: RequestKind) -> Option<usize> {
        (**self).batch_limit(kind)
    }
}

#[derive(Clone)]
pub struct EntrezHttpClient {
    client: Client,
    base_url: String,
    email: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    esearchresult: SearchResult,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

impl EntrezHttpClient {
    pub fn new(email: &str, api_key: Option<String>) -> Result<Self, CdsError> {
        Self::with_base_url(email, api_key, EUTILS_BASE)
    }

    pub fn with_base_url(
        email: &str,
        api_key: Option<String>,
        base_url: &str,
    ) -> Result<Self, CdsError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("{TOOL}/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CdsError::EntrezHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| CdsError::EntrezHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            email: email.to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("tool", TOOL.to_string()), ("email", self.email.clone())];
        if let Some(api_key) = &self.api_key {
            params.push(("api_key", api_key.clone()));
        }
        params
    }

    /// One attempt; retrying belongs to the caller's retry policy.
    fn send(&self, request: RequestBuilder) -> Result<Response, CdsError> {
        let response = request.send().map_err(map_transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Entrez request failed".to_string());
            return Err(CdsError::EntrezStatus { status, message });
        }
        Ok(response)
    }

    fn efetch(&self, db: &str, rettype: &str, ids: &[String]) -> Result<String, CdsError> {
        let url = format!("{}/efetch.fcgi", self.base_url);
        let mut form = self.common_params();
        form.push(("db", db.to_string()));
        form.push(("rettype", rettype.to_string()));
        form.push(("retmode", "text".to_string()));
        form.push(("id", ids.join(",")));
        debug!(db, rettype, count = ids.len(), "efetch");
        let response = self.send(self.client.post(&url).form(&form))?;
        response.text().map_err(map_transport_error)
    }

    fn esearch_accessions(&self, term: &str) -> Result<Vec<String>, CdsError> {
        let url = format!("{}/esearch.fcgi", self.base_url);
        let mut query = self.common_params();
        query.push(("db", "nuccore".to_string()));
        query.push(("idtype", "acc".to_string()));
        query.push(("retmode", "json".to_string()));
        query.push(("retmax", "20".to_string()));
        query.push(("term", term.to_string()));
        debug!(term, "esearch");
        let response = self.send(self.client.get(&url).query(&query))?;
        let envelope: SearchEnvelope = response
            .json()
            .map_err(|err| CdsError::EntrezDecode(err.to_string()))?;
        Ok(envelope.esearchresult.idlist)
    }
}

impl SequenceService for EntrezHttpClient {
    fn lookup(
        &self,
        kind: LookupKind,
        terms: &[String],
    ) -> Result<HashMap<String, Vec<String>>, CdsError> {
        match kind {
            LookupKind::ProteinAccession => {
                let text = self.efetch("protein", "gp", terms)?;
                let coded_by = parse_coded_by(&text);
                Ok(terms
                    .iter()
                    .map(|term| {
                        let found = coded_by.get(term.as_str()).cloned().unwrap_or_default();
                        if found.is_empty() && term.starts_with("WP_") {
                            warn_identical_protein_group(term);
                        }
                        (term.clone(), found)
                    })
                    .collect())
            }
            LookupKind::GeneName => {
                let mut results = HashMap::new();
                for term in terms {
                    results.insert(term.clone(), self.esearch_accessions(term)?);
                }
                Ok(results)
            }
        }
    }

    fn fetch_records(&self, accessions: &[String]) -> Result<Vec<NucleotideRecord>, CdsError> {
        let text = self.efetch("nuccore", "gbwithparts", accessions)?;
        parse_genbank(text.as_bytes())
    }

    fn batch_limit(&self, kind: RequestKind) -> Option<usize> {
        match kind {
            RequestKind::Lookup(LookupKind::GeneName) => Some(1),
            _ => None,
        }
    }
}

fn warn_identical_protein_group(accession: &str) {
    warn!(
        accession,
        "WP_ accessions are non-redundant RefSeq proteins (Identical Protein Groups) \
         and often have no single coding nucleotide record"
    );
}

fn map_transport_error(err: reqwest::Error) -> CdsError {
    if is_retryable_error(&err) {
        CdsError::EntrezHttp(err.to_string())
    } else {
        CdsError::EntrezDecode(err.to_string())
    }
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gene_lookups_are_single_term() {
        let client = EntrezHttpClient::new("someone@example.org", None).unwrap();
        assert_eq!(
            client.batch_limit(RequestKind::Lookup(LookupKind::GeneName)),
            Some(1)
        );
        assert_eq!(client.batch_limit(RequestKind::Fetch), None);
    }

    #[test]
    fn api_key_joins_common_params() {
        let client =
            EntrezHttpClient::with_base_url("a@b.org", Some("k123".to_string()), "http://x/")
                .unwrap();
        let params = client.common_params();
        assert!(params.contains(&("api_key", "k123".to_string())));
        assert_eq!(client.base_url, "http://x");
        let blank = EntrezHttpClient::new("a@b.org", Some("  ".to_string())).unwrap();
        assert!(!blank.common_params().iter().any(|(key, _)| *key == "api_key"));
    }

    #[test]
    fn decode_search_envelope() {
        let body = r#"{"header":{},"esearchresult":{"count":"2","idlist":["NM_1.1","NC_2.3"]}}"#;
        let envelope: SearchEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.esearchresult.idlist, vec!["NM_1.1", "NC_2.3"]);
    }
}
