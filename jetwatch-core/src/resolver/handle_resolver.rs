//! DID → handle resolution against did:web well-known documents and the
//! configured did:plc directory.

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::resolver::cache::HandleCache;
use crate::types::{Did, Handle};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_CAPACITY: usize = 10_000;

/// Minimal shape of a DID document / audit-log entry: only the alias list
/// we derive a handle from.
#[derive(Debug, Deserialize)]
struct DidDocument {
    #[serde(default, rename = "alsoKnownAs")]
    also_known_as: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuditLogEntry {
    #[serde(default, rename = "alsoKnownAs")]
    also_known_as: Vec<String>,
}

fn handle_from_aliases(aliases: &[String]) -> Option<Handle> {
    aliases
        .iter()
        .find_map(|alias| alias.strip_prefix("at://"))
        .map(Handle::from)
}

pub struct HandleResolver {
    http: reqwest::Client,
    plc_directory_host: String,
    cache: Mutex<HandleCache>,
}

impl HandleResolver {
    pub fn new(plc_directory_host: impl Into<String>) -> Self {
        Self::with_timeout(plc_directory_host, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(plc_directory_host: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder config is static and valid");
        Self {
            http,
            plc_directory_host: plc_directory_host.into(),
            cache: Mutex::new(HandleCache::new(CACHE_CAPACITY)),
        }
    }

    fn document_url(&self, did: &Did) -> String {
        match did.web_host() {
            Some(host) => format!("https://{host}/.well-known/did.json"),
            None => format!("https://{}/{did}", self.plc_directory_host),
        }
    }

    fn audit_log_url(&self, did: &Did) -> String {
        format!("https://{}/{did}/log", self.plc_directory_host)
    }

    /// Current handle for `did`. A lookup failure resolves
    /// to `None` (and is cached as such) rather than propagating an error —
    /// the resolver is explicitly best-effort.
    pub async fn resolve(&self, did: &Did) -> Option<Handle> {
        if let Some(cached) = self.cache_get(did) {
            return cached;
        }
        let result = self.fetch_current_handle(did).await;
        self.cache_put(did.clone(), result.clone());
        result
    }

    /// Previous handle, derived from the second-newest audit-log entry.
    /// Not cached under the same key as `resolve` — a separate lookup path
    /// entirely, so it bypasses the positive/negative cache rather than
    /// polluting current-handle results.
    pub async fn resolve_previous(&self, did: &Did) -> Option<Handle> {
        let url = self.audit_log_url(did);
        let entries = self.fetch_audit_log(&url).await?;
        let second = entries.get(1)?;
        handle_from_aliases(&second.also_known_as)
    }

    pub async fn resolve_many(&self, dids: &[Did]) -> Vec<(Did, Option<Handle>)> {
        let mut out = Vec::with_capacity(dids.len());
        for did in dids {
            out.push((did.clone(), self.resolve(did).await));
        }
        out
    }

    async fn fetch_current_handle(&self, did: &Did) -> Option<Handle> {
        let url = self.document_url(did);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<DidDocument>().await {
                Ok(doc) => handle_from_aliases(&doc.also_known_as),
                Err(err) => {
                    warn!(%did, %err, "malformed DID document");
                    None
                }
            },
            Ok(resp) => {
                warn!(%did, status = %resp.status(), "DID document fetch failed");
                None
            }
            Err(err) => {
                warn!(%did, %err, "DID document fetch errored");
                None
            }
        }
    }

    async fn fetch_audit_log(&self, url: &str) -> Option<Vec<AuditLogEntry>> {
        match self.http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Vec<AuditLogEntry>>().await.ok(),
            Ok(resp) => {
                warn!(status = %resp.status(), "audit log fetch failed");
                None
            }
            Err(err) => {
                warn!(%err, "audit log fetch errored");
                None
            }
        }
    }

    fn cache_get(&self, did: &Did) -> Option<Option<Handle>> {
        self.cache.lock().expect("cache mutex poisoned").get(did)
    }

    fn cache_put(&self, did: Did, handle: Option<Handle>) {
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .insert(did, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_handle_from_first_at_alias() {
        let aliases = vec![
            "https://alice.example".to_string(),
            "at://alice.example".to_string(),
        ];
        assert_eq!(
            handle_from_aliases(&aliases),
            Some(Handle::from("alice.example"))
        );
    }

    #[test]
    fn no_at_alias_resolves_to_none() {
        let aliases = vec!["https://alice.example".to_string()];
        assert_eq!(handle_from_aliases(&aliases), None);
    }

    #[test]
    fn did_web_document_url_uses_well_known_path() {
        let resolver = HandleResolver::new("plc.example");
        let did = Did::new("did:web:alice.example");
        assert_eq!(
            resolver.document_url(&did),
            "https://alice.example/.well-known/did.json"
        );
    }

    #[test]
    fn did_plc_document_url_uses_configured_directory() {
        let resolver = HandleResolver::new("plc.example");
        let did = Did::new("did:plc:abc123");
        assert_eq!(
            resolver.document_url(&did),
            "https://plc.example/did:plc:abc123"
        );
    }
}
