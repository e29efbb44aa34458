//! Cloud object inputs.
//!
//! Objects are addressed as `scheme://bucket/key`. Each scheme maps to an
//! [`ObjectStore`] registered with the run; bulkflow ships no vendor SDK
//! bindings, only the seam and an in-memory [`MemoryObjectStore`] for tests
//! and local fixtures.
//!
//! The trait is synchronous: readers it returns are consumed by decoders on
//! the blocking pool, the same place local files are read. Implementations
//! backed by async SDKs can block on their own runtime handle internally.
//!
//! A URL whose key ends in `/` is a prefix and expands to every object under
//! it; a key containing `*` or `?` is a glob (`*` stays within one path
//! segment, `**` crosses segments). Expansion results are sorted.

mod memory;

pub use memory::MemoryObjectStore;

use crate::error::{IngestError, Result};
use crate::io::compression::DynRead;
use anyhow::Context;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

/// Read access to one object storage provider.
pub trait ObjectStore: Send + Sync {
    /// Open a forward-only reader over an object's bytes.
    ///
    /// # Errors
    /// Returns an error if the object is missing or unreadable.
    fn open(&self, bucket: &str, key: &str) -> anyhow::Result<DynRead>;

    /// List objects whose key starts with `prefix`.
    ///
    /// # Errors
    /// Returns an error if the bucket cannot be listed.
    fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectMeta>>;

    /// Read a whole object into memory. Parquet needs this.
    ///
    /// # Errors
    /// As for [`open`](Self::open), plus read failures.
    fn fetch(&self, bucket: &str, key: &str) -> anyhow::Result<Bytes> {
        let mut buf = Vec::new();
        self.open(bucket, key)?
            .read_to_end(&mut buf)
            .with_context(|| format!("read {bucket}/{key}"))?;
        Ok(Bytes::from(buf))
    }
}

/// A parsed `scheme://bucket/key` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudUrl {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl CloudUrl {
    /// Parse `scheme://bucket/key`. The key may be empty (whole bucket).
    ///
    /// # Errors
    /// Returns [`IngestError::Config`] if the string is not of that shape.
    pub fn parse(url: &str) -> Result<Self> {
        let bad = || IngestError::Config(format!("not a cloud object URL: {url}"));
        let (scheme, rest) = url.split_once("://").ok_or_else(bad)?;
        if !is_scheme(scheme) {
            return Err(bad());
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Key ends in `/` or is empty.
    #[must_use]
    pub fn is_prefix(&self) -> bool {
        self.key.is_empty() || self.key.ends_with('/')
    }

    #[must_use]
    pub fn is_pattern(&self) -> bool {
        self.key.contains(['*', '?'])
    }

    fn with_key(&self, key: String) -> Self {
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key,
        }
    }
}

impl fmt::Display for CloudUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// True if `s` looks like `scheme://...`. Single-letter schemes are
/// rejected so Windows drive paths are never mistaken for URLs.
#[must_use]
pub fn is_cloud_url(s: &str) -> bool {
    s.split_once("://")
        .is_some_and(|(scheme, _)| scheme.len() > 1 && is_scheme(scheme))
}

/// Object stores available to a run, keyed by URL scheme.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn ObjectStore>>,
}

impl StoreRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.stores.insert(scheme.into().to_ascii_lowercase(), store);
    }

    /// # Errors
    /// An unregistered scheme is a configuration error.
    pub fn get(&self, scheme: &str) -> Result<Arc<dyn ObjectStore>> {
        self.stores.get(scheme).cloned().ok_or_else(|| {
            IngestError::Config(format!("no object store registered for scheme {scheme}://"))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.stores.keys().collect();
        schemes.sort();
        f.debug_struct("StoreRegistry")
            .field("schemes", &schemes)
            .finish()
    }
}

/// Expand a URL into the concrete objects it names, sorted by key.
///
/// A plain key expands to itself without touching the store.
///
/// # Errors
/// Returns listing failures and invalid patterns.
pub fn expand(store: &dyn ObjectStore, url: &CloudUrl) -> anyhow::Result<Vec<CloudUrl>> {
    if url.is_pattern() {
        let regex = Regex::new(&glob_to_regex(&url.key))
            .with_context(|| format!("invalid glob pattern '{}'", url.key))?;
        let prefix = url.key.find(['*', '?']).map_or("", |pos| &url.key[..pos]);
        let mut keys: Vec<String> = store
            .list(&url.bucket, prefix)
            .with_context(|| format!("list {}://{}/{prefix}", url.scheme, url.bucket))?
            .into_iter()
            .map(|m| m.key)
            .filter(|k| regex.is_match(k))
            .collect();
        keys.sort();
        return Ok(keys.into_iter().map(|k| url.with_key(k)).collect());
    }
    if url.is_prefix() {
        let mut keys: Vec<String> = store
            .list(&url.bucket, &url.key)
            .with_context(|| format!("list {url}"))?
            .into_iter()
            .map(|m| m.key)
            .filter(|k| !k.ends_with('/') && !is_hidden_key(k))
            .collect();
        keys.sort();
        return Ok(keys.into_iter().map(|k| url.with_key(k)).collect());
    }
    Ok(vec![url.clone()])
}

fn is_hidden_key(key: &str) -> bool {
    key.rsplit('/').next().is_some_and(|n| n.starts_with('.'))
}

/// `*` → `[^/]*`, `**` → `.*`, `?` → `.`; everything else literal.
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex
}
