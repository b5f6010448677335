use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::registry::BoxFuture;
use crate::error::Result;

/// Persisted cluster version record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Version the cluster schema has been upgraded to.
    pub version: String,
    /// When the record was last written.
    #[serde(default)]
    pub upgraded_at: Option<DateTime<Utc>>,
    /// Host name of the node that wrote it.
    #[serde(default)]
    pub upgraded_by: Option<String>,
}

impl ServerInfo {
    /// A record for `version` stamped now.
    pub fn new(version: impl Into<String>, upgraded_by: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            upgraded_at: Some(Utc::now()),
            upgraded_by: Some(upgraded_by.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Key/value access to the persisted version record.
pub trait VersionStore: Send + Sync + 'static {
    /// Read a value. `None` when the key has never been written.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Write a value, replacing any previous one.
    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>>;
}

/// Compare dotted versions segment by segment.
///
/// A leading `v` and any `-pre`/`+build` suffix are ignored. Missing
/// segments count as zero, so `2.0` equals `2.0.0`. Numeric segments
/// compare numerically, anything else lexically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a = segments(a);
    let b = segments(b);
    let len = a.len().max(b.len());

    for i in 0..len {
        let left = a.get(i).copied().unwrap_or("0");
        let right = b.get(i).copied().unwrap_or("0");
        let ord = match (left.parse::<u64>(), right.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => left.cmp(right),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    Ordering::Equal
}

fn segments(version: &str) -> Vec<&str> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    let core = version
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();
    if core.is_empty() {
        return Vec::new();
    }
    core.split('.').collect()
}
