//! Deterministic cache key derivation.
//!
//! ## Key Formats
//!
//! - Entity field lookups: `{entity_type}:{entity_id}:{field}`,
//!   e.g. `student:8c1f...:bio`
//! - Endpoint lookups: `api:{version}:{endpoint}:{hash}`,
//!   e.g. `api:v3:students.search:5d41402abc4b2a76`
//!
//! The hash is the first 16 hex characters of the SHA-256 of the canonical
//! parameter encoding: JSON with object keys sorted at every depth, so the
//! same parameter values produce the same key regardless of insertion order.

use std::fmt::Write as _;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CacheError, CacheResult};

/// Namespace prefix of endpoint keys.
pub const API_NAMESPACE: &str = "api";

/// Number of hex characters kept from the parameter digest (64 bits).
const HASH_HEX_LEN: usize = 16;

/// A parsed cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKey<'a> {
    Api {
        version: &'a str,
        endpoint: &'a str,
        hash: &'a str,
    },
    Entity {
        entity_type: &'a str,
        entity_id: &'a str,
        field: &'a str,
    },
}

impl<'a> CacheKey<'a> {
    /// Parses a key produced by [`CacheKeyBuilder`]. Returns `None` for keys
    /// of any other shape.
    pub fn parse(key: &'a str) -> Option<Self> {
        if let Some(rest) = key
            .strip_prefix(API_NAMESPACE)
            .and_then(|r| r.strip_prefix(':'))
        {
            let mut parts = rest.splitn(3, ':');
            let version = parts.next().filter(|s| !s.is_empty())?;
            let endpoint = parts.next().filter(|s| !s.is_empty())?;
            let hash = parts.next().filter(|s| !s.is_empty())?;
            return Some(Self::Api {
                version,
                endpoint,
                hash,
            });
        }

        // Entity ids may themselves contain ':', so split on the outer ones.
        let (entity_type, rest) = key.split_once(':')?;
        let (entity_id, field) = rest.rsplit_once(':')?;
        if entity_type.is_empty() || entity_id.is_empty() || field.is_empty() {
            return None;
        }
        Some(Self::Entity {
            entity_type,
            entity_id,
            field,
        })
    }

    /// Grouping label used by detailed statistics: the endpoint id for API
    /// keys, the entity type for entity keys.
    pub fn group(&self) -> String {
        match self {
            Self::Api { endpoint, .. } => format!("{API_NAMESPACE}:{endpoint}"),
            Self::Entity { entity_type, .. } => format!("entity:{entity_type}"),
        }
    }
}

/// Builds stable cache keys around a process-wide version tag.
///
/// The version is swappable at runtime; keys built before a swap stop being
/// produced and their entries become unreachable.
#[derive(Debug)]
pub struct CacheKeyBuilder {
    version: ArcSwap<String>,
}

impl CacheKeyBuilder {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: ArcSwap::from_pointee(version.into()),
        }
    }

    pub fn version(&self) -> Arc<String> {
        self.version.load_full()
    }

    /// Replaces the version tag, returning the previous one.
    pub fn set_version(&self, version: impl Into<String>) -> CacheResult<Arc<String>> {
        let version = version.into();
        validate_component("version", &version)?;
        Ok(self.version.swap(Arc::new(version)))
    }

    /// Key for a single field of a single entity.
    pub fn entity_key(entity_type: &str, entity_id: &str, field: &str) -> CacheResult<String> {
        validate_component("entity type", entity_type)?;
        validate_component("field", field)?;
        if entity_type == API_NAMESPACE {
            return Err(CacheError::InvalidKey(format!(
                "entity type '{API_NAMESPACE}' is reserved"
            )));
        }
        if entity_id.is_empty() {
            return Err(CacheError::InvalidKey("entity id must not be empty".into()));
        }
        Ok(format!("{entity_type}:{entity_id}:{field}"))
    }

    /// Key for an endpoint response with the given parameter set.
    pub fn api_key<P>(&self, endpoint: &str, params: &P) -> CacheResult<String>
    where
        P: Serialize + ?Sized,
    {
        validate_component("endpoint", endpoint)?;
        let hash = Self::params_hash(params)?;
        Ok(format!(
            "{API_NAMESPACE}:{}:{endpoint}:{hash}",
            self.version.load()
        ))
    }

    /// Content hash of a parameter set.
    pub fn params_hash<P>(params: &P) -> CacheResult<String>
    where
        P: Serialize + ?Sized,
    {
        let canonical = Self::canonical_params(params)?;
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = hex::encode(digest);
        hash.truncate(HASH_HEX_LEN);
        Ok(hash)
    }

    /// Canonical encoding of a parameter set: JSON with sorted object keys.
    pub fn canonical_params<P>(params: &P) -> CacheResult<String>
    where
        P: Serialize + ?Sized,
    {
        let value = serde_json::to_value(params)?;
        let mut out = String::new();
        write_canonical(&value, &mut out)?;
        Ok(out)
    }
}

fn validate_component(what: &str, value: &str) -> CacheResult<()> {
    if value.is_empty() {
        return Err(CacheError::InvalidKey(format!("{what} must not be empty")));
    }
    if value.contains(':') {
        return Err(CacheError::InvalidKey(format!(
            "{what} '{value}' must not contain ':'"
        )));
    }
    Ok(())
}

fn write_canonical(value: &Value, out: &mut String) -> CacheResult<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(value, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Null => out.push_str("null"),
    }
    Ok(())
}
