//! Schema registry: subject/version/id bookkeeping,
//! compatibility-mode enforcement, and the wire envelope producers
//! stamp onto every record.
//!
//! Grounded on `crates/lumadb-security/src/manager.rs`'s
//! session-table-over-a-lock shape, generalized from sessions to
//! schema versions, and on [`crate::lru`]/[`crate::persistence`] for
//! the id cache and the on-disk subject table respectively.

mod compatibility;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lru::LruCache;
use crate::metrics::BrokerMetrics;
use crate::persistence::{read_or_default, write_atomic};
use crate::types::{CompatibilityMode, SchemaType};

pub use compatibility::FieldDef;

/// A pointer from one schema to a version of another subject it
/// imports, the way Avro/Protobuf schemas compose by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaReference {
    pub name: String,
    pub subject: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub id: u32,
    pub subject: String,
    pub version: u32,
    pub schema_type: SchemaType,
    pub definition: String,
    #[serde(default)]
    pub references: Option<Vec<SchemaReference>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    next_id: u32,
    subjects: HashMap<String, Vec<Schema>>,
    compatibility_overrides: HashMap<String, CompatibilityMode>,
}

pub struct SchemaRegistry {
    path: Option<PathBuf>,
    state: RwLock<RegistryState>,
    default_compatibility: CompatibilityMode,
    cache: LruCache<u32, Schema>,
    metrics: Arc<BrokerMetrics>,
}

impl SchemaRegistry {
    pub fn new(default_compatibility: CompatibilityMode, cache_size: usize) -> Self {
        Self {
            path: None,
            state: RwLock::new(RegistryState::default()),
            default_compatibility,
            cache: LruCache::new(cache_size, None),
            metrics: Arc::new(BrokerMetrics::new()),
        }
    }

    /// Redirects this registry's counters into a shared
    /// [`BrokerMetrics`] instead of the private one `new`/`open`
    /// default to.
    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn open(
        path: impl AsRef<Path>,
        default_compatibility: CompatibilityMode,
        cache_size: usize,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state: RegistryState = read_or_default(&path, RegistryState::default())?;
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            default_compatibility,
            cache: LruCache::new(cache_size, None),
            metrics,
        })
    }

    fn persist(&self, state: &RegistryState) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, state)?;
        }
        Ok(())
    }

    /// Registers `definition` under `subject`, checking it against
    /// the effective compatibility mode for every version it must be
    /// compatible with. Registering byte-identical content that is
    /// already the latest version for `subject` is idempotent and
    /// returns the existing id rather than minting a new version.
    /// `references` must each resolve to an already-registered
    /// subject/version pair.
    pub fn register(
        &self,
        subject: &str,
        schema_type: SchemaType,
        definition: &str,
        references: Option<Vec<SchemaReference>>,
    ) -> Result<u32> {
        let mut state = self.state.write();
        let mode = state
            .compatibility_overrides
            .get(subject)
            .copied()
            .unwrap_or(self.default_compatibility);

        if let Some(refs) = &references {
            for reference in refs {
                let exists = state
                    .subjects
                    .get(&reference.subject)
                    .is_some_and(|versions| versions.iter().any(|s| s.version == reference.version));
                if !exists {
                    return Err(Error::NotFound(format!(
                        "referenced schema {} version {} not found",
                        reference.subject, reference.version
                    )));
                }
            }
        }

        let next_version = {
            let versions = state.subjects.entry(subject.to_string()).or_default();
            if let Some(latest) = versions.last() {
                if latest.definition == definition && latest.schema_type == schema_type && latest.references.as_deref() == references.as_deref() {
                    return Ok(latest.id);
                }
            }

            let candidate_fields = compatibility::extract_fields(definition, schema_type)?;
            let checked: Vec<&Schema> = if mode.is_transitive() {
                versions.iter().collect()
            } else {
                versions.last().into_iter().collect()
            };
            for existing in checked {
                let existing_fields = compatibility::extract_fields(&existing.definition, existing.schema_type)?;
                if !compatibility::is_compatible(&existing_fields, &candidate_fields, mode) {
                    return Err(Error::IncompatibleSchema(format!(
                        "version {} of subject {subject} is not {mode:?}-compatible with the new schema",
                        existing.version
                    )));
                }
            }

            versions.last().map(|s| s.version + 1).unwrap_or(1)
        };

        let id = state.next_id;
        state.next_id += 1;
        let version = next_version;
        let schema = Schema {
            id,
            subject: subject.to_string(),
            version,
            schema_type,
            definition: definition.to_string(),
            references,
        };
        state.subjects.entry(subject.to_string()).or_default().push(schema.clone());
        self.persist(&state)?;
        self.cache.put(id, schema);
        Ok(id)
    }

    pub fn get_by_id(&self, id: u32) -> Result<Schema> {
        if let Some(schema) = self.cache.get(&id) {
            self.metrics.schema_cache_hits.inc();
            return Ok(schema);
        }
        self.metrics.schema_cache_misses.inc();
        let state = self.state.read();
        for versions in state.subjects.values() {
            if let Some(schema) = versions.iter().find(|s| s.id == id) {
                self.cache.put(id, schema.clone());
                return Ok(schema.clone());
            }
        }
        Err(Error::NotFound(format!("schema id {id}")))
    }

    pub fn get(&self, subject: &str, version: u32) -> Result<Schema> {
        let state = self.state.read();
        state
            .subjects
            .get(subject)
            .and_then(|versions| versions.iter().find(|s| s.version == version))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{subject} version {version}")))
    }

    pub fn get_latest(&self, subject: &str) -> Result<Schema> {
        let state = self.state.read();
        state
            .subjects
            .get(subject)
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("subject {subject}")))
    }

    pub fn list_versions(&self, subject: &str) -> Result<Vec<u32>> {
        let state = self.state.read();
        state
            .subjects
            .get(subject)
            .map(|versions| versions.iter().map(|s| s.version).collect())
            .ok_or_else(|| Error::NotFound(format!("subject {subject}")))
    }

    pub fn list_subjects(&self) -> Vec<String> {
        self.state.read().subjects.keys().cloned().collect()
    }

    pub fn delete_version(&self, subject: &str, version: u32) -> Result<()> {
        let mut state = self.state.write();
        let versions = state
            .subjects
            .get_mut(subject)
            .ok_or_else(|| Error::NotFound(format!("subject {subject}")))?;
        let before = versions.len();
        versions.retain(|s| s.version != version);
        if versions.len() == before {
            return Err(Error::NotFound(format!("{subject} version {version}")));
        }
        if versions.is_empty() {
            state.subjects.remove(subject);
        }
        self.persist(&state)
    }

    pub fn delete_subject(&self, subject: &str) -> Result<Vec<u32>> {
        let mut state = self.state.write();
        let versions = state
            .subjects
            .remove(subject)
            .ok_or_else(|| Error::NotFound(format!("subject {subject}")))?;
        self.persist(&state)?;
        Ok(versions.iter().map(|s| s.version).collect())
    }

    pub fn set_compatibility(&self, subject: &str, mode: CompatibilityMode) -> Result<()> {
        let mut state = self.state.write();
        state.compatibility_overrides.insert(subject.to_string(), mode);
        self.persist(&state)
    }

    /// Checks `definition` for compatibility without registering it.
    pub fn test_compatibility(&self, subject: &str, schema_type: SchemaType, definition: &str) -> Result<bool> {
        let state = self.state.read();
        let mode = state
            .compatibility_overrides
            .get(subject)
            .copied()
            .unwrap_or(self.default_compatibility);
        let Some(versions) = state.subjects.get(subject) else {
            return Ok(true);
        };
        let candidate_fields = compatibility::extract_fields(definition, schema_type)?;
        let checked: Vec<&Schema> = if mode.is_transitive() {
            versions.iter().collect()
        } else {
            versions.last().into_iter().collect()
        };
        for existing in checked {
            let existing_fields = compatibility::extract_fields(&existing.definition, existing.schema_type)?;
            if !compatibility::is_compatible(&existing_fields, &candidate_fields, mode) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Wraps `payload` in the `[0x00 | id: u32 BE | payload]` envelope
/// every record value/key carries once it has a registered schema.
pub fn encode_envelope(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(0u8);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Unwraps a schema envelope, returning the schema id and the
/// remaining payload bytes.
pub fn decode_envelope(bytes: &[u8]) -> Result<(u32, &[u8])> {
    if bytes.len() < 5 || bytes[0] != 0 {
        return Err(Error::InvalidInput("not a schema envelope".into()));
    }
    let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok((id, &bytes[5..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_fetch_by_id_and_version() {
        let registry = SchemaRegistry::new(CompatibilityMode::None, 10);
        let id = registry
            .register("orders-value", SchemaType::Json, r#"{"properties":{"id":{}},"required":["id"]}"#, None)
            .unwrap();
        let by_id = registry.get_by_id(id).unwrap();
        assert_eq!(by_id.version, 1);
        let latest = registry.get_latest("orders-value").unwrap();
        assert_eq!(latest.id, id);
    }

    #[test]
    fn repeated_registration_is_idempotent() {
        let registry = SchemaRegistry::new(CompatibilityMode::None, 10);
        let def = r#"{"properties":{"id":{}},"required":["id"]}"#;
        let id1 = registry.register("s", SchemaType::Json, def, None).unwrap();
        let id2 = registry.register("s", SchemaType::Json, def, None).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(registry.list_versions("s").unwrap(), vec![1]);
    }

    #[test]
    fn forward_incompatible_registration_is_rejected() {
        let registry = SchemaRegistry::new(CompatibilityMode::Forward, 10);
        registry
            .register("s", SchemaType::Json, r#"{"properties":{"id":{}},"required":["id"]}"#, None)
            .unwrap();
        let result = registry.register(
            "s",
            SchemaType::Json,
            r#"{"properties":{"id":{},"extra":{}},"required":["id","extra"]}"#,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn backward_incompatible_registration_is_rejected() {
        let registry = SchemaRegistry::new(CompatibilityMode::Backward, 10);
        registry
            .register(
                "s",
                SchemaType::Json,
                r#"{"properties":{"id":{},"extra":{}},"required":["id","extra"]}"#,
                None,
            )
            .unwrap();
        let result = registry.register("s", SchemaType::Json, r#"{"properties":{"id":{}},"required":["id"]}"#, None);
        assert!(result.is_err());
    }

    #[test]
    fn adding_optional_field_is_backward_compatible() {
        let registry = SchemaRegistry::new(CompatibilityMode::Backward, 10);
        registry
            .register("s", SchemaType::Json, r#"{"properties":{"id":{}},"required":["id"]}"#, None)
            .unwrap();
        let result = registry.register(
            "s",
            SchemaType::Json,
            r#"{"properties":{"id":{},"nickname":{}},"required":["id"]}"#,
            None,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn register_with_reference_requires_target_to_exist() {
        let registry = SchemaRegistry::new(CompatibilityMode::None, 10);
        let missing = registry.register(
            "order-event",
            SchemaType::Avro,
            r#"{"fields":[{"name":"id"}]}"#,
            Some(vec![SchemaReference { name: "addr".into(), subject: "address".into(), version: 1 }]),
        );
        assert!(missing.is_err());

        registry.register("address", SchemaType::Avro, r#"{"fields":[{"name":"city"}]}"#, None).unwrap();
        let ok = registry.register(
            "order-event",
            SchemaType::Avro,
            r#"{"fields":[{"name":"id"}]}"#,
            Some(vec![SchemaReference { name: "addr".into(), subject: "address".into(), version: 1 }]),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn get_by_id_reports_cache_hits_and_misses_to_metrics() {
        let metrics = Arc::new(BrokerMetrics::new());
        let registry = SchemaRegistry::new(CompatibilityMode::None, 10).with_metrics(metrics.clone());
        let id = registry.register("s", SchemaType::Json, "{}", None).unwrap();
        registry.cache.clear();
        registry.get_by_id(id).unwrap();
        assert_eq!(metrics.schema_cache_misses.get(), 1);
        registry.get_by_id(id).unwrap();
        assert_eq!(metrics.schema_cache_hits.get(), 1);
    }

    #[test]
    fn envelope_roundtrip() {
        let encoded = encode_envelope(42, b"payload");
        let (id, payload) = decode_envelope(&encoded).unwrap();
        assert_eq!(id, 42);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn ids_are_monotonic_across_subjects() {
        let registry = SchemaRegistry::new(CompatibilityMode::None, 10);
        let a = registry.register("a", SchemaType::Json, "{}", None).unwrap();
        let b = registry.register("b", SchemaType::Json, "{\"x\":1}", None).unwrap();
        assert!(b > a);
    }
}
