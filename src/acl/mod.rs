//! ACL authorizer: deny-precedence evaluation over a flat
//! table of 7-tuple entries, with an LRU decision cache.
//!
//! Grounded on `crates/lumadb-security/src/authz/mod.rs`'s
//! `Authorizer` (`DashMap` of ACLs, wildcard `matches_permission`),
//! rebuilt around the resource/pattern-type matching and
//! deny-beats-allow precedence this authorizer requires, plus
//! [`crate::lru::LruCache`] for the decision cache and
//! [`crate::persistence`] for durability.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lru::{CacheStats, LruCache};
use crate::metrics::BrokerMetrics;
use crate::persistence::{read_or_default, write_atomic};
use crate::types::{AclOperation, PatternType, Permission, ResourceType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub principal: String,
    pub host: String,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub pattern_type: PatternType,
    pub operation: AclOperation,
    pub permission: Permission,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    principal: String,
    host: String,
    resource_type: ResourceType,
    resource_name: String,
    operation: AclOperation,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizerCounters {
    pub allowed: u64,
    pub denied: u64,
    pub cache: CacheStats,
}

/// Authorizes (principal, host, operation) against a resource, a flat
/// ACL table, and deny-precedence: if any matching entry denies, the
/// decision is deny even if another entry allows.
pub struct AclAuthorizer {
    entries: RwLock<Vec<AclEntry>>,
    cache: LruCache<DecisionKey, bool>,
    path: Option<PathBuf>,
    allowed: AtomicU64,
    denied: AtomicU64,
    metrics: Arc<BrokerMetrics>,
}

impl AclAuthorizer {
    pub fn new(cache_size: usize, cache_ttl: Option<std::time::Duration>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            cache: LruCache::new(cache_size, cache_ttl),
            path: None,
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            metrics: Arc::new(BrokerMetrics::new()),
        }
    }

    /// Loads the ACL table from `path` if it exists, and persists
    /// every subsequent mutation back to it.
    pub fn open(
        path: impl AsRef<Path>,
        cache_size: usize,
        cache_ttl: Option<std::time::Duration>,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries: Vec<AclEntry> = read_or_default(&path, Vec::new())?;
        Ok(Self {
            entries: RwLock::new(entries),
            cache: LruCache::new(cache_size, cache_ttl),
            path: Some(path),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            metrics,
        })
    }

    /// Redirects this authorizer's counters into a shared
    /// [`BrokerMetrics`] instead of the private one `new`/`open`
    /// default to.
    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn add_entry(&self, entry: AclEntry) -> Result<()> {
        {
            let mut entries = self.entries.write();
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        self.cache.clear();
        self.persist()
    }

    pub fn remove_entry(&self, entry: &AclEntry) -> Result<()> {
        {
            let mut entries = self.entries.write();
            entries.retain(|e| e != entry);
        }
        self.cache.clear();
        self.persist()
    }

    pub fn list_entries(&self) -> Vec<AclEntry> {
        self.entries.read().clone()
    }

    fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, &*self.entries.read())?;
        }
        Ok(())
    }

    /// Returns `Ok(())` if `principal` may perform `operation` on
    /// `(resource_type, resource_name)` from `host`, else an
    /// `AuthorizationDenied` error. The super-user escape hatch
    /// (`operation == All`) is handled the same as any other ACL
    /// entry: an explicit `All` allow or deny still participates in
    /// deny-precedence.
    pub fn authorize(
        &self,
        principal: &str,
        host: &str,
        resource_type: ResourceType,
        resource_name: &str,
        operation: AclOperation,
    ) -> Result<()> {
        let key = DecisionKey {
            principal: principal.to_string(),
            host: host.to_string(),
            resource_type,
            resource_name: resource_name.to_string(),
            operation,
        };

        if let Some(allowed) = self.cache.get(&key) {
            self.metrics.acl_cache_hits.inc();
            return self.finish(allowed, principal, operation, resource_name);
        }
        self.metrics.acl_cache_misses.inc();

        let entries = self.entries.read();
        let matching = entries
            .iter()
            .filter(|e| entry_matches(e, principal, host, resource_type, resource_name, operation));

        let mut allowed = false;
        let mut any_match = false;
        for entry in matching {
            any_match = true;
            match entry.permission {
                Permission::Deny => {
                    allowed = false;
                    break;
                }
                Permission::Allow => allowed = true,
            }
        }
        drop(entries);
        let _ = any_match;

        self.cache.put(key, allowed);
        self.finish(allowed, principal, operation, resource_name)
    }

    fn finish(&self, allowed: bool, principal: &str, operation: AclOperation, resource_name: &str) -> Result<()> {
        if allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
            Err(Error::AuthorizationDenied {
                principal: principal.to_string(),
                operation: format!("{operation:?}"),
                resource: resource_name.to_string(),
            })
        }
    }

    pub fn counters(&self) -> AuthorizerCounters {
        AuthorizerCounters {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }
}

fn entry_matches(
    entry: &AclEntry,
    principal: &str,
    host: &str,
    resource_type: ResourceType,
    resource_name: &str,
    operation: AclOperation,
) -> bool {
    if entry.resource_type != resource_type {
        return false;
    }
    if entry.principal != "*" && entry.principal != principal {
        return false;
    }
    if entry.host != "*" && entry.host != host {
        return false;
    }
    if entry.operation != AclOperation::All && entry.operation != operation {
        return false;
    }
    match entry.pattern_type {
        PatternType::Literal => entry.resource_name == "*" || entry.resource_name == resource_name,
        PatternType::Prefixed => resource_name.starts_with(&entry.resource_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        principal: &str,
        resource_name: &str,
        pattern_type: PatternType,
        operation: AclOperation,
        permission: Permission,
    ) -> AclEntry {
        AclEntry {
            principal: principal.to_string(),
            host: "*".to_string(),
            resource_type: ResourceType::Topic,
            resource_name: resource_name.to_string(),
            pattern_type,
            operation,
            permission,
        }
    }

    #[test]
    fn no_matching_entry_denies() {
        let authz = AclAuthorizer::new(100, None);
        assert!(authz
            .authorize("alice", "host1", ResourceType::Topic, "orders", AclOperation::Read)
            .is_err());
    }

    #[test]
    fn explicit_allow_permits() {
        let authz = AclAuthorizer::new(100, None);
        authz
            .add_entry(entry("alice", "orders", PatternType::Literal, AclOperation::Read, Permission::Allow))
            .unwrap();
        assert!(authz
            .authorize("alice", "host1", ResourceType::Topic, "orders", AclOperation::Read)
            .is_ok());
    }

    #[test]
    fn deny_beats_allow() {
        let authz = AclAuthorizer::new(100, None);
        authz
            .add_entry(entry("*", "orders", PatternType::Literal, AclOperation::Read, Permission::Allow))
            .unwrap();
        authz
            .add_entry(entry("alice", "orders", PatternType::Literal, AclOperation::Read, Permission::Deny))
            .unwrap();
        assert!(authz
            .authorize("alice", "host1", ResourceType::Topic, "orders", AclOperation::Read)
            .is_err());
        assert!(authz
            .authorize("bob", "host1", ResourceType::Topic, "orders", AclOperation::Read)
            .is_ok());
    }

    #[test]
    fn prefixed_pattern_matches_prefix() {
        let authz = AclAuthorizer::new(100, None);
        authz
            .add_entry(entry("alice", "orders-", PatternType::Prefixed, AclOperation::Write, Permission::Allow))
            .unwrap();
        assert!(authz
            .authorize("alice", "h", ResourceType::Topic, "orders-eu", AclOperation::Write)
            .is_ok());
        assert!(authz
            .authorize("alice", "h", ResourceType::Topic, "payments-eu", AclOperation::Write)
            .is_err());
    }

    #[test]
    fn authorize_reports_cache_hits_and_misses_to_metrics() {
        let metrics = Arc::new(BrokerMetrics::new());
        let authz = AclAuthorizer::new(100, None).with_metrics(metrics.clone());
        authz
            .add_entry(entry("alice", "orders", PatternType::Literal, AclOperation::Read, Permission::Allow))
            .unwrap();
        authz.authorize("alice", "h", ResourceType::Topic, "orders", AclOperation::Read).unwrap();
        assert_eq!(metrics.acl_cache_misses.get(), 1);
        authz.authorize("alice", "h", ResourceType::Topic, "orders", AclOperation::Read).unwrap();
        assert_eq!(metrics.acl_cache_hits.get(), 1);
    }

    #[test]
    fn mutation_invalidates_cache() {
        let authz = AclAuthorizer::new(100, None);
        authz
            .add_entry(entry("alice", "orders", PatternType::Literal, AclOperation::Read, Permission::Allow))
            .unwrap();
        authz
            .authorize("alice", "h", ResourceType::Topic, "orders", AclOperation::Read)
            .unwrap();
        assert_eq!(authz.counters().cache.entries, 1);

        let deny = entry("alice", "orders", PatternType::Literal, AclOperation::Read, Permission::Deny);
        authz.add_entry(deny).unwrap();
        assert_eq!(authz.counters().cache.entries, 0);
        assert!(authz
            .authorize("alice", "h", ResourceType::Topic, "orders", AclOperation::Read)
            .is_err());
    }
}
