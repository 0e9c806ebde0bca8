//! Consumer-group coordinator: membership, generation,
//! leader/protocol negotiation, and offset commits.
//!
//! Membership, generation, leader and protocol are consolidated into a
//! single `RwLock<GroupInner>` per group, since all four change
//! together on every rebalance step and one lock avoids the ordering
//! hazard of four separate ones. Offsets stay their own `DashMap`,
//! since commits are independent of membership.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::GroupConfig;
use crate::error::{Error, Result};
use crate::metrics::BrokerMetrics;
use crate::persistence::{read_or_default, write_atomic};
use crate::types::{Offset, PartitionId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub client_id: String,
    pub protocols: Vec<String>,
    pub assignment: Vec<u8>,
    pub session_timeout_ms: u64,
    pub last_heartbeat_ms: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetCommit {
    pub offset: Offset,
    pub metadata: String,
    pub committed_at_ms: Timestamp,
}

#[derive(Debug, Clone)]
pub struct JoinResult {
    pub member_id: String,
    pub generation: i64,
    pub protocol: Option<String>,
    pub leader_id: String,
    pub members: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone)]
pub struct GroupDescription {
    pub id: String,
    pub state: GroupState,
    pub generation: i64,
    pub protocol: Option<String>,
    pub leader: Option<String>,
    pub members: Vec<Member>,
}

struct GroupInner {
    state: GroupState,
    generation: i64,
    protocol: Option<String>,
    leader: Option<String>,
    members: HashMap<String, Member>,
}

struct Group {
    id: String,
    inner: RwLock<GroupInner>,
    offsets: DashMap<(String, PartitionId), OffsetCommit>,
}

/// On-disk shape of one group, the `GroupInner` fields plus its
/// offsets flattened to a string-keyed map since `serde_json` cannot
/// key an object by a tuple.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedGroup {
    state: GroupState,
    generation: i64,
    protocol: Option<String>,
    leader: Option<String>,
    members: HashMap<String, Member>,
    offsets: HashMap<String, OffsetCommit>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CoordinatorState {
    groups: HashMap<String, PersistedGroup>,
}

fn offset_key(topic: &str, partition: PartitionId) -> String {
    format!("{topic}\u{0}{partition}")
}

fn split_offset_key(key: &str) -> Option<(String, PartitionId)> {
    let (topic, partition) = key.rsplit_once('\u{0}')?;
    Some((topic.to_string(), partition.parse().ok()?))
}

/// Coordinates membership and offset commits for every consumer
/// group known to this broker node.
pub struct GroupCoordinator {
    groups: DashMap<String, Arc<Group>>,
    config: GroupConfig,
    path: Option<PathBuf>,
    metrics: Arc<BrokerMetrics>,
}

impl GroupCoordinator {
    pub fn new(config: GroupConfig) -> Self {
        Self {
            groups: DashMap::new(),
            config,
            path: None,
            metrics: Arc::new(BrokerMetrics::new()),
        }
    }

    /// Loads every group's membership and offsets from `path` if it
    /// exists, and persists every subsequent mutation back to it.
    pub fn open(path: impl AsRef<Path>, config: GroupConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state: CoordinatorState = read_or_default(&path, CoordinatorState::default())?;
        let groups = DashMap::new();
        for (id, persisted) in state.groups {
            let offsets = DashMap::new();
            for (key, commit) in persisted.offsets {
                if let Some((topic, partition)) = split_offset_key(&key) {
                    offsets.insert((topic, partition), commit);
                }
            }
            groups.insert(
                id.clone(),
                Arc::new(Group {
                    id,
                    inner: RwLock::new(GroupInner {
                        state: persisted.state,
                        generation: persisted.generation,
                        protocol: persisted.protocol,
                        leader: persisted.leader,
                        members: persisted.members,
                    }),
                    offsets,
                }),
            );
        }
        Ok(Self {
            groups,
            config,
            path: Some(path),
            metrics: Arc::new(BrokerMetrics::new()),
        })
    }

    /// Redirects this coordinator's counters into a shared
    /// [`BrokerMetrics`] instead of the private one `new`/`open`
    /// default to.
    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut state = CoordinatorState::default();
        for entry in self.groups.iter() {
            let group = entry.value();
            let inner = group.inner.read();
            let offsets = group
                .offsets
                .iter()
                .map(|e| (offset_key(&e.key().0, e.key().1), e.value().clone()))
                .collect();
            state.groups.insert(
                entry.key().clone(),
                PersistedGroup {
                    state: inner.state,
                    generation: inner.generation,
                    protocol: inner.protocol.clone(),
                    leader: inner.leader.clone(),
                    members: inner.members.clone(),
                    offsets,
                },
            );
        }
        write_atomic(path, &state)
    }

    fn group(&self, group_id: &str) -> Arc<Group> {
        self.groups
            .entry(group_id.to_string())
            .or_insert_with(|| {
                Arc::new(Group {
                    id: group_id.to_string(),
                    inner: RwLock::new(GroupInner {
                        state: GroupState::Empty,
                        generation: 0,
                        protocol: None,
                        leader: None,
                        members: HashMap::new(),
                    }),
                    offsets: DashMap::new(),
                })
            })
            .clone()
    }

    /// Joins `group_id`, assigning a fresh member id if `member_id`
    /// is `None`. Any join while the group is `Stable` or `Empty`
    /// starts a new rebalance and bumps the generation; a join while
    /// a rebalance is already under way joins that same generation.
    pub fn join(
        &self,
        group_id: &str,
        member_id: Option<String>,
        client_id: &str,
        protocols: Vec<String>,
        session_timeout_ms: u64,
        now_ms: Timestamp,
    ) -> Result<JoinResult> {
        if !(self.config.session_timeout_min_ms..=self.config.session_timeout_max_ms)
            .contains(&session_timeout_ms)
        {
            return Err(Error::InvalidInput(format!(
                "session_timeout_ms {session_timeout_ms} outside [{}, {}]",
                self.config.session_timeout_min_ms, self.config.session_timeout_max_ms
            )));
        }

        let group = self.group(group_id);
        let mut inner = group.inner.write();
        if inner.state == GroupState::Dead {
            return Err(Error::Conflict(format!("group {group_id} is dead")));
        }

        match inner.state {
            GroupState::Empty | GroupState::Stable => {
                inner.state = GroupState::PreparingRebalance;
                inner.generation += 1;
                self.metrics.group_rebalances.inc();
            }
            GroupState::PreparingRebalance | GroupState::CompletingRebalance | GroupState::Dead => {}
        }

        let member_id = member_id
            .filter(|id| inner.members.contains_key(id))
            .unwrap_or_else(|| format!("{client_id}-{}", uuid::Uuid::new_v4()));

        inner.members.insert(
            member_id.clone(),
            Member {
                member_id: member_id.clone(),
                client_id: client_id.to_string(),
                protocols: protocols.clone(),
                assignment: Vec::new(),
                session_timeout_ms,
                last_heartbeat_ms: now_ms,
            },
        );

        if inner.leader.is_none() {
            inner.leader = Some(member_id.clone());
        }

        inner.protocol = select_protocol(&inner.members);
        inner.state = GroupState::CompletingRebalance;

        let leader_id = inner.leader.clone().unwrap_or_else(|| member_id.clone());
        let members = if leader_id == member_id {
            inner
                .members
                .values()
                .map(|m| (m.member_id.clone(), m.protocols.clone()))
                .collect()
        } else {
            Vec::new()
        };

        let generation = inner.generation;
        let protocol = inner.protocol.clone();
        drop(inner);
        self.persist()?;

        Ok(JoinResult {
            member_id,
            generation,
            protocol,
            leader_id,
            members,
        })
    }

    /// Completes a rebalance: the leader supplies `assignments` for
    /// every member, which this call stores and uses to flip the
    /// group to `Stable`. Non-leader members call this to retrieve
    /// their assignment once the leader has done so.
    pub fn sync(
        &self,
        group_id: &str,
        member_id: &str,
        generation: i64,
        assignments: HashMap<String, Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let group = self.group(group_id);
        let mut inner = group.inner.write();
        self.check_member(&inner, group_id, member_id, generation)?;

        if !assignments.is_empty() {
            if inner.leader.as_deref() != Some(member_id) {
                return Err(Error::AuthorizationDenied {
                    principal: member_id.to_string(),
                    operation: "sync with assignments".into(),
                    resource: format!("group {group_id}"),
                });
            }
            for (id, assignment) in assignments {
                if let Some(member) = inner.members.get_mut(&id) {
                    member.assignment = assignment;
                }
            }
            inner.state = GroupState::Stable;
        }

        let result = match inner.state {
            GroupState::Stable => Ok(inner
                .members
                .get(member_id)
                .map(|m| m.assignment.clone())
                .unwrap_or_default()),
            GroupState::PreparingRebalance => Err(Error::Conflict("rebalance in progress".into())),
            _ => Err(Error::Conflict(format!("group {group_id} is not ready to sync"))),
        };
        drop(inner);
        self.persist()?;
        result
    }

    pub fn heartbeat(&self, group_id: &str, member_id: &str, generation: i64, now_ms: Timestamp) -> Result<()> {
        let group = self.group(group_id);
        let mut inner = group.inner.write();
        self.check_member(&inner, group_id, member_id, generation)?;
        if let Some(member) = inner.members.get_mut(member_id) {
            member.last_heartbeat_ms = now_ms;
        }
        if inner.state == GroupState::PreparingRebalance {
            return Err(Error::Conflict("rebalance in progress".into()));
        }
        Ok(())
    }

    pub fn leave(&self, group_id: &str, member_id: &str) -> Result<()> {
        let group = self.group(group_id);
        let mut inner = group.inner.write();
        if inner.members.remove(member_id).is_none() {
            return Err(Error::NotFound(format!("member {member_id}")));
        }
        self.rebalance_after_departure(&mut inner, member_id);
        drop(inner);
        self.persist()
    }

    fn rebalance_after_departure(&self, inner: &mut GroupInner, departed: &str) {
        if inner.members.is_empty() {
            inner.state = GroupState::Empty;
            inner.leader = None;
            inner.protocol = None;
            return;
        }
        if inner.leader.as_deref() == Some(departed) {
            inner.leader = inner.members.keys().next().cloned();
        }
        inner.state = GroupState::PreparingRebalance;
        inner.generation += 1;
        self.metrics.group_rebalances.inc();
    }

    fn check_member(&self, inner: &GroupInner, group_id: &str, member_id: &str, generation: i64) -> Result<()> {
        if inner.state == GroupState::Dead {
            return Err(Error::Conflict(format!("group {} is dead", group_id)));
        }
        if !inner.members.contains_key(member_id) {
            return Err(Error::NotFound(format!("member {member_id}")));
        }
        if generation != inner.generation {
            return Err(Error::Conflict(format!(
                "stale generation {generation}, current is {}",
                inner.generation
            )));
        }
        Ok(())
    }

    pub fn commit_offset(
        &self,
        group_id: &str,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
        metadata: String,
        now_ms: Timestamp,
    ) -> Result<()> {
        let group = self.group(group_id);
        if group.inner.read().state == GroupState::Dead {
            return Err(Error::Conflict(format!("group {group_id} is dead")));
        }
        group.offsets.insert(
            (topic.to_string(), partition),
            OffsetCommit {
                offset,
                metadata,
                committed_at_ms: now_ms,
            },
        );
        self.persist()
    }

    pub fn fetch_offset(&self, group_id: &str, topic: &str, partition: PartitionId) -> Option<OffsetCommit> {
        self.groups
            .get(group_id)?
            .offsets
            .get(&(topic.to_string(), partition))
            .map(|e| e.value().clone())
    }

    pub fn describe_group(&self, group_id: &str) -> Result<GroupDescription> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
        let inner = group.inner.read();
        Ok(GroupDescription {
            id: group_id.to_string(),
            state: inner.state,
            generation: inner.generation,
            protocol: inner.protocol.clone(),
            leader: inner.leader.clone(),
            members: inner.members.values().cloned().collect(),
        })
    }

    pub fn list_groups(&self) -> Vec<(String, GroupState)> {
        self.groups
            .iter()
            .map(|e| (e.key().clone(), e.value().inner.read().state))
            .collect()
    }

    /// Expires members that have not heartbeated within their session
    /// timeout, and offset commits older than
    /// `offset_retention_ms`. Idempotent: running it twice with the
    /// same `now_ms` has no further effect.
    pub fn sweep(&self, now_ms: Timestamp) -> (usize, usize) {
        let mut expired_members = 0;
        let mut expired_offsets = 0;

        for entry in self.groups.iter() {
            let group = entry.value();
            let mut inner = group.inner.write();
            let timed_out: Vec<String> = inner
                .members
                .values()
                .filter(|m| now_ms.saturating_sub(m.last_heartbeat_ms) as u64 > m.session_timeout_ms)
                .map(|m| m.member_id.clone())
                .collect();
            for member_id in &timed_out {
                inner.members.remove(member_id);
                self.rebalance_after_departure(&mut inner, member_id);
                expired_members += 1;
            }
            drop(inner);

            let stale_keys: Vec<(String, PartitionId)> = group
                .offsets
                .iter()
                .filter(|e| {
                    now_ms.saturating_sub(e.value().committed_at_ms) as u64 > self.config.offset_retention_ms
                })
                .map(|e| e.key().clone())
                .collect();
            for key in stale_keys {
                group.offsets.remove(&key);
                expired_offsets += 1;
            }
        }
        if expired_members > 0 || expired_offsets > 0 {
            let _ = self.persist();
        }
        (expired_members, expired_offsets)
    }
}

/// Picks the first protocol name every current member advertises, in
/// the order the group's first member proposed them — the same
/// "intersection, leader's ordering wins" rule Kafka consumers use.
fn select_protocol(members: &HashMap<String, Member>) -> Option<String> {
    let mut candidates: Option<Vec<String>> = None;
    for member in members.values() {
        candidates = Some(match candidates {
            None => member.protocols.clone(),
            Some(existing) => existing
                .into_iter()
                .filter(|p| member.protocols.contains(p))
                .collect(),
        });
    }
    candidates.and_then(|c| c.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> GroupConfig {
        GroupConfig::default()
    }

    #[test]
    fn first_join_starts_rebalance_and_becomes_leader() {
        let coordinator = GroupCoordinator::new(config());
        let result = coordinator
            .join("g", None, "client-a", vec!["range".into()], 10_000, 0)
            .unwrap();
        assert_eq!(result.generation, 1);
        assert_eq!(result.leader_id, result.member_id);
        assert_eq!(result.members.len(), 1);
    }

    #[test]
    fn second_join_shares_generation_until_sync() {
        let coordinator = GroupCoordinator::new(config());
        let first = coordinator
            .join("g", None, "a", vec!["range".into()], 10_000, 0)
            .unwrap();
        let second = coordinator
            .join("g", None, "b", vec!["range".into()], 10_000, 0)
            .unwrap();
        assert_eq!(first.generation, second.generation);
        assert_ne!(first.member_id, second.member_id);
    }

    #[test]
    fn sync_distributes_leader_assignment() {
        let coordinator = GroupCoordinator::new(config());
        let join = coordinator
            .join("g", None, "a", vec!["range".into()], 10_000, 0)
            .unwrap();
        let mut assignments = HashMap::new();
        assignments.insert(join.member_id.clone(), b"plan".to_vec());
        let assignment = coordinator
            .sync("g", &join.member_id, join.generation, assignments)
            .unwrap();
        assert_eq!(assignment, b"plan".to_vec());
    }

    #[test]
    fn stale_generation_is_rejected() {
        let coordinator = GroupCoordinator::new(config());
        let join = coordinator
            .join("g", None, "a", vec!["range".into()], 10_000, 0)
            .unwrap();
        let err = coordinator
            .heartbeat("g", &join.member_id, join.generation + 1, 1)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn leave_promotes_new_leader() {
        let coordinator = GroupCoordinator::new(config());
        let leader = coordinator
            .join("g", None, "a", vec!["range".into()], 10_000, 0)
            .unwrap();
        let follower = coordinator
            .join("g", None, "b", vec!["range".into()], 10_000, 0)
            .unwrap();
        coordinator.leave("g", &leader.member_id).unwrap();
        let description = coordinator.describe_group("g").unwrap();
        assert_eq!(description.leader.as_deref(), Some(follower.member_id.as_str()));
        assert_eq!(description.state, GroupState::PreparingRebalance);
    }

    #[test]
    fn last_member_leaving_empties_the_group() {
        let coordinator = GroupCoordinator::new(config());
        let join = coordinator
            .join("g", None, "a", vec!["range".into()], 10_000, 0)
            .unwrap();
        coordinator.leave("g", &join.member_id).unwrap();
        let description = coordinator.describe_group("g").unwrap();
        assert_eq!(description.state, GroupState::Empty);
        assert!(description.leader.is_none());
    }

    #[test]
    fn commit_then_fetch_offset_roundtrip() {
        let coordinator = GroupCoordinator::new(config());
        coordinator.join("g", None, "a", vec!["range".into()], 10_000, 0).unwrap();
        coordinator.commit_offset("g", "orders", 0, 42, "meta".into(), 0).unwrap();
        let committed = coordinator.fetch_offset("g", "orders", 0).unwrap();
        assert_eq!(committed.offset, 42);
    }

    #[test]
    fn sweep_expires_timed_out_member() {
        let coordinator = GroupCoordinator::new(config());
        coordinator.join("g", None, "a", vec!["range".into()], 10_000, 0).unwrap();
        let (expired, _) = coordinator.sweep(11_000);
        assert_eq!(expired, 1);
        let description = coordinator.describe_group("g").unwrap();
        assert_eq!(description.state, GroupState::Empty);
    }

    #[test]
    fn sweep_is_idempotent() {
        let coordinator = GroupCoordinator::new(config());
        coordinator.join("g", None, "a", vec!["range".into()], 10_000, 0).unwrap();
        coordinator.sweep(11_000);
        let (expired_again, _) = coordinator.sweep(11_000);
        assert_eq!(expired_again, 0);
    }

    #[test]
    fn reopen_recovers_membership_and_offsets() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("groups.json");
        let join = {
            let coordinator = GroupCoordinator::open(&path, config()).unwrap();
            let join = coordinator
                .join("g", None, "a", vec!["range".into()], 10_000, 0)
                .unwrap();
            coordinator
                .commit_offset("g", "orders", 0, 42, "meta".into(), 0)
                .unwrap();
            join
        };

        let reopened = GroupCoordinator::open(&path, config()).unwrap();
        let description = reopened.describe_group("g").unwrap();
        assert_eq!(description.generation, join.generation);
        assert_eq!(description.members.len(), 1);
        let committed = reopened.fetch_offset("g", "orders", 0).unwrap();
        assert_eq!(committed.offset, 42);
    }

    #[test]
    fn leave_starts_rebalance_and_bumps_group_rebalance_metric() {
        let metrics = Arc::new(BrokerMetrics::new());
        let coordinator = GroupCoordinator::new(config()).with_metrics(metrics.clone());
        let leader = coordinator
            .join("g", None, "a", vec!["range".into()], 10_000, 0)
            .unwrap();
        coordinator
            .join("g", None, "b", vec!["range".into()], 10_000, 0)
            .unwrap();
        let before = metrics.group_rebalances.get();
        coordinator.leave("g", &leader.member_id).unwrap();
        assert_eq!(metrics.group_rebalances.get(), before + 1);
    }
}
