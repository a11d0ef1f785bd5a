//! # config
//!
//! why: timing and sizing knobs for one consensus node
//! relations: read by node.rs and every driver module; quorum, log, transport and state machine are injected separately
//! what: RaftConfig with serde/humantime durations, validation, election jitter

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::NodeId;

/// upper bound of the random extension added to each election timeout
const ELECTION_JITTER: f64 = 0.2;

/// Configuration for a Raft node
///
/// durations use humantime strings in json (`"250ms"`, `"5s"`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// this node's id; must appear in `nodes`
    pub id: NodeId,
    /// every node of the cluster, this one included
    pub nodes: Vec<NodeId>,
    /// label reported with votes, for group-aware quorums
    pub group: Option<String>,
    /// base election timeout; each firing adds up to 20% jitter
    #[serde(with = "humantime_serde")]
    pub election_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub vote_timeout: Duration,
    /// bounds both a replication rpc and a client append end to end
    #[serde(with = "humantime_serde")]
    pub append_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    pub max_entries_per_rpc: usize,
    pub max_apply_batch: usize,
    /// consecutive mismatches before a follower is resynced from index 0
    pub max_conflict_scan: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: 1,
            nodes: vec![1],
            group: None,
            election_timeout: Duration::from_millis(250),
            heartbeat_interval: Duration::from_millis(50),
            vote_timeout: Duration::from_millis(100),
            append_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
            max_entries_per_rpc: 64,
            max_apply_batch: 64,
            max_conflict_scan: 64,
        }
    }
}

impl RaftConfig {
    pub fn new(id: NodeId, nodes: Vec<NodeId>) -> Self {
        Self {
            id,
            nodes,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RaftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.nodes.contains(&self.id) {
            return Err(RaftError::Config(format!(
                "node {} is not in {:?}",
                self.id, self.nodes
            )));
        }
        let distinct: HashSet<_> = self.nodes.iter().collect();
        if distinct.len() != self.nodes.len() {
            return Err(RaftError::Config("duplicate node ids".into()));
        }
        for (name, value) in [
            ("election_timeout", self.election_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("vote_timeout", self.vote_timeout),
            ("append_timeout", self.append_timeout),
            ("read_timeout", self.read_timeout),
        ] {
            if value.is_zero() {
                return Err(RaftError::Config(format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("max_entries_per_rpc", self.max_entries_per_rpc),
            ("max_apply_batch", self.max_apply_batch),
            ("max_conflict_scan", self.max_conflict_scan),
        ] {
            if value == 0 {
                return Err(RaftError::Config(format!("{name} must be positive")));
            }
        }
        if self.heartbeat_interval >= self.election_timeout {
            return Err(RaftError::Config(
                "heartbeat_interval must be shorter than election_timeout".into(),
            ));
        }
        Ok(())
    }

    /// every node but this one
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().copied().filter(move |n| *n != self.id)
    }

    /// a fresh election timeout in `[base, base * 1.2]`
    pub fn election_deadline(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..=ELECTION_JITTER);
        self.election_timeout.mul_f64(1.0 + jitter)
    }
}
