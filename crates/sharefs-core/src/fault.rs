// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configurable storage fault injection
//!
//! A [`FaultPolicy`] is plain data carried by an export's configuration. The
//! [`FaultInjector`] arms it: each rule keeps its own call and hit counters,
//! and the in-memory engine asks the injector before every operation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Engine operations a rule can target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Open,
    Close,
    Read,
    Write,
    Flush,
    Lookup,
    Create,
    Unlink,
    GetAttr,
    SetAttr,
}

/// Error a rule injects, named after its errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
    Eacces,
    Estale,
}

impl From<FaultErrno> for StorageError {
    fn from(errno: FaultErrno) -> Self {
        let code = match errno {
            FaultErrno::Eio => libc::EIO,
            FaultErrno::Enospc => libc::ENOSPC,
            FaultErrno::Eacces => libc::EACCES,
            FaultErrno::Estale => libc::ESTALE,
        };
        StorageError::Errno(code)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Matching calls let through before the rule starts firing.
    #[serde(default)]
    pub start_after: u64,
    /// Cap on injected failures; unbounded when absent.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl FaultRule {
    pub fn new(op: FaultOp, errno: FaultErrno) -> Self {
        Self {
            op,
            errno,
            start_after: 0,
            max_faults: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// An enabled policy failing every call of `op`.
    pub fn always(op: FaultOp, errno: FaultErrno) -> Self {
        Self {
            enabled: true,
            rules: vec![FaultRule::new(op, errno)],
        }
    }
}

#[derive(Debug)]
struct ArmedRule {
    rule: FaultRule,
    calls: u64,
    hits: u64,
}

impl ArmedRule {
    /// Count one matching call; returns whether it fails.
    fn fire(&mut self) -> bool {
        self.calls = self.calls.saturating_add(1);
        let exhausted = self.rule.max_faults.is_some_and(|max| self.hits >= max);
        if self.calls <= self.rule.start_after || exhausted {
            return false;
        }
        self.hits += 1;
        true
    }
}

#[derive(Debug, Default)]
struct Armed {
    enabled: bool,
    rules: Vec<ArmedRule>,
}

/// Runtime side of a [`FaultPolicy`].
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<Armed>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: FaultPolicy) -> Self {
        let injector = Self::new();
        injector.set_policy(policy);
        injector
    }

    /// Replace the policy, resetting all counters.
    pub fn set_policy(&self, policy: FaultPolicy) {
        let rules = policy
            .rules
            .into_iter()
            .map(|rule| ArmedRule {
                rule,
                calls: 0,
                hits: 0,
            })
            .collect();
        *self.armed.lock() = Armed {
            enabled: policy.enabled,
            rules,
        };
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// The active policy, without counters.
    pub fn snapshot(&self) -> FaultPolicy {
        let armed = self.armed.lock();
        FaultPolicy {
            enabled: armed.enabled,
            rules: armed.rules.iter().map(|armed| armed.rule.clone()).collect(),
        }
    }

    /// Failures injected so far for `op`.
    pub fn hits(&self, op: FaultOp) -> u64 {
        let armed = self.armed.lock();
        armed.rules.iter().filter(|armed| armed.rule.op == op).map(|armed| armed.hits).sum()
    }

    /// Consult the policy for one call of `op`. The first matching rule that
    /// fires decides the error.
    pub fn should_fault(&self, op: FaultOp) -> Option<StorageError> {
        let mut armed = self.armed.lock();
        if !armed.enabled {
            return None;
        }
        armed
            .rules
            .iter_mut()
            .filter(|armed| armed.rule.op == op)
            .find_map(|armed| armed.fire().then(|| StorageError::from(armed.rule.errno)))
    }
}
