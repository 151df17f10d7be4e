// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Client state tokens
//!
//! A [`ClientState`] scopes one client's open instance of one object. It owns
//! its own [`DescriptorSlot`]; whether it also carries a share reservation is
//! decided by its [`StateKind`].

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::slot::DescriptorSlot;
use crate::types::OpenFlags;

/// Export-unique state identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u64);

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state-{}", self.0)
    }
}

/// What a state represents to the protocol front-end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// NFSv4 open state.
    Share,
    /// NLM share reservation.
    NlmShare,
    /// 9P fid; opens but reserves nothing.
    NinePFid,
    /// Byte-range lock owner.
    Lock,
    Delegation,
}

impl StateKind {
    /// Whether opens under this kind are counted in the share table.
    pub fn carries_share(self) -> bool {
        matches!(self, StateKind::Share | StateKind::NlmShare)
    }
}

/// One client's open instance: identity, kind and descriptor slot.
#[derive(Debug)]
pub struct ClientState {
    id: StateId,
    kind: StateKind,
    pub(crate) slot: DescriptorSlot,
}

impl ClientState {
    pub(crate) fn new(id: StateId, kind: StateKind) -> Self {
        Self {
            id,
            kind,
            slot: DescriptorSlot::new(),
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    /// Current descriptor mode, `CLOSED` if nothing is open.
    pub fn mode(&self) -> OpenFlags {
        self.slot.mode()
    }

    pub fn is_open(&self) -> bool {
        self.slot.read().is_open()
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        // The descriptor cannot be closed here: the engine is not reachable
        // from a state. Callers must close2 before dropping.
        if self.slot.get_mut().is_open() {
            warn!(state = %self.id, kind = ?self.kind, "client state dropped with an open descriptor");
        }
    }
}
