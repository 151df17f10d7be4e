// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor slots
//!
//! A slot holds at most one live engine descriptor together with the mode it
//! was opened with. Its lock (the "fd lock") is the inner lock tier: it is
//! only ever taken while the owning object lock is already held, or with no
//! object lock at all, never the other way around.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::storage::Fd;
use crate::types::OpenFlags;

#[derive(Debug, Default)]
pub enum SlotState {
    #[default]
    Closed,
    Open { fd: Fd, mode: OpenFlags },
}

impl SlotState {
    pub fn mode(&self) -> OpenFlags {
        match self {
            SlotState::Closed => OpenFlags::CLOSED,
            SlotState::Open { mode, .. } => *mode,
        }
    }

    pub fn fd(&self) -> Option<&Fd> {
        match self {
            SlotState::Closed => None,
            SlotState::Open { fd, .. } => Some(fd),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SlotState::Open { .. })
    }

    /// Replace the contents, handing back the previous descriptor if any.
    pub fn install(&mut self, fd: Fd, mode: OpenFlags) -> Option<Fd> {
        let previous = std::mem::replace(
            self,
            SlotState::Open {
                fd,
                mode: mode.persistent(),
            },
        );
        previous.into_fd()
    }

    /// Empty the slot, handing back the descriptor if one was open.
    pub fn take(&mut self) -> Option<(Fd, OpenFlags)> {
        match std::mem::take(self) {
            SlotState::Closed => None,
            SlotState::Open { fd, mode } => Some((fd, mode)),
        }
    }

    fn into_fd(self) -> Option<Fd> {
        match self {
            SlotState::Closed => None,
            SlotState::Open { fd, .. } => Some(fd),
        }
    }
}

/// One descriptor plus its fd lock.
#[derive(Debug, Default)]
pub struct DescriptorSlot {
    state: RwLock<SlotState>,
}

impl DescriptorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SlotState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SlotState> {
        self.state.write()
    }

    /// Mode snapshot; stale as soon as it is returned.
    pub fn mode(&self) -> OpenFlags {
        self.state.read().mode()
    }

    pub fn get_mut(&mut self) -> &mut SlotState {
        self.state.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_strips_trunc_and_returns_previous() {
        let slot = DescriptorSlot::new();
        assert!(slot.mode().is_closed());
        {
            let mut guard = slot.write();
            assert!(guard.install(Fd::new(1), OpenFlags::WRITE | OpenFlags::TRUNC).is_none());
        }
        assert_eq!(slot.mode(), OpenFlags::WRITE);
        let previous = slot.write().install(Fd::new(2), OpenFlags::READ);
        assert_eq!(previous, Some(Fd::new(1)));
        assert_eq!(slot.read().fd(), Some(&Fd::new(2)));
    }

    #[test]
    fn take_closes_the_slot() {
        let slot = DescriptorSlot::new();
        slot.write().install(Fd::new(3), OpenFlags::RDWR);
        assert_eq!(slot.write().take(), Some((Fd::new(3), OpenFlags::RDWR)));
        assert!(!slot.read().is_open());
        assert!(slot.write().take().is_none());
    }
}
