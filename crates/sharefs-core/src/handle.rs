// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Object handles
//!
//! An [`ObjectHandle`] is the in-memory representative of one engine item.
//! Its object lock guards the share table and the identity of the global
//! descriptor; every handle is shared through an `Arc` and interned by its
//! [`ObjectKey`] in the owning export's arena.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::export::ExportContext;
use crate::share::ShareReservation;
use crate::slot::DescriptorSlot;
use crate::storage::{ItemRef, StorageEngine};
use crate::types::{ObjectKey, ObjectType, OpenFlags, Stat};

pub struct ObjectHandle {
    item: ItemRef,
    key: ObjectKey,
    kind: ObjectType,
    /// The object lock.
    pub(crate) share: RwLock<ShareReservation>,
    /// Ownerless descriptor; its identity changes only under the object lock.
    pub(crate) global: DescriptorSlot,
    ctx: Arc<ExportContext>,
}

impl ObjectHandle {
    pub(crate) fn new(ctx: Arc<ExportContext>, item: ItemRef, stat: &Stat) -> Self {
        Self {
            item,
            key: stat.key(),
            kind: stat.kind(),
            share: RwLock::new(ShareReservation::new()),
            global: DescriptorSlot::new(),
            ctx,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn kind(&self) -> ObjectType {
        self.kind
    }

    /// Wire form of the handle, accepted by `Export::create_handle`.
    pub fn to_wire(&self) -> [u8; ObjectKey::WIRE_LEN] {
        self.key.to_wire()
    }

    /// Snapshot of the share table.
    pub fn share_snapshot(&self) -> ShareReservation {
        *self.share.read()
    }

    /// Mode of the global descriptor, `CLOSED` if none is open.
    pub fn global_mode(&self) -> OpenFlags {
        self.global.mode()
    }

    pub fn export_name(&self) -> &str {
        &self.ctx.name
    }

    pub(crate) fn item(&self) -> &ItemRef {
        &self.item
    }

    pub(crate) fn engine(&self) -> &dyn StorageEngine {
        self.ctx.engine.as_ref()
    }

    /// Descriptor opens and data I/O are only defined for regular files.
    pub(crate) fn require_regular(&self) -> FsResult<()> {
        match self.kind {
            ObjectType::RegularFile => Ok(()),
            ObjectType::Directory => Err(FsError::IsADirectory),
            ObjectType::Symlink | ObjectType::Other => Err(FsError::InvalidArgument),
        }
    }

    pub(crate) fn require_directory(&self) -> FsResult<()> {
        match self.kind {
            ObjectType::Directory => Ok(()),
            _ => Err(FsError::NotADirectory),
        }
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("export", &self.ctx.name)
            .finish_non_exhaustive()
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        let share = self.share.get_mut();
        if !share.is_empty() {
            warn!(key = %self.key, counts = ?share.counts(), "handle released with live share reservations");
        }
        if let Some((fd, mode)) = self.global.get_mut().take() {
            if let Err(err) = self.ctx.engine.close(fd) {
                warn!(key = %self.key, ?mode, %err, "closing global descriptor on release failed");
            }
        }
        self.ctx.engine.release_item(&self.item);
        debug!(key = %self.key, "handle released");
    }
}
