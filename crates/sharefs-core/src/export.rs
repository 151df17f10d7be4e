// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Exports: one engine connection, its configuration and its handle arena
//!
//! Every handle the export hands out is interned by [`ObjectKey`], so two
//! lookups of the same object converge on one canonical [`ObjectHandle`]
//! and one share table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{ExportConfig, ModuleConfig};
use crate::error::{FsError, FsResult};
use crate::handle::ObjectHandle;
use crate::share::ShareReservation;
use crate::state::{ClientState, StateId, StateKind};
use crate::storage::{InMemoryEngine, ItemRef, StorageEngine};
use crate::types::{ObjectKey, Stat};

/// What every handle of an export needs to reach back to.
pub(crate) struct ExportContext {
    pub(crate) name: String,
    pub(crate) module: ModuleConfig,
    pub(crate) engine: Arc<dyn StorageEngine>,
}

pub struct Export {
    ctx: Arc<ExportContext>,
    config: ExportConfig,
    root: Arc<ObjectHandle>,
    arena: Mutex<HashMap<ObjectKey, Weak<ObjectHandle>>>,
    next_state: AtomicU64,
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.ctx.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Export {
    /// Bind an export to `engine`. The export root is `config.path`
    /// resolved from the engine root.
    pub fn new(
        module: ModuleConfig,
        config: ExportConfig,
        engine: Arc<dyn StorageEngine>,
    ) -> FsResult<Self> {
        module.validate()?;
        config.validate()?;

        let ctx = Arc::new(ExportContext {
            name: config.name.clone(),
            module,
            engine,
        });

        let (mut item, mut stat) = ctx.engine.root()?;
        for component in config.path.split('/').filter(|c| !c.is_empty()) {
            let next = ctx.engine.lookup_child(&item, component);
            ctx.engine.release_item(&item);
            (item, stat) = next?;
        }
        let root = Arc::new(ObjectHandle::new(Arc::clone(&ctx), item, &stat));
        root.require_directory()?;

        let mut arena = HashMap::new();
        arena.insert(root.key(), Arc::downgrade(&root));

        info!(export = %config.name, path = %config.path, root = %root.key(), "export created");
        Ok(Self {
            ctx,
            config,
            root,
            arena: Mutex::new(arena),
            next_state: AtomicU64::new(1),
        })
    }

    /// Export backed by a fresh [`InMemoryEngine`] carrying the config's
    /// fault policy. The engine is returned for inspection.
    pub fn in_memory(
        module: ModuleConfig,
        config: ExportConfig,
    ) -> FsResult<(Self, Arc<InMemoryEngine>)> {
        let engine = Arc::new(InMemoryEngine::new());
        if let Some(policy) = config.fault_policy.clone() {
            engine.faults().set_policy(policy);
        }
        let export = Self::new(module, config, Arc::clone(&engine) as Arc<dyn StorageEngine>)?;
        Ok((export, engine))
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn module(&self) -> &ModuleConfig {
        &self.ctx.module
    }

    pub fn root(&self) -> Arc<ObjectHandle> {
        Arc::clone(&self.root)
    }

    pub(crate) fn engine(&self) -> &dyn StorageEngine {
        self.ctx.engine.as_ref()
    }

    /// New client state token for this export.
    pub fn alloc_state(&self, kind: StateKind) -> ClientState {
        let id = StateId(self.next_state.fetch_add(1, Ordering::Relaxed));
        ClientState::new(id, kind)
    }

    /// Wrap a freshly obtained engine item. The result is not interned.
    pub(crate) fn construct_handle(&self, item: ItemRef, stat: &Stat) -> Arc<ObjectHandle> {
        Arc::new(ObjectHandle::new(Arc::clone(&self.ctx), item, stat))
    }

    /// Return the canonical handle for `handle`'s key.
    ///
    /// If a live handle for the key already exists, `handle`'s share table is
    /// merged into it and `handle` is dropped; a failed merge leaves both
    /// tables untouched and reports `ShareConflict`.
    ///
    /// Object locks are never taken while the arena is locked.
    pub fn intern(&self, handle: Arc<ObjectHandle>) -> FsResult<Arc<ObjectHandle>> {
        let canonical = {
            let mut arena = self.arena.lock();
            match arena.get(&handle.key()).and_then(Weak::upgrade) {
                Some(canonical) => canonical,
                None => {
                    arena.retain(|_, weak| weak.strong_count() > 0);
                    arena.insert(handle.key(), Arc::downgrade(&handle));
                    return Ok(handle);
                }
            }
        };
        if Arc::ptr_eq(&canonical, &handle) {
            return Ok(handle);
        }
        // A freshly constructed duplicate has nothing to fold in.
        if !handle.share_snapshot().is_empty() {
            self.merge_handles(&canonical, &handle)?;
            debug!(key = %handle.key(), "duplicate handle folded into canonical");
        }
        Ok(canonical)
    }

    /// Fold `dupe`'s share reservations into `orig`.
    ///
    /// Both object locks are taken in address order. On success `dupe` no
    /// longer owns any reservation.
    pub fn merge_handles(&self, orig: &ObjectHandle, dupe: &ObjectHandle) -> FsResult<()> {
        if std::ptr::eq(orig, dupe) {
            return Ok(());
        }
        if orig.key() != dupe.key() {
            return Err(FsError::InvalidArgument);
        }

        let orig_first = (orig as *const ObjectHandle) < (dupe as *const ObjectHandle);
        let (mut orig_share, mut dupe_share) = if orig_first {
            let o = orig.share.write();
            let d = dupe.share.write();
            (o, d)
        } else {
            let d = dupe.share.write();
            let o = orig.share.write();
            (o, d)
        };

        match orig_share.merge(&dupe_share) {
            Ok(()) => {
                *dupe_share = ShareReservation::new();
                Ok(())
            }
            Err(err) => {
                debug!(key = %orig.key(), "handle merge refused by share reservations");
                Err(err)
            }
        }
    }

    /// Rebuild a handle from its wire form.
    pub fn create_handle(&self, wire: &[u8]) -> FsResult<(Arc<ObjectHandle>, Stat)> {
        let key = ObjectKey::from_wire(wire)?;
        if key.fsid != self.engine().fsid() {
            return Err(FsError::InvalidArgument);
        }
        let cached = self.arena.lock().get(&key).and_then(Weak::upgrade);
        if let Some(handle) = cached {
            let stat = self.engine().get_attributes(handle.item())?;
            return Ok((handle, stat));
        }
        let (item, stat) = self.engine().lookup_fileid(key.fileid)?;
        let handle = self.intern(self.construct_handle(item, &stat))?;
        Ok((handle, stat))
    }

    /// Number of live handles in the arena.
    pub fn cached_handles(&self) -> usize {
        self.arena.lock().values().filter(|weak| weak.strong_count() > 0).count()
    }
}

impl Drop for Export {
    fn drop(&mut self) {
        info!(export = %self.ctx.name, live_handles = self.cached_handles(), "export released");
    }
}
