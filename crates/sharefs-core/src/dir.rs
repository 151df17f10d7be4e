// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Namespace operations on an export: lookup, mkdir, readdir, getattrs

use std::sync::Arc;

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::export::Export;
use crate::handle::ObjectHandle;
use crate::types::{AttrSet, DirEntry, Stat};

impl Export {
    /// Resolve `name` in `parent` to its canonical handle.
    pub fn lookup(&self, parent: &ObjectHandle, name: &str) -> FsResult<(Arc<ObjectHandle>, Stat)> {
        parent.require_directory()?;
        validate_name(name)?;
        let (item, stat) = self.engine().lookup_child(parent.item(), name)?;
        let handle = self.intern(self.construct_handle(item, &stat))?;
        Ok((handle, stat))
    }

    /// Resolve a `/`-separated path relative to the export root.
    pub fn lookup_path(&self, path: &str) -> FsResult<(Arc<ObjectHandle>, Stat)> {
        let mut current = self.root();
        let mut stat = self.getattrs(&current)?;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            let (next, next_stat) = self.lookup(&current, component)?;
            current = next;
            stat = next_stat;
        }
        Ok((current, stat))
    }

    /// Create a directory. The mode defaults to 0755 and is masked with the
    /// module umask.
    pub fn mkdir(
        &self,
        parent: &ObjectHandle,
        name: &str,
        attrs: &AttrSet,
    ) -> FsResult<(Arc<ObjectHandle>, Stat)> {
        parent.require_directory()?;
        validate_name(name)?;
        let mode = attrs.mode.unwrap_or(0o755) & !self.module().umask;
        let initial = AttrSet {
            mode: Some(mode),
            ..attrs.clone()
        };
        debug!(export = %self.name(), parent = %parent.key(), name, mode = format_args!("{:o}", mode), "mkdir");
        let (item, stat) = self.engine().mkdir(parent.item(), name, &initial)?;
        let handle = self.intern(self.construct_handle(item, &stat))?;
        Ok((handle, stat))
    }

    /// Enumerate `dir` starting after cookie `whence` (0 for the start).
    ///
    /// `visit` returns `false` to stop early. Returns `true` when the end of
    /// the directory was reached.
    pub fn readdir<F>(&self, dir: &ObjectHandle, whence: u64, mut visit: F) -> FsResult<bool>
    where
        F: FnMut(&DirEntry) -> bool,
    {
        dir.require_directory()?;
        let entries = self.engine().read_dir(dir.item(), whence)?;
        for entry in &entries {
            if !visit(entry) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn getattrs(&self, handle: &ObjectHandle) -> FsResult<Stat> {
        Ok(self.engine().get_attributes(handle.item())?)
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExportConfig, ModuleConfig};
    use crate::types::ObjectType;

    fn export_with_umask(umask: u32) -> Export {
        let module = ModuleConfig {
            umask,
            ..ModuleConfig::default()
        };
        Export::in_memory(module, ExportConfig::named("dir")).unwrap().0
    }

    #[test]
    fn mkdir_then_lookup_yields_same_handle() {
        let export = export_with_umask(0o022);
        let root = export.root();
        let (made, stat) = export.mkdir(&root, "sub", &AttrSet::with_mode(0o777)).unwrap();
        assert_eq!(stat.kind(), ObjectType::Directory);
        assert_eq!(stat.mode & 0o777, 0o755);
        let (found, _) = export.lookup(&root, "sub").unwrap();
        assert!(Arc::ptr_eq(&made, &found));
        assert_eq!(
            export.mkdir(&root, "sub", &AttrSet::default()).unwrap_err(),
            FsError::AlreadyExists
        );
    }

    #[test]
    fn lookup_path_walks_components() {
        let export = export_with_umask(0);
        let root = export.root();
        let (a, _) = export.mkdir(&root, "a", &AttrSet::default()).unwrap();
        let (b, _) = export.mkdir(&a, "b", &AttrSet::default()).unwrap();
        let (found, _) = export.lookup_path("/a/./b/").unwrap();
        assert!(Arc::ptr_eq(&found, &b));
        let (top, _) = export.lookup_path("").unwrap();
        assert!(Arc::ptr_eq(&top, &root));
        assert_eq!(export.lookup_path("a/missing").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn lookup_rejects_bad_names_and_non_directories() {
        let export = export_with_umask(0);
        let root = export.root();
        assert_eq!(export.lookup(&root, "..").unwrap_err(), FsError::InvalidArgument);
        assert_eq!(export.lookup(&root, "a/b").unwrap_err(), FsError::InvalidArgument);
    }

    #[test]
    fn readdir_stops_when_visitor_declines() {
        let export = export_with_umask(0);
        let root = export.root();
        for name in ["x", "y", "z"] {
            export.mkdir(&root, name, &AttrSet::default()).unwrap();
        }

        let mut seen = Vec::new();
        let eof = export
            .readdir(&root, 0, |entry| {
                seen.push((entry.name.clone(), entry.cookie));
                seen.len() < 2
            })
            .unwrap();
        assert!(!eof);
        assert_eq!(seen.len(), 2);

        let resume = seen[1].1;
        let mut rest = Vec::new();
        let eof = export
            .readdir(&root, resume, |entry| {
                rest.push(entry.name.clone());
                true
            })
            .unwrap();
        assert!(eof);
        assert_eq!(rest, vec!["z".to_string()]);
    }
}
