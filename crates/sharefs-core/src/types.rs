// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for sharefs

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FsError, FsResult};

bitflags! {
    /// Access, deny and open-time bits carried by an open request.
    ///
    /// The access part (`READ`/`WRITE`) is what a descriptor is opened for,
    /// the deny part is the share reservation the opener imposes on others.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const RDWR = Self::READ.bits() | Self::WRITE.bits();
        /// Truncate on open. Never stored with a descriptor's mode.
        const TRUNC = 0x0004;
        const DENY_READ = 0x0008;
        const DENY_WRITE = 0x0010;
        /// Deny-write that cannot be bypassed (mandatory locking).
        const DENY_WRITE_MAND = 0x0020;
    }
}

impl OpenFlags {
    pub const CLOSED: OpenFlags = OpenFlags::empty();
    const DENY_BITS: OpenFlags = OpenFlags::DENY_READ
        .union(OpenFlags::DENY_WRITE)
        .union(OpenFlags::DENY_WRITE_MAND);

    pub fn access(self) -> OpenFlags {
        self & OpenFlags::RDWR
    }

    pub fn deny(self) -> OpenFlags {
        self & Self::DENY_BITS
    }

    pub fn is_closed(self) -> bool {
        self.access().is_empty()
    }

    /// The part of the flags that describes an open descriptor's mode.
    pub fn persistent(self) -> OpenFlags {
        self - OpenFlags::TRUNC
    }

    /// Whether a descriptor opened with `self` can serve I/O needing `wanted`.
    pub fn satisfies(self, wanted: OpenFlags) -> bool {
        !self.is_closed() && self.access().contains(wanted.access())
    }
}

/// Object type, fixed at handle construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    RegularFile,
    Directory,
    Symlink,
    Other,
}

impl ObjectType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFREG as u32 => ObjectType::RegularFile,
            m if m == libc::S_IFDIR as u32 => ObjectType::Directory,
            m if m == libc::S_IFLNK as u32 => ObjectType::Symlink,
            _ => ObjectType::Other,
        }
    }
}

/// Stable, wire-portable identity of an object: filesystem id plus file id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub fsid: u64,
    pub fileid: u64,
}

impl ObjectKey {
    pub const WIRE_LEN: usize = 16;

    pub fn new(fsid: u64, fileid: u64) -> Self {
        Self { fsid, fileid }
    }

    pub fn to_wire(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[..8].copy_from_slice(&self.fsid.to_be_bytes());
        out[8..].copy_from_slice(&self.fileid.to_be_bytes());
        out
    }

    pub fn from_wire(bytes: &[u8]) -> FsResult<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return Err(FsError::InvalidArgument);
        }
        let mut fsid = [0u8; 8];
        let mut fileid = [0u8; 8];
        fsid.copy_from_slice(&bytes[..8]);
        fileid.copy_from_slice(&bytes[8..]);
        Ok(Self {
            fsid: u64::from_be_bytes(fsid),
            fileid: u64::from_be_bytes(fileid),
        })
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.to_wire()))
    }
}

/// Seconds + nanoseconds timestamp
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileTime {
    pub secs: i64,
    pub nanos: u32,
}

impl FileTime {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    pub fn now() -> Self {
        let since = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs() as i64,
            nanos: since.subsec_nanos(),
        }
    }
}

/// Attribute snapshot returned by the storage engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub fsid: u64,
    pub fileid: u64,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: FileTime,
    pub mtime: FileTime,
    pub ctime: FileTime,
}

impl Stat {
    pub fn kind(&self) -> ObjectType {
        ObjectType::from_mode(self.mode)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.fsid, self.fileid)
    }
}

/// Attributes to apply on create or setattr. `None` leaves a field alone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrSet {
    /// Permission bits only; type bits are ignored.
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<FileTime>,
    pub mtime: Option<FileTime>,
}

impl AttrSet {
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Everything except the mode.
    pub fn without_mode(&self) -> Self {
        Self {
            mode: None,
            ..self.clone()
        }
    }
}

/// How an open-by-name treats a missing or pre-existing target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    /// Open an existing object only.
    NoCreate,
    /// Create if missing, open if present.
    Unchecked,
    /// Create, fail if present.
    Guarded,
    /// Create with a verifier for idempotent retries.
    Exclusive,
    /// `Exclusive` that also sets attributes.
    Exclusive41,
}

impl CreateMode {
    /// Modes that carry a create verifier.
    pub fn uses_verifier(self) -> bool {
        matches!(self, CreateMode::Exclusive | CreateMode::Exclusive41)
    }
}

/// Opaque create verifier, stored in the object's atime/mtime seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Verifier(pub [u8; 8]);

impl Verifier {
    fn halves(&self) -> (u32, u32) {
        let mut hi = [0u8; 4];
        let mut lo = [0u8; 4];
        hi.copy_from_slice(&self.0[..4]);
        lo.copy_from_slice(&self.0[4..]);
        (u32::from_be_bytes(hi), u32::from_be_bytes(lo))
    }

    pub fn apply_to(&self, attrs: &mut AttrSet) {
        let (hi, lo) = self.halves();
        attrs.atime = Some(FileTime::new(hi as i64, 0));
        attrs.mtime = Some(FileTime::new(lo as i64, 0));
    }

    pub fn matches(&self, stat: &Stat) -> bool {
        let (hi, lo) = self.halves();
        stat.atime.secs == hi as i64 && stat.mtime.secs == lo as i64
    }
}

impl std::fmt::Display for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Directory entry as reported by the storage engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub fileid: u64,
    pub kind: ObjectType,
    /// Resume cookie: passing it back continues after this entry.
    pub cookie: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_split_access_and_deny() {
        let flags = OpenFlags::RDWR | OpenFlags::DENY_WRITE | OpenFlags::TRUNC;
        assert_eq!(flags.access(), OpenFlags::RDWR);
        assert_eq!(flags.deny(), OpenFlags::DENY_WRITE);
        assert_eq!(flags.persistent(), OpenFlags::RDWR | OpenFlags::DENY_WRITE);
        assert!(OpenFlags::DENY_READ.is_closed());
    }

    #[test]
    fn satisfies_requires_an_open_superset() {
        assert!(OpenFlags::RDWR.satisfies(OpenFlags::READ));
        assert!(!OpenFlags::READ.satisfies(OpenFlags::WRITE));
        assert!(!OpenFlags::CLOSED.satisfies(OpenFlags::CLOSED));
    }

    #[test]
    fn object_key_wire_form() {
        let key = ObjectKey::new(7, 0x1122_3344);
        let wire = key.to_wire();
        assert_eq!(ObjectKey::from_wire(&wire).unwrap(), key);
        assert_eq!(key.to_string(), "00000000000000070000000011223344");
        assert_eq!(ObjectKey::from_wire(&wire[..8]), Err(FsError::InvalidArgument));
    }

    #[test]
    fn verifier_lands_in_times() {
        let verifier = Verifier(*b"\x00\x00\x00\x01\x00\x00\x00\x02");
        let mut attrs = AttrSet::default();
        verifier.apply_to(&mut attrs);
        assert_eq!(attrs.atime, Some(FileTime::new(1, 0)));
        assert_eq!(attrs.mtime, Some(FileTime::new(2, 0)));
    }

    #[test]
    fn object_type_from_mode() {
        assert_eq!(
            ObjectType::from_mode(libc::S_IFREG as u32 | 0o644),
            ObjectType::RegularFile
        );
        assert_eq!(ObjectType::from_mode(libc::S_IFDIR as u32 | 0o755), ObjectType::Directory);
        assert_eq!(ObjectType::from_mode(libc::S_IFIFO as u32), ObjectType::Other);
    }
}
