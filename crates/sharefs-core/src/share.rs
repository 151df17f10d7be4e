// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Share reservation bookkeeping for regular files
//!
//! A [`ShareReservation`] is the aggregate of every share-carrying open on one
//! object: how many opens want read or write access and how many deny read or
//! write access to others. It is mutated only while the owning handle's object
//! lock is held for writing.

use crate::error::{FsError, FsResult};
use crate::types::OpenFlags;

/// Aggregate access/deny counters of one regular file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareReservation {
    pub access_read: u32,
    pub access_write: u32,
    pub deny_read: u32,
    pub deny_write: u32,
    /// Deny-write reservations that `bypass` cannot waive.
    pub deny_write_mand: u32,
}

impl ShareReservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Counter snapshot in table order: access read/write, deny read/write/mandatory.
    pub fn counts(&self) -> [u32; 5] {
        [
            self.access_read,
            self.access_write,
            self.deny_read,
            self.deny_write,
            self.deny_write_mand,
        ]
    }

    /// Check a prospective open against the current aggregate.
    ///
    /// `bypass` waives the advisory deny bits against the caller's access;
    /// mandatory deny-write is always enforced.
    pub fn check_conflict(&self, flags: OpenFlags, bypass: bool) -> FsResult<()> {
        if flags.contains(OpenFlags::READ) && self.deny_read > 0 && !bypass {
            return Err(FsError::ShareConflict);
        }
        if flags.contains(OpenFlags::WRITE)
            && (self.deny_write_mand > 0 || (!bypass && self.deny_write > 0))
        {
            return Err(FsError::ShareConflict);
        }
        if flags.contains(OpenFlags::DENY_READ) && self.access_read > 0 {
            return Err(FsError::ShareConflict);
        }
        if flags.intersects(OpenFlags::DENY_WRITE | OpenFlags::DENY_WRITE_MAND)
            && self.access_write > 0
        {
            return Err(FsError::ShareConflict);
        }
        Ok(())
    }

    /// Check a mode change of one owner without counting that owner against
    /// itself: its `old` contribution is removed before checking `new`.
    pub fn check_conflict_excluding(&self, old: OpenFlags, new: OpenFlags) -> FsResult<()> {
        let mut others = *self;
        others.apply_delta(old, OpenFlags::CLOSED);
        others.check_conflict(new, false)
    }

    /// Replace the contribution of `old` with that of `new`.
    pub fn apply_delta(&mut self, old: OpenFlags, new: OpenFlags) {
        fn adjust(counter: &mut u32, was: bool, now: bool) {
            match (was, now) {
                (true, false) => {
                    debug_assert!(*counter > 0, "share counter underflow");
                    *counter = counter.saturating_sub(1);
                }
                (false, true) => *counter += 1,
                _ => {}
            }
        }

        adjust(
            &mut self.access_read,
            old.contains(OpenFlags::READ),
            new.contains(OpenFlags::READ),
        );
        adjust(
            &mut self.access_write,
            old.contains(OpenFlags::WRITE),
            new.contains(OpenFlags::WRITE),
        );
        adjust(
            &mut self.deny_read,
            old.contains(OpenFlags::DENY_READ),
            new.contains(OpenFlags::DENY_READ),
        );
        adjust(
            &mut self.deny_write,
            old.contains(OpenFlags::DENY_WRITE),
            new.contains(OpenFlags::DENY_WRITE),
        );
        adjust(
            &mut self.deny_write_mand,
            old.contains(OpenFlags::DENY_WRITE_MAND),
            new.contains(OpenFlags::DENY_WRITE_MAND),
        );
    }

    /// Fold another aggregate for the same object into this one.
    ///
    /// Fails without touching `self` when either side's access meets the
    /// other side's deny bits.
    pub fn merge(&mut self, other: &ShareReservation) -> FsResult<()> {
        let denies_write = |s: &ShareReservation| s.deny_write > 0 || s.deny_write_mand > 0;

        if (other.access_read > 0 && self.deny_read > 0)
            || (other.deny_read > 0 && self.access_read > 0)
            || (other.access_write > 0 && denies_write(self))
            || (denies_write(other) && self.access_write > 0)
        {
            return Err(FsError::ShareConflict);
        }

        self.access_read += other.access_read;
        self.access_write += other.access_write;
        self.deny_read += other.deny_read;
        self.deny_write += other.deny_write;
        self.deny_write_mand += other.deny_write_mand;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(flags: OpenFlags) -> ShareReservation {
        let mut share = ShareReservation::new();
        share.apply_delta(OpenFlags::CLOSED, flags);
        share
    }

    #[test]
    fn deny_write_blocks_writers_not_readers() {
        let share = with(OpenFlags::READ | OpenFlags::DENY_WRITE);
        assert_eq!(share.check_conflict(OpenFlags::WRITE, false), Err(FsError::ShareConflict));
        assert!(share.check_conflict(OpenFlags::READ, false).is_ok());
    }

    #[test]
    fn existing_access_blocks_new_deny() {
        let share = with(OpenFlags::RDWR);
        assert_eq!(
            share.check_conflict(OpenFlags::READ | OpenFlags::DENY_READ, false),
            Err(FsError::ShareConflict)
        );
        assert_eq!(
            share.check_conflict(OpenFlags::READ | OpenFlags::DENY_WRITE, false),
            Err(FsError::ShareConflict)
        );
    }

    #[test]
    fn bypass_skips_advisory_but_not_mandatory_deny() {
        let advisory = with(OpenFlags::READ | OpenFlags::DENY_WRITE | OpenFlags::DENY_READ);
        assert!(advisory.check_conflict(OpenFlags::RDWR, true).is_ok());

        let mandatory = with(OpenFlags::READ | OpenFlags::DENY_WRITE_MAND);
        assert!(mandatory.check_conflict(OpenFlags::READ, true).is_ok());
        assert_eq!(
            mandatory.check_conflict(OpenFlags::WRITE, true),
            Err(FsError::ShareConflict)
        );
    }

    #[test]
    fn apply_delta_round_trips_to_empty() {
        let flags = OpenFlags::RDWR | OpenFlags::DENY_READ | OpenFlags::DENY_WRITE_MAND;
        let mut share = with(flags);
        assert_eq!(share.access_read, 1);
        assert_eq!(share.deny_write_mand, 1);
        share.apply_delta(flags, OpenFlags::READ);
        assert_eq!(
            share,
            ShareReservation {
                access_read: 1,
                ..Default::default()
            }
        );
        share.apply_delta(OpenFlags::READ, OpenFlags::CLOSED);
        assert!(share.is_empty());
    }

    #[test]
    fn reopen_check_excludes_own_contribution() {
        // Sole reader with deny-write upgrading to read-write.
        let share = with(OpenFlags::READ | OpenFlags::DENY_WRITE);
        assert!(share.check_conflict(OpenFlags::RDWR, false).is_err());
        assert!(share
            .check_conflict_excluding(OpenFlags::READ | OpenFlags::DENY_WRITE, OpenFlags::RDWR)
            .is_ok());

        // A second owner's deny still counts.
        let mut share = share;
        share.apply_delta(OpenFlags::CLOSED, OpenFlags::READ | OpenFlags::DENY_WRITE);
        assert_eq!(
            share.check_conflict_excluding(
                OpenFlags::READ | OpenFlags::DENY_WRITE,
                OpenFlags::RDWR
            ),
            Err(FsError::ShareConflict)
        );
    }

    #[test]
    fn merge_compatible_sums_counters() {
        let mut orig = with(OpenFlags::READ);
        let dupe = with(OpenFlags::READ);
        orig.merge(&dupe).unwrap();
        assert_eq!(orig.access_read, 2);
        assert_eq!(orig.access_write, 0);
    }

    #[test]
    fn merge_incompatible_leaves_original_untouched() {
        let mut orig = with(OpenFlags::READ | OpenFlags::DENY_WRITE);
        let before = orig;
        let dupe = with(OpenFlags::WRITE);
        assert_eq!(orig.merge(&dupe), Err(FsError::ShareConflict));
        assert_eq!(orig, before);

        let mut writer = with(OpenFlags::WRITE);
        let denier = with(OpenFlags::READ | OpenFlags::DENY_WRITE_MAND);
        assert_eq!(writer.merge(&denier), Err(FsError::ShareConflict));
    }
}
