//! Transactional management core for bootable ZFS system installations.
//!
//! This crate presents an in-memory view of every dataset on the system and
//! five mutating verbs (snapshot, clone, promote, destroy, set-property)
//! which validate against a fresh scan, delegate to the underlying ZFS
//! subsystem, and (when transactions are enabled) record inverse operations
//! on a revert stack so a whole sequence can be undone with [`Zfs::cancel`].
//!
//! The ZFS subsystem itself is reached through the [`zfs::Adapter`]
//! capability trait. Production code uses the libzfs-backed adapter; tests
//! run against the in-memory [`zfs::mock::FakePools`] emulator.

pub mod zfs;

pub use zfs::{Dataset, Error, Options, Zfs};
