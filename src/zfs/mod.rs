use std::collections::HashMap;

use thiserror::Error as ThisError;

pub mod dataset;
pub mod engine;
pub mod libzfs;
pub mod mock;
pub(crate) mod rules;
pub mod scanner;
pub(crate) mod transaction;
pub(crate) mod validation;

pub use dataset::{Dataset, DatasetSources, PropertySource};
pub use engine::Zfs;
pub use libzfs::LibZfsAdapter;
pub use mock::FakePools;

/// Property marking a dataset as a bootable system root (`yes`/`no`).
pub const BOOTFS_PROP: &str = "bootfs";
/// Whether a dataset may be mounted automatically (`on`/`off`/`noauto`).
pub const CANMOUNT_PROP: &str = "canmount";
/// The resolved mount path of a dataset.
pub const MOUNTPOINT_PROP: &str = "mountpoint";
/// Whether a dataset is currently mounted (`yes`/`no`).
pub const MOUNTED_PROP: &str = "mounted";
/// User property listing the system installations a dataset belongs to.
pub const BOOTFS_DATASETS_PROP: &str = "zfstx:bootfs-datasets";
/// User property recording when a filesystem was last in use.
pub const LAST_USED_PROP: &str = "zfstx:last-used";

/// Clone origin snapshot of a dataset (read-only).
pub(crate) const ORIGIN_PROP: &str = "origin";
/// Creation time of a dataset in seconds (read-only).
pub(crate) const CREATION_PROP: &str = "creation";

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("dataset '{name}' doesn't exist")]
    NotFound { name: String },

    #[error("'{name}' already exists")]
    AlreadyExists { name: String },

    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("property '{name}' can't be changed on '{dataset}': {reason}")]
    PropertyPolicy {
        name: String,
        dataset: String,
        reason: String,
    },

    #[error("'{name}' has a dependent clone '{clone}'")]
    HasClones { name: String, clone: String },

    #[error("missing intermediate snapshot '{snapshot}'")]
    MissingIntermediate { snapshot: String },

    #[error("destroy isn't allowed inside a transaction")]
    TransactionViolation,

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl Error {
    pub fn not_found(name: &str) -> Self {
        Error::NotFound {
            name: name.to_string(),
        }
    }

    pub fn already_exists(name: &str) -> Self {
        Error::AlreadyExists {
            name: name.to_string(),
        }
    }

    pub fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn property_policy(name: &str, dataset: &str, reason: impl Into<String>) -> Self {
        Error::PropertyPolicy {
            name: name.to_string(),
            dataset: dataset.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure surfaced by the underlying ZFS subsystem, tagged with the dataset
/// the operation targeted.
#[derive(ThisError, Debug)]
#[error("zfs operation on '{dataset}' failed: {message}")]
pub struct AdapterError {
    pub dataset: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(dataset: &str, message: impl Into<String>) -> Self {
        AdapterError {
            dataset: dataset.to_string(),
            message: message.into(),
        }
    }
}

/// A property value together with the source tag ZFS reported for it
/// (`local`, `inherited from <dataset>`, `default`, or `-`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawProperty {
    pub value: String,
    pub source: String,
}

impl RawProperty {
    pub fn new(value: impl Into<String>, source: impl Into<String>) -> Self {
        RawProperty {
            value: value.into(),
            source: source.into(),
        }
    }
}

/// Engine construction options.
#[derive(Clone, Copy, Debug, Default)]
pub struct Options {
    /// Record inverse operations so the whole sequence can be cancelled.
    pub transactions: bool,
}

/// Capability interface over the host ZFS subsystem.
///
/// The engine treats this as opaque: it is the only seam through which ZFS
/// is observed or changed. Implementations report failures with the dataset
/// identifier attached and are not expected to be thread-safe; the engine
/// serializes every call behind its own mutex.
pub trait Adapter {
    /// Names of the root dataset of every imported pool.
    fn pools(&self) -> Result<Vec<String>, AdapterError>;

    /// Descendants of `dataset`: child filesystems plus snapshots, of the
    /// whole subtree when `recursive`, otherwise only the first level.
    fn children(&self, dataset: &str, recursive: bool) -> Result<Vec<String>, AdapterError>;

    /// Effective properties of one dataset with their verbatim source tags.
    fn properties(&self, dataset: &str) -> Result<HashMap<String, RawProperty>, AdapterError>;

    /// Create `dataset@snap_name`, and the same snapshot on every descendant
    /// when `recursive` (atomic across the subtree at the ZFS level).
    fn create_snapshot(
        &mut self,
        dataset: &str,
        snap_name: &str,
        recursive: bool,
    ) -> Result<(), AdapterError>;

    /// Clone `snapshot` into a new dataset `target`, applying the given
    /// property overrides at creation.
    fn clone_snapshot(
        &mut self,
        snapshot: &str,
        target: &str,
        overrides: &[(String, String)],
    ) -> Result<(), AdapterError>;

    /// Reverse the origin relationship between `dataset` and the dataset its
    /// origin snapshot belongs to.
    fn promote(&mut self, dataset: &str) -> Result<(), AdapterError>;

    /// Destroy exactly one filesystem or snapshot. Fails while live clones
    /// depend on it.
    fn destroy(&mut self, dataset: &str) -> Result<(), AdapterError>;

    /// Set one property to a local value.
    fn set_property(&mut self, dataset: &str, name: &str, value: &str)
    -> Result<(), AdapterError>;

    /// Drop the local value of one property so it is inherited again, or
    /// removed entirely for user properties with no ancestor value.
    fn inherit_property(&mut self, dataset: &str, name: &str) -> Result<(), AdapterError>;
}
