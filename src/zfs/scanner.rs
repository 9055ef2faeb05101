//! Builds the in-memory view: every pool, every filesystem, every snapshot,
//! with effective property values and verbatim source tags.

use tracing::debug;

use super::dataset::{Dataset, DatasetSources, PropertySource, is_snapshot_name};
use super::{
    Adapter, BOOTFS_DATASETS_PROP, BOOTFS_PROP, CANMOUNT_PROP, CREATION_PROP, Error,
    LAST_USED_PROP, MOUNTED_PROP, MOUNTPOINT_PROP, ORIGIN_PROP, RawProperty,
};

/// Scan every pool through the adapter into a flat, unordered dataset list.
///
/// Pure with respect to ZFS state: this only reads. Source tags are taken
/// as the adapter reported them; inheritance is never re-derived here.
pub fn scan<A: Adapter>(adapter: &A) -> Result<Vec<Dataset>, Error> {
    let mut datasets = Vec::new();
    for pool in adapter.pools()? {
        collect(adapter, &pool, &mut datasets)?;
        for child in adapter.children(&pool, true)? {
            collect(adapter, &child, &mut datasets)?;
        }
    }
    debug!(datasets = datasets.len(), "scanned pools");
    Ok(datasets)
}

fn collect<A: Adapter>(adapter: &A, name: &str, out: &mut Vec<Dataset>) -> Result<(), Error> {
    let props = adapter.properties(name)?;
    let get = |key: &str| props.get(key).cloned().unwrap_or_default();
    let is_snapshot = is_snapshot_name(name);

    let creation: i64 = get(CREATION_PROP).value.parse().unwrap_or(0);
    let mountpoint = get(MOUNTPOINT_PROP);
    let canmount = get(CANMOUNT_PROP);
    let bootfs = get(BOOTFS_PROP);
    let last_used = get(LAST_USED_PROP);
    let bootfs_datasets = get(BOOTFS_DATASETS_PROP);

    out.push(Dataset {
        name: name.to_string(),
        is_snapshot,
        mountpoint: mountpoint.value.clone(),
        canmount: if is_snapshot {
            // Not applicable on snapshots, whatever the adapter says.
            "-".to_string()
        } else {
            non_empty_or(canmount.value.clone(), "on")
        },
        mounted: get(MOUNTED_PROP).value == "yes",
        bootfs: non_empty_or(bootfs.value.clone(), "no"),
        last_used: effective_last_used(is_snapshot, &last_used, creation),
        bootfs_datasets: bootfs_datasets.value.clone(),
        origin: get(ORIGIN_PROP).value,
        sources: DatasetSources {
            mountpoint: PropertySource::parse(&mountpoint.source),
            canmount: if is_snapshot {
                PropertySource::None
            } else {
                PropertySource::parse(&canmount.source)
            },
            bootfs: PropertySource::parse(&bootfs.source),
            last_used: if is_snapshot {
                PropertySource::None
            } else {
                PropertySource::parse(&last_used.source)
            },
            bootfs_datasets: PropertySource::parse(&bootfs_datasets.source),
        },
    });
    Ok(())
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

// Snapshots are stamped by their creation; filesystems prefer the recorded
// last-used property and fall back to creation.
fn effective_last_used(is_snapshot: bool, last_used: &RawProperty, creation: i64) -> i64 {
    if is_snapshot {
        return creation;
    }
    last_used.value.parse().unwrap_or(creation)
}
