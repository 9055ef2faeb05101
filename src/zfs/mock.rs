//! An in-memory ZFS emulator implementing [`Adapter`] with no side effects.
//!
//! State is seeded through the chainable constructors and then behaves like
//! a real pool set: inherited mountpoints are re-rooted along the path,
//! user properties flow down to descendants, promote migrates snapshots and
//! rewrites origins, destroy refuses datasets that still have dependents.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;

use super::dataset::{filesystem_of, in_subtree, is_snapshot_name, parent_of, split_snapshot_name};
use super::{Adapter, AdapterError, CREATION_PROP, MOUNTED_PROP, MOUNTPOINT_PROP, ORIGIN_PROP, RawProperty};
use super::{BOOTFS_PROP, CANMOUNT_PROP};

#[derive(Clone, Debug, Default)]
struct FakeDataset {
    snapshot: bool,
    /// Local property values only; effective values are resolved on read.
    mountpoint: Option<String>,
    canmount: Option<String>,
    bootfs: Option<String>,
    user: BTreeMap<String, String>,
    origin: Option<String>,
    mounted: bool,
    creation: i64,
    /// Creation tie-breaker so same-second snapshots still order.
    seq: u64,
}

/// Fake pool state backing scanner and engine tests.
pub struct FakePools {
    datasets: BTreeMap<String, FakeDataset>,
    clock: fn() -> i64,
    seq: u64,
    last: Option<String>,
}

fn wall_clock() -> i64 {
    Utc::now().timestamp()
}

impl FakePools {
    pub fn new() -> Self {
        FakePools {
            datasets: BTreeMap::new(),
            clock: wall_clock,
            seq: 0,
            last: None,
        }
    }

    /// Replace the creation-time source (defaults to the wall clock).
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Seed a filesystem. Pool roots are plain filesystems without `/`.
    pub fn filesystem(mut self, name: &str) -> Self {
        let entry = self.blank();
        self.datasets.insert(name.to_string(), entry);
        self.last = Some(name.to_string());
        self
    }

    /// Seed a snapshot (`dataset@name`).
    pub fn snapshot(mut self, name: &str) -> Self {
        let mut entry = self.blank();
        entry.snapshot = true;
        self.datasets.insert(name.to_string(), entry);
        self.last = Some(name.to_string());
        self
    }

    /// Set a local mountpoint on the dataset added last.
    pub fn mountpoint(mut self, value: &str) -> Self {
        self.last_mut().mountpoint = Some(value.to_string());
        self
    }

    /// Set a local canmount value on the dataset added last.
    pub fn canmount(mut self, value: &str) -> Self {
        self.last_mut().canmount = Some(value.to_string());
        self
    }

    /// Set a local bootfs value on the dataset added last.
    pub fn bootfs(mut self, value: &str) -> Self {
        self.last_mut().bootfs = Some(value.to_string());
        self
    }

    /// Set a local user property on the dataset added last.
    pub fn user_property(mut self, name: &str, value: &str) -> Self {
        self.last_mut().user.insert(name.to_string(), value.to_string());
        self
    }

    /// Mark the dataset added last as currently mounted.
    pub fn mounted(mut self) -> Self {
        self.last_mut().mounted = true;
        self
    }

    /// Seed an origin pointer on the dataset added last (a pre-existing clone).
    pub fn origin(mut self, snapshot: &str) -> Self {
        self.last_mut().origin = Some(snapshot.to_string());
        self
    }

    /// Set a local user property on a dataset seeded earlier.
    pub fn user_property_on(mut self, dataset: &str, name: &str, value: &str) -> Self {
        self.datasets
            .get_mut(dataset)
            .expect("dataset not seeded")
            .user
            .insert(name.to_string(), value.to_string());
        self
    }

    fn blank(&mut self) -> FakeDataset {
        self.seq += 1;
        FakeDataset {
            creation: (self.clock)(),
            seq: self.seq,
            ..FakeDataset::default()
        }
    }

    fn last_mut(&mut self) -> &mut FakeDataset {
        let name = self.last.as_ref().expect("no dataset seeded yet");
        self.datasets.get_mut(name).expect("last dataset vanished")
    }

    fn get(&self, name: &str) -> Result<&FakeDataset, AdapterError> {
        self.datasets
            .get(name)
            .ok_or_else(|| AdapterError::new(name, "no such dataset"))
    }

    fn stamp(&mut self) -> (i64, u64) {
        self.seq += 1;
        ((self.clock)(), self.seq)
    }

    /// Effective mountpoint of a filesystem with its source tag.
    fn resolve_mountpoint(&self, name: &str) -> (String, String) {
        let mut holder = name;
        loop {
            if let Some(ds) = self.datasets.get(holder) {
                if let Some(local) = &ds.mountpoint {
                    if holder == name {
                        return (local.clone(), "local".to_string());
                    }
                    let relative = &name[holder.len() + 1..];
                    return (
                        join_mountpoint(local, relative),
                        format!("inherited from {holder}"),
                    );
                }
            }
            match parent_of(holder) {
                Some(parent) => holder = parent,
                None => break,
            }
        }
        (format!("/{name}"), "default".to_string())
    }

    /// Effective user properties of a filesystem: nearest holder wins.
    fn resolve_user(&self, name: &str, local_holder: &str) -> BTreeMap<String, RawProperty> {
        let mut resolved = BTreeMap::new();
        let mut holder = Some(name);
        while let Some(current) = holder {
            if let Some(ds) = self.datasets.get(current) {
                for (key, value) in &ds.user {
                    resolved.entry(key.clone()).or_insert_with(|| {
                        let source = if current == local_holder {
                            "local".to_string()
                        } else {
                            format!("inherited from {current}")
                        };
                        RawProperty::new(value.clone(), source)
                    });
                }
            }
            holder = parent_of(current);
        }
        resolved
    }

    fn filesystems_under(&self, root: &str) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|(name, ds)| !ds.snapshot && in_subtree(root, name))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Default for FakePools {
    fn default() -> Self {
        FakePools::new()
    }
}

fn join_mountpoint(base: &str, relative: &str) -> String {
    // Non-path values ("none", "legacy") flow down literally.
    if !base.starts_with('/') {
        return base.to_string();
    }
    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}/{relative}")
}

impl Adapter for FakePools {
    fn pools(&self) -> Result<Vec<String>, AdapterError> {
        Ok(self
            .datasets
            .iter()
            .filter(|(name, ds)| !ds.snapshot && !name.contains('/'))
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn children(&self, dataset: &str, recursive: bool) -> Result<Vec<String>, AdapterError> {
        self.get(dataset)?;
        Ok(self
            .datasets
            .keys()
            .filter(|name| {
                if *name == dataset {
                    return false;
                }
                if recursive {
                    in_subtree(dataset, name)
                } else {
                    parent_of(name) == Some(dataset) && !is_snapshot_name(name)
                        || filesystem_of(name) == dataset && is_snapshot_name(name)
                }
            })
            .cloned()
            .collect())
    }

    fn properties(&self, dataset: &str) -> Result<HashMap<String, RawProperty>, AdapterError> {
        let ds = self.get(dataset)?;
        let mut props = HashMap::new();
        props.insert(
            CREATION_PROP.to_string(),
            RawProperty::new(ds.creation.to_string(), "-"),
        );

        if ds.snapshot {
            let fs = filesystem_of(dataset);
            let (mountpoint, source) = self.resolve_mountpoint(fs);
            props.insert(MOUNTPOINT_PROP.to_string(), RawProperty::new(mountpoint, source));
            props.insert(CANMOUNT_PROP.to_string(), RawProperty::new("-", "-"));
            props.insert(MOUNTED_PROP.to_string(), RawProperty::new("no", "-"));
            // Nothing is ever local on a snapshot; the filesystem's values
            // flow down with an inherited tag.
            for (key, value) in self.resolve_user(fs, dataset) {
                props.insert(key, value);
            }
            return Ok(props);
        }

        let (mountpoint, source) = self.resolve_mountpoint(dataset);
        props.insert(MOUNTPOINT_PROP.to_string(), RawProperty::new(mountpoint, source));
        props.insert(
            CANMOUNT_PROP.to_string(),
            match &ds.canmount {
                Some(value) => RawProperty::new(value.clone(), "local"),
                None => RawProperty::new("on", "default"),
            },
        );
        if let Some(bootfs) = &ds.bootfs {
            props.insert(BOOTFS_PROP.to_string(), RawProperty::new(bootfs.clone(), "local"));
        }
        props.insert(
            MOUNTED_PROP.to_string(),
            RawProperty::new(if ds.mounted { "yes" } else { "no" }, "-"),
        );
        if let Some(origin) = &ds.origin {
            props.insert(ORIGIN_PROP.to_string(), RawProperty::new(origin.clone(), "-"));
        }
        for (key, value) in self.resolve_user(dataset, dataset) {
            props.insert(key, value);
        }
        Ok(props)
    }

    fn create_snapshot(
        &mut self,
        dataset: &str,
        snap_name: &str,
        recursive: bool,
    ) -> Result<(), AdapterError> {
        let ds = self.get(dataset)?;
        if ds.snapshot {
            return Err(AdapterError::new(dataset, "can't snapshot a snapshot"));
        }

        let targets = if recursive {
            self.filesystems_under(dataset)
        } else {
            vec![dataset.to_string()]
        };

        // All-or-nothing, as the real recursive snapshot is.
        for target in &targets {
            let full = format!("{target}@{snap_name}");
            if self.datasets.contains_key(&full) {
                return Err(AdapterError::new(&full, "snapshot already exists"));
            }
        }
        let (creation, base_seq) = self.stamp();
        for (offset, target) in targets.iter().enumerate() {
            let full = format!("{target}@{snap_name}");
            self.datasets.insert(
                full,
                FakeDataset {
                    snapshot: true,
                    creation,
                    seq: base_seq + offset as u64,
                    ..FakeDataset::default()
                },
            );
        }
        self.seq += targets.len() as u64;
        Ok(())
    }

    fn clone_snapshot(
        &mut self,
        snapshot: &str,
        target: &str,
        overrides: &[(String, String)],
    ) -> Result<(), AdapterError> {
        let src = self.get(snapshot)?;
        if !src.snapshot {
            return Err(AdapterError::new(snapshot, "not a snapshot"));
        }
        if self.datasets.contains_key(target) {
            return Err(AdapterError::new(target, "dataset already exists"));
        }
        if let Some(parent) = parent_of(target) {
            if !self.datasets.contains_key(parent) {
                return Err(AdapterError::new(target, "parent dataset doesn't exist"));
            }
        }

        let (creation, seq) = self.stamp();
        let mut clone = FakeDataset {
            origin: Some(snapshot.to_string()),
            creation,
            seq,
            ..FakeDataset::default()
        };
        for (name, value) in overrides {
            match name.as_str() {
                CANMOUNT_PROP => clone.canmount = Some(value.clone()),
                MOUNTPOINT_PROP => clone.mountpoint = Some(value.clone()),
                BOOTFS_PROP => clone.bootfs = Some(value.clone()),
                name if name.contains(':') => {
                    clone.user.insert(name.to_string(), value.clone());
                }
                _ => return Err(AdapterError::new(target, format!("unsupported property '{name}'"))),
            }
        }
        self.datasets.insert(target.to_string(), clone);
        Ok(())
    }

    fn promote(&mut self, dataset: &str) -> Result<(), AdapterError> {
        let ds = self.get(dataset)?;
        if ds.snapshot {
            return Err(AdapterError::new(dataset, "can't promote a snapshot"));
        }
        let origin = match &ds.origin {
            Some(origin) => origin.clone(),
            None => return Ok(()), // already promoted
        };
        let origin_snap = self.get(&origin)?;
        let pivot = (origin_snap.creation, origin_snap.seq);
        let (origin_fs, origin_short) = split_snapshot_name(&origin)
            .ok_or_else(|| AdapterError::new(&origin, "malformed origin"))?;
        let origin_fs = origin_fs.to_string();
        let origin_short = origin_short.to_string();

        // The origin snapshot and everything older migrate to the clone.
        let moved: Vec<(String, String)> = self
            .datasets
            .iter()
            .filter(|(name, ds)| {
                ds.snapshot
                    && filesystem_of(name) == origin_fs
                    && (ds.creation, ds.seq) <= pivot
            })
            .map(|(name, _)| {
                let short = split_snapshot_name(name).map(|(_, s)| s).unwrap_or_default();
                (name.clone(), format!("{dataset}@{short}"))
            })
            .collect();
        for (_, new_name) in &moved {
            if self.datasets.contains_key(new_name) {
                return Err(AdapterError::new(new_name, "snapshot already exists"));
            }
        }
        for (old_name, new_name) in &moved {
            let entry = self.datasets.remove(old_name).expect("moved snapshot exists");
            self.datasets.insert(new_name.clone(), entry);
        }

        // Any clone hanging off a migrated snapshot follows it.
        for ds in self.datasets.values_mut() {
            if let Some(current) = &ds.origin {
                if let Some((_, new_name)) = moved.iter().find(|(old, _)| old == current) {
                    ds.origin = Some(new_name.clone());
                }
            }
        }

        // Reverse the dependency direction.
        self.datasets
            .get_mut(dataset)
            .expect("promoted dataset exists")
            .origin = None;
        self.datasets
            .get_mut(&origin_fs)
            .ok_or_else(|| AdapterError::new(&origin_fs, "origin filesystem doesn't exist"))?
            .origin = Some(format!("{dataset}@{origin_short}"));
        Ok(())
    }

    fn destroy(&mut self, dataset: &str) -> Result<(), AdapterError> {
        let ds = self.get(dataset)?;
        if ds.snapshot {
            if let Some((clone, _)) = self
                .datasets
                .iter()
                .find(|(_, d)| d.origin.as_deref() == Some(dataset))
            {
                return Err(AdapterError::new(
                    dataset,
                    format!("snapshot has dependent clone '{clone}'"),
                ));
            }
        } else {
            let busy = self.datasets.keys().any(|name| {
                name != dataset && (parent_of(name) == Some(dataset) || filesystem_of(name) == dataset)
            });
            if busy {
                return Err(AdapterError::new(dataset, "dataset has children"));
            }
        }
        self.datasets.remove(dataset);
        Ok(())
    }

    fn set_property(
        &mut self,
        dataset: &str,
        name: &str,
        value: &str,
    ) -> Result<(), AdapterError> {
        if self.get(dataset)?.snapshot {
            return Err(AdapterError::new(dataset, "snapshot properties are read-only"));
        }
        let ds = self.datasets.get_mut(dataset).expect("checked above");
        match name {
            CANMOUNT_PROP => ds.canmount = Some(value.to_string()),
            MOUNTPOINT_PROP => ds.mountpoint = Some(value.to_string()),
            BOOTFS_PROP => ds.bootfs = Some(value.to_string()),
            name if name.contains(':') => {
                ds.user.insert(name.to_string(), value.to_string());
            }
            _ => return Err(AdapterError::new(dataset, format!("unsupported property '{name}'"))),
        }
        Ok(())
    }

    fn inherit_property(&mut self, dataset: &str, name: &str) -> Result<(), AdapterError> {
        if self.get(dataset)?.snapshot {
            return Err(AdapterError::new(dataset, "snapshot properties are read-only"));
        }
        let ds = self.datasets.get_mut(dataset).expect("checked above");
        match name {
            CANMOUNT_PROP => ds.canmount = None,
            MOUNTPOINT_PROP => ds.mountpoint = None,
            BOOTFS_PROP => ds.bootfs = None,
            name if name.contains(':') => {
                ds.user.remove(name);
            }
            _ => return Err(AdapterError::new(dataset, format!("unsupported property '{name}'"))),
        }
        Ok(())
    }
}
