//! The dataset-state machine: five mutating verbs validated against a fresh
//! scan, delegated to the adapter, and recorded on the revert stack.

use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use super::dataset::{
    Dataset, PropertySource, clone_target_name, filesystem_of, in_subtree, parent_of,
    split_snapshot_name,
};
use super::transaction::{UndoStep, rollback};
use super::{
    Adapter, CANMOUNT_PROP, Error, LibZfsAdapter, MOUNTPOINT_PROP, Options, rules, scanner,
    validation,
};

/// Transactional view over every ZFS pool on the system.
///
/// Every verb re-scans, validates against the fresh state, and is a no-op
/// when validation fails. With transactions enabled each verb also pushes
/// its inverse onto a LIFO stack drained by [`Zfs::cancel`] and discarded by
/// [`Zfs::done`]. One mutex serializes all verbs; the adapter is never
/// called concurrently.
pub struct Zfs<A: Adapter> {
    inner: Mutex<Inner<A>>,
}

struct Inner<A> {
    adapter: A,
    transactions: bool,
    reverts: Vec<UndoStep>,
}

impl Zfs<LibZfsAdapter> {
    /// Open the host ZFS subsystem through libzfs.
    pub fn new(options: Options) -> Result<Self, Error> {
        Ok(Zfs::with_adapter(LibZfsAdapter::new()?, options))
    }
}

impl<A: Adapter> Zfs<A> {
    /// Build an engine over any adapter implementation.
    pub fn with_adapter(adapter: A, options: Options) -> Self {
        Zfs {
            inner: Mutex::new(Inner {
                adapter,
                transactions: options.transactions,
                reverts: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<A>> {
        // A poisoned lock means an earlier verb panicked. All state is
        // rebuilt from a fresh scan on every verb, so keep going.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Scan every pool into a flat dataset list.
    pub fn scan(&self) -> Result<Vec<Dataset>, Error> {
        let inner = self.lock();
        scanner::scan(&inner.adapter)
    }

    /// Create `dataset@snap_name`, and the same snapshot on every descendant
    /// when `recursive`.
    pub fn snapshot(&self, snap_name: &str, dataset: &str, recursive: bool) -> Result<(), Error> {
        let mut inner = self.lock();
        debug!(snap_name, dataset, recursive, "requesting snapshot");

        validation::validate_component(snap_name, "snapshot name")?;
        let scan = scanner::scan(&inner.adapter)?;
        let target = find(&scan, dataset).ok_or_else(|| Error::not_found(dataset))?;
        if target.is_snapshot {
            return Err(Error::invalid(dataset, "can't snapshot a snapshot"));
        }

        let subtree: Vec<String> = if recursive {
            filesystems_under(&scan, dataset)
                .iter()
                .map(|d| d.name.clone())
                .collect()
        } else {
            vec![dataset.to_string()]
        };
        for fs in &subtree {
            let full = format!("{fs}@{snap_name}");
            if contains(&scan, &full) {
                return Err(Error::already_exists(&full));
            }
        }

        inner.adapter.create_snapshot(dataset, snap_name, recursive)?;

        let mut created: Vec<String> = subtree
            .iter()
            .map(|fs| format!("{fs}@{snap_name}"))
            .collect();
        created.sort();
        created.reverse(); // leaf-first destroy order
        inner.record(UndoStep::Snapshot { created });
        Ok(())
    }

    /// Clone `snapshot` (and, when `recursive`, the same snapshot on every
    /// descendant) into a sibling hierarchy named with `suffix`.
    ///
    /// Auto-mounting never propagates: `canmount=on` becomes `noauto` on the
    /// clone. Local mountpoints are carried literally, inherited ones are
    /// left to inheritance. With `skip_bootfs`, source datasets marked
    /// `bootfs=yes` are pruned together with their branches.
    pub fn clone(
        &self,
        snapshot: &str,
        suffix: &str,
        skip_bootfs: bool,
        recursive: bool,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        debug!(snapshot, suffix, skip_bootfs, recursive, "requesting clone");

        let (origin_fs, snap_name) = split_snapshot_name(snapshot)
            .ok_or_else(|| Error::invalid(snapshot, "not a snapshot"))?;
        if suffix.is_empty() {
            return Err(Error::invalid(snapshot, "no suffix provided"));
        }
        validation::validate_component(suffix, "suffix")?;

        let scan = scanner::scan(&inner.adapter)?;
        if !contains(&scan, snapshot) {
            return Err(Error::not_found(snapshot));
        }
        if parent_of(origin_fs).is_none() {
            return Err(Error::invalid(
                snapshot,
                "can't clone a snapshot of a pool root dataset",
            ));
        }
        let target_root = clone_target_name(origin_fs, suffix);

        let sources: Vec<&Dataset> = if recursive {
            filesystems_under(&scan, origin_fs)
        } else {
            vec![find(&scan, origin_fs).ok_or_else(|| Error::not_found(origin_fs))?]
        };

        // Validate the whole plan before touching anything.
        let mut plan: Vec<(String, String, Vec<(String, String)>)> = Vec::new();
        let mut pruned: Vec<String> = Vec::new();
        for source in sources {
            if pruned.iter().any(|p| in_subtree(p, &source.name)) {
                continue;
            }
            if skip_bootfs && source.bootfs == "yes" {
                debug!(dataset = %source.name, "skipping bootfs branch");
                pruned.push(source.name.clone());
                continue;
            }
            let source_snap = format!("{}@{snap_name}", source.name);
            if !contains(&scan, &source_snap) {
                if has_child_filesystems(&scan, &source.name) {
                    return Err(Error::MissingIntermediate {
                        snapshot: source_snap,
                    });
                }
                // Missing leaf snapshots are tolerated.
                continue;
            }
            let target = format!("{target_root}{}", &source.name[origin_fs.len()..]);
            if contains(&scan, &target) {
                return Err(Error::already_exists(&target));
            }

            let mut overrides: Vec<(String, String)> = Vec::new();
            let canmount = match source.canmount.as_str() {
                "on" => "noauto",
                other => other,
            };
            overrides.push((CANMOUNT_PROP.to_string(), canmount.to_string()));
            if source.sources.mountpoint.is_local() {
                overrides.push((MOUNTPOINT_PROP.to_string(), source.mountpoint.clone()));
            }
            plan.push((source_snap, target, overrides));
        }

        // Root-first creation so every clone's parent dataset exists.
        let mut created: Vec<String> = Vec::new();
        let mut result = Ok(());
        for (source_snap, target, overrides) in &plan {
            if let Err(err) = inner.adapter.clone_snapshot(source_snap, target, overrides) {
                result = Err(err.into());
                break;
            }
            created.push(target.clone());
        }
        created.sort();
        created.reverse();
        let undo = if created.is_empty() {
            Vec::new()
        } else {
            vec![UndoStep::Clone { created }]
        };
        inner.finish(undo, result)
    }

    /// Make `dataset` the primary of its lineage, then every descendant that
    /// is still a clone of something outside the subtree. Promoting an
    /// already-promoted dataset is a no-op.
    ///
    /// Promotion over a subtree is not atomic at the adapter level: when a
    /// step fails, earlier promotions stay applied. Each completed step is
    /// recorded, so [`Zfs::cancel`] unwinds whatever succeeded.
    pub fn promote(&self, dataset: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        debug!(dataset, "requesting promotion");

        let scan = scanner::scan(&inner.adapter)?;
        let target = find(&scan, dataset).ok_or_else(|| Error::not_found(dataset))?;
        if target.is_snapshot {
            return Err(Error::invalid(dataset, "can't promote a snapshot"));
        }
        if target.origin.is_empty() {
            debug!(dataset, "already promoted");
            return Ok(());
        }
        let (origin_fs, origin_snap) = split_snapshot_name(&target.origin)
            .ok_or_else(|| Error::invalid(&target.origin, "malformed origin"))?;
        check_snapshot_hierarchy(&scan, origin_fs, origin_snap, true)?;

        let inner = &mut *inner;
        let mut undo: Vec<UndoStep> = Vec::new();
        let result = promote_subtree(&mut inner.adapter, dataset, &mut undo);
        inner.finish(undo, result)
    }

    /// Destroy `dataset` recursively, leaf-first: a filesystem goes together
    /// with its children and all their snapshots; a snapshot goes together
    /// with the same-named snapshot on every descendant.
    ///
    /// Not transactional: rejected outright when the engine records
    /// transactions.
    pub fn destroy(&self, dataset: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        debug!(dataset, "requesting destruction");

        if inner.transactions {
            return Err(Error::TransactionViolation);
        }
        let scan = scanner::scan(&inner.adapter)?;
        if !contains(&scan, dataset) {
            return Err(Error::not_found(dataset));
        }

        // Everything that goes away, in destroy order.
        let doomed: Vec<String> = match split_snapshot_name(dataset) {
            Some((fs, snap)) => {
                let mut names: Vec<String> = filesystems_under(&scan, fs)
                    .iter()
                    .map(|d| format!("{}@{snap}", d.name))
                    .filter(|name| contains(&scan, name))
                    .collect();
                names.sort();
                names.reverse();
                names
            }
            None => {
                let mut names = Vec::new();
                for fs in filesystems_under(&scan, dataset).iter().rev() {
                    for d in &scan {
                        if d.is_snapshot && filesystem_of(&d.name) == fs.name {
                            names.push(d.name.clone());
                        }
                    }
                    names.push(fs.name.clone());
                }
                names
            }
        };

        // Nothing may still hang off a doomed snapshot.
        for d in &scan {
            if !d.origin.is_empty() && doomed.contains(&d.origin) {
                return Err(Error::HasClones {
                    name: dataset.to_string(),
                    clone: d.name.clone(),
                });
            }
        }

        for name in &doomed {
            inner.adapter.destroy(name)?;
        }
        Ok(())
    }

    /// Change one property on a live dataset.
    ///
    /// Only the authorized natives and `namespace:name` user properties are
    /// accepted. An inherited value requires `force`; the property then
    /// becomes local on `dataset` only. The empty value clears: the property
    /// is inherited again, or removed for user properties.
    pub fn set_property(
        &self,
        name: &str,
        value: &str,
        dataset: &str,
        force: bool,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        debug!(property = name, value, dataset, force, "requesting property change");

        rules::ensure_settable(name, dataset)?;
        let scan = scanner::scan(&inner.adapter)?;
        let target = find(&scan, dataset).ok_or_else(|| Error::not_found(dataset))?;
        if target.is_snapshot {
            return Err(Error::property_policy(
                name,
                dataset,
                "can't change properties on a snapshot",
            ));
        }
        rules::ensure_legal_value(name, value, dataset)?;

        let props = inner.adapter.properties(dataset)?;
        let previous = props.get(name).cloned().unwrap_or_default();
        let previous_source = PropertySource::parse(&previous.source);
        rules::ensure_overridable(name, dataset, &previous_source, force)?;

        if rules::clears(value) {
            inner.adapter.inherit_property(dataset, name)?;
        } else {
            inner.adapter.set_property(dataset, name, value)?;
        }
        inner.record(UndoStep::SetProperty {
            dataset: dataset.to_string(),
            name: name.to_string(),
            previous_source,
            previous_value: previous.value,
        });
        Ok(())
    }

    /// Commit: keep everything done so far and forget the revert stack.
    pub fn done(&self) {
        let mut inner = self.lock();
        debug!(steps = inner.reverts.len(), "transaction committed");
        inner.reverts.clear();
    }

    /// Roll back: replay the revert stack in LIFO order, best-effort.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        let steps = std::mem::take(&mut inner.reverts);
        debug!(steps = steps.len(), "transaction cancelled");
        rollback(&mut inner.adapter, steps);
    }
}

impl<A: Adapter> Drop for Zfs<A> {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !inner.reverts.is_empty() {
            warn!(
                steps = inner.reverts.len(),
                "transaction dropped without done() or cancel(); partial state remains"
            );
        }
    }
}

impl<A: Adapter> Inner<A> {
    fn record(&mut self, step: UndoStep) {
        if self.transactions {
            self.reverts.push(step);
        }
    }

    // Success: recorded steps go to the transaction stack (when one is
    // open). Failure: completed steps are replayed immediately outside a
    // transaction, or kept on the stack so cancel() can still recover them.
    fn finish(&mut self, undo: Vec<UndoStep>, result: Result<(), Error>) -> Result<(), Error> {
        if self.transactions {
            self.reverts.extend(undo);
        } else if result.is_err() {
            rollback(&mut self.adapter, undo);
        }
        result
    }
}

fn promote_subtree<A: Adapter>(
    adapter: &mut A,
    root: &str,
    undo: &mut Vec<UndoStep>,
) -> Result<(), Error> {
    loop {
        let scan = scanner::scan(adapter)?;
        // Next member of the subtree still cloned from outside it; the root
        // sorts first, already-promoted members simply drop out.
        let next = scan
            .iter()
            .filter(|d| !d.is_snapshot && in_subtree(root, &d.name) && !d.origin.is_empty())
            .filter(|d| !in_subtree(root, filesystem_of(&d.origin)))
            .min_by(|a, b| a.name.cmp(&b.name));
        let Some(clone) = next else {
            return Ok(());
        };
        let origin_parent = filesystem_of(&clone.origin).to_string();
        debug!(dataset = %clone.name, origin = %clone.origin, "promoting");
        adapter.promote(&clone.name)?;
        undo.push(UndoStep::Promote { origin_parent });
    }
}

// An interior dataset missing the snapshot its parent carries breaks the
// lineage promote needs to move; leaves without it are fine.
fn check_snapshot_hierarchy(
    scan: &[Dataset],
    fs: &str,
    snap: &str,
    parent_has: bool,
) -> Result<(), Error> {
    let full = format!("{fs}@{snap}");
    let has = contains(scan, &full);
    let children = direct_child_filesystems(scan, fs);
    if parent_has && !has && !children.is_empty() {
        return Err(Error::MissingIntermediate { snapshot: full });
    }
    for child in children {
        check_snapshot_hierarchy(scan, &child.name, snap, has)?;
    }
    Ok(())
}

fn find<'a>(scan: &'a [Dataset], name: &str) -> Option<&'a Dataset> {
    scan.iter().find(|d| d.name == name)
}

fn contains(scan: &[Dataset], name: &str) -> bool {
    find(scan, name).is_some()
}

/// Filesystems of the subtree rooted at `root`, root included, name order.
fn filesystems_under<'a>(scan: &'a [Dataset], root: &str) -> Vec<&'a Dataset> {
    let mut out: Vec<&Dataset> = scan
        .iter()
        .filter(|d| !d.is_snapshot && in_subtree(root, &d.name))
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn direct_child_filesystems<'a>(scan: &'a [Dataset], parent: &str) -> Vec<&'a Dataset> {
    scan.iter()
        .filter(|d| !d.is_snapshot && parent_of(&d.name) == Some(parent))
        .collect()
}

fn has_child_filesystems(scan: &[Dataset], name: &str) -> bool {
    scan.iter()
        .any(|d| !d.is_snapshot && parent_of(&d.name) == Some(name))
}
