//! Inverse operations recorded while a transaction is open.
//!
//! Each mutating verb pushes the exact steps that undo it. The stack
//! replays strict LIFO; replay is best-effort, a failed step is logged and
//! the drain continues so as much state as possible is recovered.

use tracing::{debug, warn};

use super::dataset::PropertySource;
use super::{Adapter, AdapterError};

#[derive(Clone, Debug)]
pub(crate) enum UndoStep {
    /// Destroy the snapshots a snapshot verb created, leaf-first.
    Snapshot { created: Vec<String> },
    /// Destroy the clones a clone verb created, leaf-first.
    Clone { created: Vec<String> },
    /// Promote the previous origin holder back; promote is an involution
    /// between a clone and the dataset its origin snapshot belongs to.
    Promote { origin_parent: String },
    /// Restore a property to its previous value and source.
    SetProperty {
        dataset: String,
        name: String,
        previous_source: PropertySource,
        previous_value: String,
    },
}

impl UndoStep {
    pub(crate) fn apply<A: Adapter>(&self, adapter: &mut A) -> Result<(), AdapterError> {
        match self {
            UndoStep::Snapshot { created } | UndoStep::Clone { created } => {
                for name in created {
                    adapter.destroy(name)?;
                }
                Ok(())
            }
            UndoStep::Promote { origin_parent } => adapter.promote(origin_parent),
            UndoStep::SetProperty {
                dataset,
                name,
                previous_source,
                previous_value,
            } => match previous_source {
                PropertySource::Local => adapter.set_property(dataset, name, previous_value),
                // Inherited and default values come back by re-inheriting;
                // a previously-absent user property is removed the same way.
                _ => adapter.inherit_property(dataset, name),
            },
        }
    }
}

/// Drain `steps` in LIFO order against the adapter, best-effort.
pub(crate) fn rollback<A: Adapter>(adapter: &mut A, steps: Vec<UndoStep>) {
    debug!(steps = steps.len(), "reverting recorded operations");
    for step in steps.into_iter().rev() {
        if let Err(err) = step.apply(adapter) {
            warn!(%err, ?step, "couldn't revert operation, continuing");
        }
    }
}
