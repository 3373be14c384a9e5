use serde::{Deserialize, Serialize};

use super::edit::{LocalEdit, PendingEdit};
use crate::filter::{Filter, SortOrder};
use crate::types::Record;

/// What wins when a pending update targets a row the snapshot no longer
/// has because a remote delete arrived first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The pending update keeps the row visible until it is confirmed or
    /// rolled back.
    #[default]
    PreferPending,
    /// The remote delete removes the row at once.
    PreferRemoteDelete,
}

/// Derives the rendered collection: pending edits in application order on
/// top of the snapshot, then the view's filter and order.
pub(crate) fn materialize(
    snapshot: &[Record],
    pending: &[PendingEdit],
    policy: ConflictPolicy,
    filter: &Filter,
    order: &SortOrder,
) -> Vec<Record> {
    let mut rows: Vec<Record> = snapshot.to_vec();
    for pending_edit in pending {
        match &pending_edit.edit {
            LocalEdit::Insert(record) => match rows.iter_mut().find(|r| r.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => rows.push(record.clone()),
            },
            LocalEdit::Delete(id) => rows.retain(|r| &r.id != id),
            LocalEdit::FieldUpdate { id, patch } => match rows.iter_mut().find(|r| &r.id == id) {
                Some(existing) => existing.apply_patch(patch),
                None => {
                    if policy == ConflictPolicy::PreferPending {
                        if let Some(base) = &pending_edit.base {
                            let mut revived = base.clone();
                            revived.apply_patch(patch);
                            rows.push(revived);
                        }
                    }
                }
            },
        }
    }
    rows.retain(|r| filter.matches(r));
    order.sort(&mut rows);
    rows
}
