//! Schema diffing: compute the operations that turn one [`State`] into another.
//!
//! ## Rename detection
//!
//! A table present only in the current state and a table present only in the
//! target state are treated as a rename when both live in the same schema and
//! have exactly the same `(column, type)` pairs. Dropped tables are visited in
//! identity order and take the first unclaimed match. When several created
//! tables would match, a [`Diagnostic::AmbiguousRename`] is recorded; when
//! several dropped tables match one created table and the losers end up
//! dropped, a [`Diagnostic::AmbiguousRenameSource`] is recorded.
//!
//! ```text
//! // Instead of:
//!   drop table public.users
//!   create table public.user
//!
//! // You'll see:
//!   rename table public.users to user
//! ```
//!
//! ## Ordering
//!
//! Operations are sorted by [`Operation::phase`] and then by their display
//! string, so the same pair of states always yields the same changeset.

use std::collections::{BTreeMap, BTreeSet};

use sluice_schema::{ForeignKey, ForeignKeyRef, State, Table, TableId};

use crate::operation::{Changeset, Diagnostic, Operation};

/// Computes [`Changeset`]s between schema states.
#[derive(Debug, Clone, Copy, Default)]
pub struct Detector;

/// Shorthand for `Detector::new().diff(current, target)`.
pub fn diff(current: &State, target: &State) -> Changeset {
    Detector::new().diff(current, target)
}

impl Detector {
    pub fn new() -> Self {
        Self
    }

    /// Returns the changes needed to transform `current` into `target`.
    ///
    /// # Example
    ///
    /// ```
    /// use sluice::{Column, Detector, State, Table};
    ///
    /// let current = State::new();
    /// let target = State::new()
    ///     .with_table(Table::new("public", "user").column("id", Column::new("bigserial").primary_key()));
    ///
    /// let changes = Detector::new().diff(&current, &target);
    /// assert_eq!(changes.to_string(), "create table public.user\n");
    /// ```
    pub fn diff(&self, current: &State, target: &State) -> Changeset {
        let mut changes = Changeset::new();

        let dropped: Vec<&Table> = current
            .tables
            .values()
            .filter(|t| !target.contains_table(&t.id()))
            .collect();
        let created: Vec<&Table> = target
            .tables
            .values()
            .filter(|t| !current.contains_table(&t.id()))
            .collect();

        let renames = detect_renames(&dropped, &created, &mut changes.diagnostics);
        let renamed_to: BTreeSet<&TableId> = renames.values().collect();

        for (from, to) in &renames {
            changes.push(Operation::RenameTable {
                schema: from.schema.clone(),
                from: from.name.clone(),
                to: to.name.clone(),
            });
            if let (Some(old), Some(new)) = (current.table(from), target.table(to)) {
                diff_columns(old, new, &mut changes);
            }
        }

        for table in created {
            if !renamed_to.contains(&table.id()) {
                changes.push(Operation::CreateTable {
                    table: table.clone(),
                });
            }
        }

        for table in dropped {
            if !renames.contains_key(&table.id()) {
                changes.push(Operation::DropTable {
                    schema: table.schema.clone(),
                    name: table.name.clone(),
                });
            }
        }

        for (id, old) in &current.tables {
            if let Some(new) = target.table(id) {
                diff_columns(old, new, &mut changes);
            }
        }

        diff_foreign_keys(current, target, &renames, &mut changes);

        changes.sort();
        changes
    }
}

/// Pair up dropped and created tables with identical column signatures.
fn detect_renames(
    dropped: &[&Table],
    created: &[&Table],
    diagnostics: &mut Vec<Diagnostic>,
) -> BTreeMap<TableId, TableId> {
    let mut renames = BTreeMap::new();
    let mut used_created: BTreeSet<TableId> = BTreeSet::new();

    for old in dropped {
        let signature = old.signature();
        let candidates: Vec<&Table> = created
            .iter()
            .copied()
            .filter(|new| new.schema == old.schema)
            .filter(|new| !used_created.contains(&new.id()))
            .filter(|new| new.signature() == signature)
            .collect();

        let Some(first) = candidates.first() else {
            continue;
        };

        if candidates.len() > 1 {
            let candidates: Vec<TableId> = candidates.iter().map(|t| t.id()).collect();
            tracing::warn!(
                table = %old.id(),
                candidates = candidates.len(),
                "ambiguous table rename, picking {}",
                first.id()
            );
            diagnostics.push(Diagnostic::AmbiguousRename {
                from: old.id(),
                candidates,
            });
        }

        used_created.insert(first.id());
        renames.insert(old.id(), first.id());
    }

    for (from, to) in &renames {
        let Some(new) = created.iter().find(|t| t.id() == *to) else {
            continue;
        };
        let signature = new.signature();
        let losers: Vec<TableId> = dropped
            .iter()
            .filter(|old| old.schema == new.schema && old.id() != *from)
            .filter(|old| !renames.contains_key(&old.id()))
            .filter(|old| old.signature() == signature)
            .map(|old| old.id())
            .collect();
        if losers.is_empty() {
            continue;
        }

        tracing::warn!(
            table = %to,
            candidates = losers.len() + 1,
            "ambiguous table rename, renaming {from}"
        );
        let mut candidates = vec![from.clone()];
        candidates.extend(losers);
        candidates.sort();
        diagnostics.push(Diagnostic::AmbiguousRenameSource {
            to: to.clone(),
            candidates,
        });
    }

    renames
}

/// Column-level changes between two versions of the same table. Operations
/// are addressed to `new`'s name, which is already in effect when they run.
fn diff_columns(old: &Table, new: &Table, changes: &mut Changeset) {
    for (name, col) in &new.columns {
        if !old.columns.contains_key(name) {
            changes.push(Operation::AddColumn {
                schema: new.schema.clone(),
                table: new.name.clone(),
                column: name.clone(),
                def: col.clone(),
            });
        }
    }

    for name in old.columns.keys() {
        if !new.columns.contains_key(name) {
            changes.push(Operation::DropColumn {
                schema: new.schema.clone(),
                table: new.name.clone(),
                column: name.clone(),
            });
        }
    }

    for (name, from) in &old.columns {
        let Some(to) = new.columns.get(name) else {
            continue;
        };
        if from == to {
            continue;
        }

        let mut unsupported = Vec::new();
        if from.is_pk != to.is_pk {
            unsupported.push("primary key");
        }
        if from.is_identity != to.is_identity {
            unsupported.push("identity");
        }
        if from.is_auto_increment != to.is_auto_increment {
            unsupported.push("auto-increment");
        }
        if from.is_unique != to.is_unique {
            unsupported.push("unique");
        }

        if !unsupported.is_empty() {
            let reason = format!("{} changed", unsupported.join(", "));
            tracing::warn!(table = %new.id(), column = %name, %reason, "skipping column alteration");
            changes.diagnostics.push(Diagnostic::SkippedAlteration {
                table: new.id(),
                column: name.clone(),
                reason,
            });
            continue;
        }

        changes.push(Operation::AlterColumn {
            schema: new.schema.clone(),
            table: new.name.clone(),
            column: name.clone(),
            from: from.clone(),
            to: to.clone(),
        });
    }
}

/// Foreign keys are compared after mapping current table names through the
/// detected renames, so a relation that only followed a rename is unchanged.
fn diff_foreign_keys(
    current: &State,
    target: &State,
    renames: &BTreeMap<TableId, TableId>,
    changes: &mut Changeset,
) {
    let follow = |side: &ForeignKeyRef| -> ForeignKeyRef {
        match renames.get(&side.table_id()) {
            Some(to) => ForeignKeyRef::new(&side.schema, &to.name, side.columns.iter().cloned()),
            None => side.clone(),
        }
    };

    let mapped: BTreeMap<ForeignKey, (&ForeignKey, &String)> = current
        .foreign_keys
        .iter()
        .map(|(fk, name)| (ForeignKey::new(follow(&fk.from), follow(&fk.to)), (fk, name)))
        .collect();

    for (fk, name) in &target.foreign_keys {
        if !mapped.contains_key(fk) {
            changes.push(Operation::AddForeignKey {
                fk: fk.clone(),
                constraint_name: constraint_name(fk, name),
            });
        }
    }

    for (key, (fk, name)) in &mapped {
        if !target.foreign_keys.contains_key(key) {
            changes.push(Operation::DropForeignKey {
                fk: (*fk).clone(),
                constraint_name: constraint_name(fk, name),
            });
        }
    }
}

fn constraint_name(fk: &ForeignKey, known: &str) -> String {
    if known.is_empty() {
        fk.default_constraint_name()
    } else {
        known.to_string()
    }
}
