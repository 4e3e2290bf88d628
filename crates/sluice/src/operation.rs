//! Schema operations and changesets.
//!
//! An [`Operation`] is one atomic schema edit. A [`Changeset`] is an ordered
//! list of them, as produced by the [`Detector`](crate::Detector) or written by
//! hand, plus any diagnostics the diff raised along the way.

use std::fmt;

use sluice_schema::{Column, ForeignKey, Table, TableId};

use crate::dialect::Dialect;

/// A single schema edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateTable {
        table: Table,
    },
    DropTable {
        schema: String,
        name: String,
    },
    RenameTable {
        schema: String,
        from: String,
        to: String,
    },
    AddColumn {
        schema: String,
        table: String,
        column: String,
        def: Column,
    },
    DropColumn {
        schema: String,
        table: String,
        column: String,
    },
    /// Change type, nullability or default of an existing column.
    AlterColumn {
        schema: String,
        table: String,
        column: String,
        from: Column,
        to: Column,
    },
    AddForeignKey {
        fk: ForeignKey,
        constraint_name: String,
    },
    /// Drop a foreign key constraint from `fk.from`'s table.
    DropForeignKey {
        fk: ForeignKey,
        constraint_name: String,
    },
}

impl Operation {
    /// Emission phase. Changesets are ordered by phase so that every
    /// operation only depends on operations before it: constraints are
    /// dropped first, renames settle names, creations and column changes
    /// follow, and new constraints come last.
    pub fn phase(&self) -> u8 {
        match self {
            Operation::DropForeignKey { .. } => 0,
            Operation::RenameTable { .. } => 1,
            Operation::CreateTable { .. } => 2,
            Operation::AddColumn { .. } => 3,
            Operation::AlterColumn { .. } => 4,
            Operation::DropColumn { .. } => 5,
            Operation::DropTable { .. } => 6,
            Operation::AddForeignKey { .. } => 7,
        }
    }

    /// The table this operation is applied to.
    pub fn table_id(&self) -> TableId {
        match self {
            Operation::CreateTable { table } => table.id(),
            Operation::DropTable { schema, name } => TableId::new(schema, name),
            Operation::RenameTable { schema, from, .. } => TableId::new(schema, from),
            Operation::AddColumn { schema, table, .. }
            | Operation::DropColumn { schema, table, .. }
            | Operation::AlterColumn { schema, table, .. } => TableId::new(schema, table),
            Operation::AddForeignKey { fk, .. } | Operation::DropForeignKey { fk, .. } => {
                fk.from.table_id()
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable { table } => {
                write!(f, "create table {}.{}", table.schema, table.name)
            }
            Operation::DropTable { schema, name } => write!(f, "drop table {schema}.{name}"),
            Operation::RenameTable { schema, from, to } => {
                write!(f, "rename table {schema}.{from} to {to}")
            }
            Operation::AddColumn {
                schema,
                table,
                column,
                def,
            } => write!(f, "add column {schema}.{table}.{column} {}", def.sql_type),
            Operation::DropColumn {
                schema,
                table,
                column,
            } => write!(f, "drop column {schema}.{table}.{column}"),
            Operation::AlterColumn {
                schema,
                table,
                column,
                from,
                to,
            } => {
                write!(f, "alter column {schema}.{table}.{column}:")?;
                if from.sql_type != to.sql_type {
                    write!(f, " type {} -> {}", from.sql_type, to.sql_type)?;
                }
                if from.is_nullable != to.is_nullable {
                    let label = |nullable| if nullable { "null" } else { "not null" };
                    write!(
                        f,
                        " {} -> {}",
                        label(from.is_nullable),
                        label(to.is_nullable)
                    )?;
                }
                if from.default_value != to.default_value {
                    let label = |d: &str| if d.is_empty() { "(none)".to_string() } else { d.to_string() };
                    write!(
                        f,
                        " default {} -> {}",
                        label(&from.default_value),
                        label(&to.default_value)
                    )?;
                }
                Ok(())
            }
            Operation::AddForeignKey {
                fk,
                constraint_name,
            } => write!(f, "add foreign key {constraint_name} {fk}"),
            Operation::DropForeignKey {
                fk,
                constraint_name,
            } => write!(
                f,
                "drop foreign key {}.{}.{constraint_name}",
                fk.from.schema, fk.from.table
            ),
        }
    }
}

/// Something the diff noticed but did not turn into an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// More than one created table matched a dropped table's columns.
    /// The first candidate (by identity) was picked.
    AmbiguousRename {
        from: TableId,
        candidates: Vec<TableId>,
    },
    /// More than one dropped table matched a created table's columns. The
    /// first (by identity) was renamed and the others are dropped.
    AmbiguousRenameSource {
        to: TableId,
        candidates: Vec<TableId>,
    },
    /// A column change that has no safe operation (primary key, identity,
    /// auto-increment or uniqueness flipped). Left for a hand-written migration.
    SkippedAlteration {
        table: TableId,
        column: String,
        reason: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::AmbiguousRename { from, candidates } => {
                let names: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "ambiguous rename of {from}: candidates {}",
                    names.join(", ")
                )
            }
            Diagnostic::AmbiguousRenameSource { to, candidates } => {
                let names: Vec<String> = candidates.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "ambiguous rename to {to}: candidates {}",
                    names.join(", ")
                )
            }
            Diagnostic::SkippedAlteration {
                table,
                column,
                reason,
            } => write!(f, "skipped alteration of {table}.{column}: {reason}"),
        }
    }
}

/// An ordered list of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub operations: Vec<Operation>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation. Order is preserved exactly as pushed.
    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    /// Builder-style [`Changeset::push`].
    pub fn with(mut self, op: Operation) -> Self {
        self.push(op);
        self
    }

    /// True when there is nothing to apply. Diagnostics do not count.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.operations.iter()
    }

    /// Sort into emission order: by phase, then by display string.
    /// Diagnostics are sorted by display string.
    pub(crate) fn sort(&mut self) {
        self.operations
            .sort_by_cached_key(|op| (op.phase(), op.to_string()));
        self.diagnostics.sort_by_cached_key(ToString::to_string);
    }

    /// Render every operation to SQL, each preceded by a comment line.
    pub fn to_sql(&self, dialect: &dyn Dialect) -> String {
        let mut sql = String::new();
        for op in &self.operations {
            sql.push_str(&format!("-- {op}\n"));
            for stmt in dialect.render(op) {
                sql.push_str(&stmt);
                sql.push('\n');
            }
            sql.push('\n');
        }
        sql
    }
}

impl<'a> IntoIterator for &'a Changeset {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

impl FromIterator<Operation> for Changeset {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
            diagnostics: Vec::new(),
        }
    }
}

impl fmt::Display for Changeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.operations {
            writeln!(f, "{op}")?;
        }
        for diag in &self.diagnostics {
            writeln!(f, "! {diag}")?;
        }
        Ok(())
    }
}
