//! Changeset solver: simulates operations against an in-memory schema.
//!
//! Before anything touches the database, a changeset is replayed on a
//! [`VirtualSchema`] seeded from the current state. Every operation has to
//! find the tables and columns it expects, and nothing may be dropped while a
//! foreign key still points at it.
//!
//! ## Example Problem
//!
//! ```text
//! -- This fails:
//! DROP TABLE "public"."user";          -- "post"."author_id" still references it
//! ALTER TABLE "public"."post" DROP CONSTRAINT "post_author_id_fkey";
//!
//! -- This works:
//! ALTER TABLE "public"."post" DROP CONSTRAINT "post_author_id_fkey";
//! DROP TABLE "public"."user";
//! ```

use sluice_schema::{ForeignKey, ForeignKeyRef, State, TableId};

use crate::operation::{Changeset, Operation};

/// Error when a changeset cannot be applied to a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    /// An operation requires a table that doesn't exist.
    TableNotFound { operation: String, table: TableId },
    /// An operation requires a table to NOT exist, but it does.
    TableAlreadyExists { operation: String, table: TableId },
    /// An operation requires a column that doesn't exist.
    ColumnNotFound {
        operation: String,
        table: TableId,
        column: String,
    },
    /// An operation requires a column to NOT exist, but it does.
    ColumnAlreadyExists {
        operation: String,
        table: TableId,
        column: String,
    },
    /// A table or column is dropped while a foreign key still uses it.
    StillReferenced {
        operation: String,
        foreign_key: ForeignKey,
    },
    /// A dropped foreign key is not present.
    ForeignKeyNotFound {
        operation: String,
        foreign_key: ForeignKey,
    },
    /// An added foreign key is already present.
    ForeignKeyAlreadyExists {
        operation: String,
        foreign_key: ForeignKey,
    },
}

impl std::fmt::Display for SolverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolverError::TableNotFound { operation, table } => {
                write!(f, "{}: table '{}' does not exist", operation, table)
            }
            SolverError::TableAlreadyExists { operation, table } => {
                write!(f, "{}: table '{}' already exists", operation, table)
            }
            SolverError::ColumnNotFound {
                operation,
                table,
                column,
            } => write!(
                f,
                "{}: column '{}.{}' does not exist",
                operation, table, column
            ),
            SolverError::ColumnAlreadyExists {
                operation,
                table,
                column,
            } => write!(
                f,
                "{}: column '{}.{}' already exists",
                operation, table, column
            ),
            SolverError::StillReferenced {
                operation,
                foreign_key,
            } => write!(
                f,
                "{}: still referenced by foreign key {}",
                operation, foreign_key
            ),
            SolverError::ForeignKeyNotFound {
                operation,
                foreign_key,
            } => write!(
                f,
                "{}: foreign key {} does not exist",
                operation, foreign_key
            ),
            SolverError::ForeignKeyAlreadyExists {
                operation,
                foreign_key,
            } => write!(
                f,
                "{}: foreign key {} already exists",
                operation, foreign_key
            ),
        }
    }
}

impl std::error::Error for SolverError {}

/// Virtual schema state for simulating changesets.
#[derive(Debug, Clone, Default)]
pub struct VirtualSchema {
    state: State,
}

impl VirtualSchema {
    pub fn new(state: State) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }

    pub fn table_exists(&self, id: &TableId) -> bool {
        self.state.contains_table(id)
    }

    pub fn column_exists(&self, id: &TableId, column: &str) -> bool {
        self.state
            .table(id)
            .is_some_and(|t| t.columns.contains_key(column))
    }

    fn require_table(&self, operation: &str, id: &TableId) -> Result<(), SolverError> {
        if self.table_exists(id) {
            Ok(())
        } else {
            Err(SolverError::TableNotFound {
                operation: operation.to_string(),
                table: id.clone(),
            })
        }
    }

    fn require_column(&self, operation: &str, id: &TableId, column: &str) -> Result<(), SolverError> {
        self.require_table(operation, id)?;
        if self.column_exists(id, column) {
            Ok(())
        } else {
            Err(SolverError::ColumnNotFound {
                operation: operation.to_string(),
                table: id.clone(),
                column: column.to_string(),
            })
        }
    }

    fn require_columns(&self, operation: &str, side: &ForeignKeyRef) -> Result<(), SolverError> {
        let id = side.table_id();
        self.require_table(operation, &id)?;
        for column in &side.columns {
            self.require_column(operation, &id, column)?;
        }
        Ok(())
    }

    /// First foreign key matching `pred`, if any.
    fn referenced_by(&self, pred: impl Fn(&ForeignKey) -> bool) -> Option<&ForeignKey> {
        self.state.foreign_keys.keys().find(|fk| pred(fk))
    }

    /// Apply one operation, validating its preconditions first. On error the
    /// schema is left untouched.
    pub fn apply(&mut self, op: &Operation) -> Result<(), SolverError> {
        let desc = op.to_string();

        match op {
            Operation::CreateTable { table } => {
                let id = table.id();
                if self.table_exists(&id) {
                    return Err(SolverError::TableAlreadyExists {
                        operation: desc,
                        table: id,
                    });
                }
                self.state.add_table(table.clone());
            }

            Operation::DropTable { schema, name } => {
                let id = TableId::new(schema, name);
                self.require_table(&desc, &id)?;
                // A table's own outgoing keys go with it; incoming ones block the drop.
                if let Some(fk) =
                    self.referenced_by(|fk| fk.to.table_id() == id && fk.from.table_id() != id)
                {
                    return Err(SolverError::StillReferenced {
                        operation: desc,
                        foreign_key: fk.clone(),
                    });
                }
                self.state.tables.remove(&id);
                self.state.foreign_keys.retain(|fk, _| !fk.touches(&id));
            }

            Operation::RenameTable { schema, from, to } => {
                let from_id = TableId::new(schema, from);
                let to_id = TableId::new(schema, to);
                self.require_table(&desc, &from_id)?;
                if self.table_exists(&to_id) {
                    return Err(SolverError::TableAlreadyExists {
                        operation: desc,
                        table: to_id,
                    });
                }
                if let Some(mut table) = self.state.tables.remove(&from_id) {
                    table.name = to.clone();
                    self.state.add_table(table);
                }

                let rename = |side: &ForeignKeyRef| {
                    if side.table_id() == from_id {
                        ForeignKeyRef::new(&side.schema, to, side.columns.iter().cloned())
                    } else {
                        side.clone()
                    }
                };
                let fks = std::mem::take(&mut self.state.foreign_keys);
                self.state.foreign_keys = fks
                    .into_iter()
                    .map(|(fk, name)| (ForeignKey::new(rename(&fk.from), rename(&fk.to)), name))
                    .collect();
            }

            Operation::AddColumn {
                schema,
                table,
                column,
                def,
            } => {
                let id = TableId::new(schema, table);
                self.require_table(&desc, &id)?;
                if self.column_exists(&id, column) {
                    return Err(SolverError::ColumnAlreadyExists {
                        operation: desc,
                        table: id,
                        column: column.clone(),
                    });
                }
                if let Some(t) = self.state.tables.get_mut(&id) {
                    t.columns.insert(column.clone(), def.clone());
                }
            }

            Operation::DropColumn {
                schema,
                table,
                column,
            } => {
                let id = TableId::new(schema, table);
                self.require_column(&desc, &id, column)?;
                let uses = |side: &ForeignKeyRef| side.table_id() == id && side.columns.contains(column);
                if let Some(fk) = self.referenced_by(|fk| uses(&fk.from) || uses(&fk.to)) {
                    return Err(SolverError::StillReferenced {
                        operation: desc,
                        foreign_key: fk.clone(),
                    });
                }
                if let Some(t) = self.state.tables.get_mut(&id) {
                    t.columns.shift_remove(column);
                }
            }

            Operation::AlterColumn {
                schema,
                table,
                column,
                to,
                ..
            } => {
                let id = TableId::new(schema, table);
                self.require_column(&desc, &id, column)?;
                if let Some(t) = self.state.tables.get_mut(&id) {
                    t.columns.insert(column.clone(), to.clone());
                }
            }

            Operation::AddForeignKey {
                fk,
                constraint_name,
            } => {
                self.require_columns(&desc, &fk.from)?;
                self.require_columns(&desc, &fk.to)?;
                if self.state.foreign_keys.contains_key(fk) {
                    return Err(SolverError::ForeignKeyAlreadyExists {
                        operation: desc,
                        foreign_key: fk.clone(),
                    });
                }
                self.state.add_foreign_key(fk.clone(), constraint_name.clone());
            }

            Operation::DropForeignKey { fk, .. } => {
                if self.state.foreign_keys.remove(fk).is_none() {
                    return Err(SolverError::ForeignKeyNotFound {
                        operation: desc,
                        foreign_key: fk.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Check whether an operation can be applied without applying it.
    pub fn can_apply(&self, op: &Operation) -> bool {
        self.clone().apply(op).is_ok()
    }
}

impl Changeset {
    /// Replay this changeset on a copy of `state`.
    ///
    /// Returns the state the database would be in after applying every
    /// operation, or the first operation that could not be applied.
    pub fn simulate(&self, state: &State) -> Result<State, SolverError> {
        let mut schema = VirtualSchema::new(state.clone());
        for op in &self.operations {
            schema.apply(op)?;
        }
        Ok(schema.into_state())
    }
}
