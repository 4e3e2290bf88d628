//! Schema snapshot types for sluice.
//!
//! This crate contains the value types shared between the live-database
//! inspector and whatever produces the desired schema: a [`State`] is a full
//! snapshot of tables, columns and foreign keys at one point in time.
//!
//! States are plain values. Nothing in sluice mutates a `State` after handing
//! it out; the diff and solver work on borrowed or cloned snapshots.
//!
//! ## Declaring a desired schema
//!
//! ```
//! use sluice_schema::{Column, ForeignKey, ForeignKeyRef, State, Table};
//!
//! let state = State::new()
//!     .with_table(
//!         Table::new("public", "owner").column("id", Column::new("bigint").primary_key()),
//!     )
//!     .with_table(
//!         Table::new("public", "thing")
//!             .column("id", Column::new("bigint").primary_key())
//!             .column("owner_id", Column::new("bigint").not_null()),
//!     )
//!     .with_foreign_key(ForeignKey::new(
//!         ForeignKeyRef::new("public", "thing", ["owner_id"]),
//!         ForeignKeyRef::new("public", "owner", ["id"]),
//!     ));
//!
//! assert_eq!(state.tables.len(), 2);
//! ```

use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::fmt;

mod sqltype;
pub use sqltype::{is_serial_type, normalize_sql_type};

/// Identity of a table within a [`State`]: `(schema, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Normalized, lower-cased SQL type (e.g. `varchar(255)`, `bigint`)
    pub sql_type: String,
    /// Whether the column is part of the primary key
    pub is_pk: bool,
    /// Whether the column allows NULL
    pub is_nullable: bool,
    /// Whether the column has a single-column unique constraint
    pub is_unique: bool,
    /// Whether the column is backed by a sequence (serial types)
    pub is_auto_increment: bool,
    /// Whether the column is an identity column
    pub is_identity: bool,
    /// Default value expression, empty if none
    pub default_value: String,
}

impl Column {
    /// Create a nullable column of the given type.
    ///
    /// The type is normalized; `serial`-family types become their integer
    /// counterpart with `is_auto_increment` set.
    pub fn new(sql_type: &str) -> Self {
        let auto = is_serial_type(sql_type);
        Self {
            sql_type: normalize_sql_type(sql_type),
            is_pk: false,
            is_nullable: !auto,
            is_unique: false,
            is_auto_increment: auto,
            is_identity: false,
            default_value: String::new(),
        }
    }

    /// Mark as primary key (implies NOT NULL).
    pub fn primary_key(mut self) -> Self {
        self.is_pk = true;
        self.is_nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    /// Mark as a sequence-backed column. Clears any explicit default.
    pub fn auto_increment(mut self) -> Self {
        self.is_auto_increment = true;
        self.is_nullable = false;
        self.default_value.clear();
        self
    }

    /// Mark as an identity column. Clears any explicit default.
    pub fn identity(mut self) -> Self {
        self.is_identity = true;
        self.is_nullable = false;
        self.default_value.clear();
        self
    }

    /// Set the default expression.
    ///
    /// Ignored for serial and identity columns, whose default is implicit.
    pub fn default(mut self, expr: impl Into<String>) -> Self {
        if !self.is_generated() {
            self.default_value = expr.into();
        }
        self
    }

    /// Whether the database generates values for this column.
    pub fn is_generated(&self) -> bool {
        self.is_auto_increment || self.is_identity
    }

    pub fn has_default(&self) -> bool {
        !self.default_value.is_empty()
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub schema: String,
    pub name: String,
    /// Columns by name, in declaration order
    pub columns: IndexMap<String, Column>,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: IndexMap::new(),
        }
    }

    /// Add (or replace) a column.
    pub fn column(mut self, name: impl Into<String>, column: Column) -> Self {
        self.columns.insert(name.into(), column);
        self
    }

    pub fn id(&self) -> TableId {
        TableId::new(&self.schema, &self.name)
    }

    /// Names of the primary key columns, in column order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, c)| c.is_pk)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// The `(name, type)` pairs of all columns, sorted by name.
    ///
    /// Two tables with equal signatures hold the same data shape; this is what
    /// rename detection compares.
    pub fn signature(&self) -> Vec<(&str, &str)> {
        let mut sig: Vec<(&str, &str)> = self
            .columns
            .iter()
            .map(|(name, col)| (name.as_str(), col.sql_type.as_str()))
            .collect();
        sig.sort_unstable();
        sig
    }
}

/// One side of a foreign key: `(schema, table, ordered columns)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKeyRef {
    pub schema: String,
    pub table: String,
    pub columns: Vec<String>,
}

impl ForeignKeyRef {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn table_id(&self) -> TableId {
        TableId::new(&self.schema, &self.table)
    }
}

impl fmt::Display for ForeignKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.schema,
            self.table,
            self.columns.join(", ")
        )
    }
}

/// A foreign key relation. Columns of `from` and `to` correspond by position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForeignKey {
    pub from: ForeignKeyRef,
    pub to: ForeignKeyRef,
}

impl ForeignKey {
    pub fn new(from: ForeignKeyRef, to: ForeignKeyRef) -> Self {
        Self { from, to }
    }

    /// The constraint name Postgres picks when none is given:
    /// `{table}_{col1}_{col2}_fkey`.
    pub fn default_constraint_name(&self) -> String {
        format!("{}_{}_fkey", self.from.table, self.from.columns.join("_"))
    }

    /// Whether either end of this relation is the given table.
    pub fn touches(&self, table: &TableId) -> bool {
        self.from.table_id() == *table || self.to.table_id() == *table
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// A full schema snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    /// Tables by identity
    pub tables: BTreeMap<TableId, Table>,
    /// Foreign keys, mapped to their constraint name (empty when unknown)
    pub foreign_keys: BTreeMap<ForeignKey, String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`State::add_table`].
    pub fn with_table(mut self, table: Table) -> Self {
        self.add_table(table);
        self
    }

    /// Builder-style [`State::add_foreign_key`] without a constraint name.
    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.add_foreign_key(fk, "");
        self
    }

    /// Insert a table, replacing any table with the same identity.
    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.id(), table);
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKey, constraint_name: impl Into<String>) {
        self.foreign_keys.insert(fk, constraint_name.into());
    }

    pub fn table(&self, id: &TableId) -> Option<&Table> {
        self.tables.get(id)
    }

    pub fn contains_table(&self, id: &TableId) -> bool {
        self.tables.contains_key(id)
    }

    /// Compare table shapes and foreign-key relations, ignoring constraint names.
    ///
    /// Desired states rarely know constraint names, so this is the equality
    /// that matters when checking whether a database has reached a target.
    pub fn same_shape(&self, other: &State) -> bool {
        self.tables == other.tables && self.foreign_keys.keys().eq(other.foreign_keys.keys())
    }

    /// Collect the desired state from all [`TableDef`]s registered via `inventory`.
    pub fn collect() -> Self {
        let mut state = State::new();
        for def in inventory::iter::<TableDef> {
            state.add_table(def.to_table());
            for fk in def.foreign_keys() {
                state.add_foreign_key(fk, "");
            }
        }
        state
    }
}

/// A statically registered table definition.
///
/// ```ignore
/// fn post() -> Table {
///     Table::new("public", "post").column("id", Column::new("bigserial").primary_key())
/// }
///
/// sluice_schema::inventory::submit!(sluice_schema::TableDef::new(post));
/// ```
pub struct TableDef {
    table: fn() -> Table,
    foreign_keys: Option<fn() -> Vec<ForeignKey>>,
}

impl TableDef {
    pub const fn new(table: fn() -> Table) -> Self {
        Self {
            table,
            foreign_keys: None,
        }
    }

    pub const fn with_foreign_keys(table: fn() -> Table, foreign_keys: fn() -> Vec<ForeignKey>) -> Self {
        Self {
            table,
            foreign_keys: Some(foreign_keys),
        }
    }

    pub fn to_table(&self) -> Table {
        (self.table)()
    }

    pub fn foreign_keys(&self) -> Vec<ForeignKey> {
        self.foreign_keys.map(|f| f()).unwrap_or_default()
    }
}

inventory::collect!(TableDef);

// Re-exported for `inventory::submit!` in downstream crates.
pub use inventory;

/// A PostgreSQL identifier wrapper.
///
/// Display writes the value escaped and quoted with double quotes.
///
/// ```
/// use sluice_schema::Ident;
/// assert_eq!(format!("{}", Ident("user")), "\"user\"");
/// assert_eq!(format!("{}", Ident("bla\"h")), "\"bla\"\"h\"");
/// ```
pub struct Ident<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Ident<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"")?;
        for c in self.0.as_ref().chars() {
            if c == '"' {
                write!(f, "\"\"")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "\"")
    }
}

/// A PostgreSQL string literal wrapper.
///
/// ```
/// use sluice_schema::Lit;
/// assert_eq!(format!("{}", Lit("it's")), "'it''s'");
/// ```
pub struct Lit<T: AsRef<str>>(pub T);

impl<T: AsRef<str>> fmt::Display for Lit<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'")?;
        for c in self.0.as_ref().chars() {
            if c == '\'' {
                write!(f, "''")?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "'")
    }
}

/// Quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("{}", Ident(name))
}

/// Quote a possibly dotted name (`schema.table`) part by part.
///
/// ```
/// assert_eq!(sluice_schema::quote_path("audit.events"), "\"audit\".\"events\"");
/// assert_eq!(sluice_schema::quote_path("events"), "\"events\"");
/// ```
pub fn quote_path(path: &str) -> String {
    path.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}
