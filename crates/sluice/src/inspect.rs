//! Live-database inspection.
//!
//! Reads tables, columns and foreign keys from `information_schema` and
//! `pg_catalog` into a [`State`], normalized the same way desired states are
//! so the two can be diffed directly.

use std::collections::BTreeMap;

use sluice_schema::{
    Column, ForeignKey, ForeignKeyRef, State, Table, TableId, normalize_sql_type,
};
use tokio_postgres::Row;

use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};

const TABLES_SQL: &str = r"
SELECT t.table_schema::text AS table_schema, t.table_name::text AS table_name
FROM information_schema.tables t
WHERE t.table_type = 'BASE TABLE'
    AND t.table_schema <> 'information_schema'
    AND t.table_schema NOT LIKE 'pg\_%'
    AND NOT (t.table_name::text = ANY($1::text[]))
ORDER BY t.table_schema, t.table_name
";

// `format_type` keeps type modifiers (`numeric(10,2)`, `timestamp(3) with
// time zone`, `character varying(64)[]`) that information_schema splits up.
const COLUMNS_SQL: &str = r"
SELECT
    c.table_schema::text AS table_schema,
    c.table_name::text AS table_name,
    c.column_name::text AS column_name,
    format_type(att.atttypid, att.atttypmod) AS sql_type,
    c.column_default::text AS column_default,
    COALESCE(c.is_nullable = 'YES', true) AS is_nullable,
    COALESCE(c.is_identity = 'YES', false) AS is_identity,
    pg_get_serial_sequence(
        format('%I.%I', c.table_schema::text, c.table_name::text),
        c.column_name::text
    ) IS NOT NULL AS owns_sequence,
    COALESCE(k.is_pk, false) AS is_pk,
    COALESCE(k.is_unique, false) AS is_unique
FROM information_schema.columns c
JOIN information_schema.tables t
    ON t.table_schema = c.table_schema AND t.table_name = c.table_name
JOIN pg_namespace ns ON ns.nspname = c.table_schema::text
JOIN pg_class rel ON rel.relnamespace = ns.oid AND rel.relname = c.table_name::text
JOIN pg_attribute att
    ON att.attrelid = rel.oid AND att.attname = c.column_name::text AND NOT att.attisdropped
LEFT JOIN (
    SELECT
        ns.nspname::text AS table_schema,
        rel.relname::text AS table_name,
        att.attname::text AS column_name,
        bool_or(con.contype = 'p') AS is_pk,
        bool_or(con.contype = 'u' AND array_length(con.conkey, 1) = 1) AS is_unique
    FROM pg_constraint con
    JOIN pg_class rel ON rel.oid = con.conrelid
    JOIN pg_namespace ns ON ns.oid = rel.relnamespace
    JOIN pg_attribute att ON att.attrelid = rel.oid AND att.attnum = ANY(con.conkey)
    WHERE con.contype IN ('p', 'u')
    GROUP BY 1, 2, 3
) k ON k.table_schema = c.table_schema::text
    AND k.table_name = c.table_name::text
    AND k.column_name = c.column_name::text
WHERE t.table_type = 'BASE TABLE'
    AND c.table_schema <> 'information_schema'
    AND c.table_schema NOT LIKE 'pg\_%'
    AND NOT (c.table_name::text = ANY($1::text[]))
ORDER BY c.table_schema, c.table_name, c.ordinal_position
";

// Columns are unnested pairwise so multi-column keys keep their positions.
const FOREIGN_KEYS_SQL: &str = r"
SELECT
    con.conname::text AS constraint_name,
    src_ns.nspname::text AS from_schema,
    src.relname::text AS from_table,
    array_agg(src_att.attname::text ORDER BY k.ord) AS from_columns,
    dst_ns.nspname::text AS to_schema,
    dst.relname::text AS to_table,
    array_agg(dst_att.attname::text ORDER BY k.ord) AS to_columns
FROM pg_constraint con
JOIN pg_class src ON src.oid = con.conrelid
JOIN pg_namespace src_ns ON src_ns.oid = src.relnamespace
JOIN pg_class dst ON dst.oid = con.confrelid
JOIN pg_namespace dst_ns ON dst_ns.oid = dst.relnamespace
CROSS JOIN LATERAL UNNEST(con.conkey, con.confkey) WITH ORDINALITY AS k(src_attnum, dst_attnum, ord)
JOIN pg_attribute src_att ON src_att.attrelid = src.oid AND src_att.attnum = k.src_attnum
JOIN pg_attribute dst_att ON dst_att.attrelid = dst.oid AND dst_att.attnum = k.dst_attnum
WHERE con.contype = 'f'
    AND src_ns.nspname <> 'information_schema'
    AND src_ns.nspname NOT LIKE 'pg\_%'
    AND NOT (src.relname::text = ANY($1::text[]))
    AND NOT (dst.relname::text = ANY($1::text[]))
GROUP BY con.conname, src_ns.nspname, src.relname, dst_ns.nspname, dst.relname
ORDER BY 2, 3, 1
";

/// Reads the current schema of a Postgres database.
pub struct Inspector<'a> {
    conn: &'a dyn Connection,
    exclude_tables: Vec<String>,
}

impl<'a> Inspector<'a> {
    pub fn new(conn: &'a dyn Connection) -> Self {
        Self {
            conn,
            exclude_tables: Vec::new(),
        }
    }

    /// Skip tables with these (unqualified) names, in every schema.
    pub fn exclude_tables(mut self, tables: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude_tables
            .extend(tables.into_iter().map(Into::into));
        self
    }

    /// Snapshot all user tables, their columns and foreign keys.
    ///
    /// System schemas (`information_schema`, `pg_*`) are never included.
    pub async fn inspect(&self) -> Result<State> {
        let conn = self.conn.traced();
        let exclude = &self.exclude_tables;

        let table_rows = conn
            .query(TABLES_SQL, &[exclude])
            .await
            .map_err(Error::Inspection)?;
        let column_rows = conn
            .query(COLUMNS_SQL, &[exclude])
            .await
            .map_err(Error::Inspection)?;
        let fk_rows = conn
            .query(FOREIGN_KEYS_SQL, &[exclude])
            .await
            .map_err(Error::Inspection)?;

        let mut tables: BTreeMap<TableId, Table> = BTreeMap::new();
        for row in &table_rows {
            let schema: String = row.try_get("table_schema").map_err(Error::Inspection)?;
            let name: String = row.try_get("table_name").map_err(Error::Inspection)?;
            tables.insert(TableId::new(&schema, &name), Table::new(schema, name));
        }

        for row in &column_rows {
            let (id, name, column) = read_column(row).map_err(Error::Inspection)?;
            if let Some(table) = tables.get_mut(&id) {
                table.columns.insert(name, column);
            }
        }

        let mut state = State {
            tables,
            ..State::default()
        };

        for row in &fk_rows {
            let (fk, constraint_name) = read_foreign_key(row).map_err(Error::Inspection)?;
            state.add_foreign_key(fk, constraint_name);
        }

        tracing::debug!(
            tables = state.tables.len(),
            foreign_keys = state.foreign_keys.len(),
            "inspected database schema"
        );
        Ok(state)
    }
}

fn read_column(row: &Row) -> std::result::Result<(TableId, String, Column), tokio_postgres::Error> {
    let id = TableId::new(
        row.try_get::<_, String>("table_schema")?,
        row.try_get::<_, String>("table_name")?,
    );
    let name: String = row.try_get("column_name")?;
    let raw = CatalogColumn {
        sql_type: row.try_get("sql_type")?,
        default: row.try_get("column_default")?,
        is_nullable: row.try_get("is_nullable")?,
        is_identity: row.try_get("is_identity")?,
        owns_sequence: row.try_get("owns_sequence")?,
        is_pk: row.try_get("is_pk")?,
        is_unique: row.try_get("is_unique")?,
    };
    Ok((id, name, raw.into_column()))
}

fn read_foreign_key(row: &Row) -> std::result::Result<(ForeignKey, String), tokio_postgres::Error> {
    let from = ForeignKeyRef::new(
        row.try_get::<_, String>("from_schema")?,
        row.try_get::<_, String>("from_table")?,
        row.try_get::<_, Vec<String>>("from_columns")?,
    );
    let to = ForeignKeyRef::new(
        row.try_get::<_, String>("to_schema")?,
        row.try_get::<_, String>("to_table")?,
        row.try_get::<_, Vec<String>>("to_columns")?,
    );
    Ok((ForeignKey::new(from, to), row.try_get("constraint_name")?))
}

/// One row of column metadata as the catalog reports it.
#[derive(Debug, Clone, Default)]
struct CatalogColumn {
    /// As reported by `format_type()`
    sql_type: String,
    default: Option<String>,
    is_nullable: bool,
    is_identity: bool,
    /// Whether the column owns a sequence (`pg_get_serial_sequence`)
    owns_sequence: bool,
    is_pk: bool,
    is_unique: bool,
}

impl CatalogColumn {
    fn into_column(self) -> Column {
        let default = self.default.unwrap_or_default();
        // A nextval() default on a sequence the column doesn't own is an
        // ordinary default expression.
        let is_auto_increment =
            self.owns_sequence && !self.is_identity && default.starts_with("nextval(");

        Column {
            sql_type: normalize_sql_type(&self.sql_type),
            is_pk: self.is_pk,
            is_nullable: self.is_nullable,
            is_unique: self.is_unique && !self.is_pk,
            is_auto_increment,
            is_identity: self.is_identity,
            default_value: if is_auto_increment || self.is_identity {
                String::new()
            } else {
                normalize_default(&default)
            },
        }
    }
}

/// Strip the cast Postgres adds to literal defaults: `'draft'::text` becomes
/// `'draft'`. Other expressions are kept as reported.
fn normalize_default(raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('\'') {
        if let Some(end) = raw.rfind("'::") {
            return raw[..=end].to_string();
        }
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;

    fn catalog(sql_type: &str) -> CatalogColumn {
        CatalogColumn {
            sql_type: sql_type.into(),
            is_nullable: true,
            ..CatalogColumn::default()
        }
    }

    fn one_column(column: Column) -> State {
        State::new().with_table(Table::new("public", "t").column("c", column))
    }

    /// Inspecting a column declared as `declared` must diff to nothing.
    #[track_caller]
    fn assert_converges(reported: CatalogColumn, declared: Column) {
        let changes = diff(&one_column(reported.into_column()), &one_column(declared));
        assert!(changes.is_empty(), "expected no changes, got:\n{changes}");
        assert!(changes.diagnostics.is_empty(), "{changes}");
    }

    #[test]
    fn test_normalize_default() {
        assert_eq!(normalize_default("'draft'::text"), "'draft'");
        assert_eq!(
            normalize_default("'it''s'::character varying"),
            "'it''s'"
        );
        assert_eq!(normalize_default("now()"), "now()");
        assert_eq!(normalize_default("0"), "0");
        assert_eq!(normalize_default(""), "");
    }

    #[test]
    fn test_serial_column_drops_sequence_default() {
        let col = CatalogColumn {
            default: Some("nextval('user_id_seq'::regclass)".into()),
            is_nullable: false,
            owns_sequence: true,
            is_pk: true,
            ..catalog("bigint")
        }
        .into_column();

        assert_eq!(col, Column::new("bigserial").primary_key());
    }

    #[test]
    fn test_shared_sequence_default_is_kept() {
        let reported = CatalogColumn {
            default: Some("nextval('order_no_seq'::regclass)".into()),
            is_nullable: false,
            ..catalog("bigint")
        };
        let col = reported.clone().into_column();
        assert!(!col.is_auto_increment);
        assert_eq!(col.default_value, "nextval('order_no_seq'::regclass)");

        assert_converges(
            reported,
            Column::new("bigint")
                .not_null()
                .default("nextval('order_no_seq'::regclass)"),
        );
    }

    #[test]
    fn test_identity_column() {
        let col = CatalogColumn {
            is_identity: true,
            owns_sequence: true,
            is_nullable: false,
            ..catalog("bigint")
        }
        .into_column();

        assert_eq!(col, Column::new("bigint").identity());
    }

    #[test]
    fn test_varchar_length_and_default() {
        let col = CatalogColumn {
            default: Some("'anon'::character varying".into()),
            is_unique: true,
            ..catalog("character varying(255)")
        }
        .into_column();

        assert_eq!(col, Column::new("varchar(255)").unique().default("'anon'"));
    }

    #[test]
    fn test_pk_is_not_reported_unique() {
        let col = CatalogColumn {
            is_pk: true,
            is_unique: true,
            is_nullable: false,
            ..catalog("uuid")
        }
        .into_column();
        assert!(!col.is_unique);
    }

    #[test]
    fn test_array_column() {
        let col = catalog("text[]").into_column();
        assert_eq!(col.sql_type, "text[]");
    }

    #[test]
    fn test_numeric_precision_converges() {
        assert_converges(catalog("numeric(10,2)"), Column::new("numeric(10, 2)"));
        assert_converges(catalog("numeric"), Column::new("decimal"));
    }

    #[test]
    fn test_time_precision_converges() {
        assert_converges(
            catalog("timestamp(3) with time zone"),
            Column::new("timestamptz(3)"),
        );
        assert_converges(
            catalog("timestamp with time zone"),
            Column::new("timestamptz"),
        );
        assert_converges(
            catalog("time(0) without time zone"),
            Column::new("time(0)"),
        );
    }

    #[test]
    fn test_array_element_length_converges() {
        assert_converges(
            catalog("character varying(64)[]"),
            Column::new("varchar(64)[]"),
        );
    }

    #[test]
    fn test_bare_char_converges() {
        assert_converges(catalog("character(1)"), Column::new("char"));
        assert_converges(catalog("character(3)"), Column::new("char(3)"));
    }
}
