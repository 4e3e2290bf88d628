//! SQL dialects.
//!
//! A [`Dialect`] turns [`Operation`]s into DDL statements. Only Postgres is
//! implemented; the trait is the seam another database would plug into.

use sluice_schema::{Column, ForeignKeyRef, Table, quote_ident};

use crate::operation::Operation;

/// SQL syntax for one database engine.
pub trait Dialect: Send + Sync {
    /// Short name of the dialect, used in logs.
    fn name(&self) -> &str;

    /// Quote an identifier.
    fn quote_ident(&self, name: &str) -> String;

    /// Quote a schema-qualified table name.
    fn quote_table(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
    }

    /// Render one operation to one or more statements, each terminated by `;`.
    fn render(&self, op: &Operation) -> Vec<String>;
}

/// PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDialect;

impl PgDialect {
    pub fn new() -> Self {
        Self
    }

    /// `CREATE TABLE` with inline column constraints.
    ///
    /// A single-column primary key is declared inline; a composite one gets a
    /// trailing `PRIMARY KEY (...)` clause. Foreign keys are never inlined,
    /// they are added by separate operations.
    pub fn create_table_sql(&self, table: &Table) -> String {
        let pk_cols = table.primary_key();
        let composite_pk = pk_cols.len() > 1;

        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|(name, col)| self.column_definition(name, col, !composite_pk))
            .collect();

        if composite_pk {
            let quoted: Vec<String> = pk_cols.iter().map(|c| self.quote_ident(c)).collect();
            parts.push(format!("PRIMARY KEY ({})", quoted.join(", ")));
        }

        let name = self.quote_table(&table.schema, &table.name);
        if parts.is_empty() {
            return format!("CREATE TABLE {name} ();");
        }
        format!("CREATE TABLE {name} (\n    {}\n);", parts.join(",\n    "))
    }

    /// A column as it appears in `CREATE TABLE` or `ADD COLUMN`.
    fn column_definition(&self, name: &str, col: &Column, inline_pk: bool) -> String {
        let mut def = format!("{} {}", self.quote_ident(name), column_type(col));

        if col.is_identity {
            def.push_str(" GENERATED BY DEFAULT AS IDENTITY");
        }
        if col.is_pk && inline_pk {
            def.push_str(" PRIMARY KEY");
        } else if !col.is_nullable {
            def.push_str(" NOT NULL");
        }
        if col.is_unique && !col.is_pk {
            def.push_str(" UNIQUE");
        }
        if col.has_default() && !col.is_generated() {
            def.push_str(&format!(" DEFAULT {}", col.default_value));
        }
        def
    }

    fn column_list(&self, side: &ForeignKeyRef) -> String {
        side.columns
            .iter()
            .map(|c| self.quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn alter_column_sql(
        &self,
        table: &str,
        column: &str,
        from: &Column,
        to: &Column,
    ) -> Vec<String> {
        let column = self.quote_ident(column);
        let mut stmts = Vec::new();

        if from.sql_type != to.sql_type {
            stmts.push(format!(
                "ALTER TABLE {table} ALTER COLUMN {column} TYPE {ty} USING {column}::{ty};",
                ty = to.sql_type
            ));
        }
        if from.is_nullable != to.is_nullable {
            let action = if to.is_nullable { "DROP" } else { "SET" };
            stmts.push(format!(
                "ALTER TABLE {table} ALTER COLUMN {column} {action} NOT NULL;"
            ));
        }
        if from.default_value != to.default_value {
            if to.has_default() {
                stmts.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} SET DEFAULT {};",
                    to.default_value
                ));
            } else {
                stmts.push(format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} DROP DEFAULT;"
                ));
            }
        }
        stmts
    }
}

/// The type to declare a column with. Sequence-backed integer columns are
/// declared with their `serial` spelling so Postgres creates the sequence.
fn column_type(col: &Column) -> &str {
    if col.is_auto_increment {
        match col.sql_type.as_str() {
            "integer" => return "serial",
            "bigint" => return "bigserial",
            "smallint" => return "smallserial",
            _ => {}
        }
    }
    &col.sql_type
}

impl Dialect for PgDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_ident(name)
    }

    fn render(&self, op: &Operation) -> Vec<String> {
        match op {
            Operation::CreateTable { table } => vec![self.create_table_sql(table)],
            Operation::DropTable { schema, name } => {
                vec![format!("DROP TABLE {};", self.quote_table(schema, name))]
            }
            Operation::RenameTable { schema, from, to } => vec![format!(
                "ALTER TABLE {} RENAME TO {};",
                self.quote_table(schema, from),
                self.quote_ident(to)
            )],
            Operation::AddColumn {
                schema,
                table,
                column,
                def,
            } => vec![format!(
                "ALTER TABLE {} ADD COLUMN {};",
                self.quote_table(schema, table),
                self.column_definition(column, def, true)
            )],
            Operation::DropColumn {
                schema,
                table,
                column,
            } => vec![format!(
                "ALTER TABLE {} DROP COLUMN {};",
                self.quote_table(schema, table),
                self.quote_ident(column)
            )],
            Operation::AlterColumn {
                schema,
                table,
                column,
                from,
                to,
            } => self.alter_column_sql(&self.quote_table(schema, table), column, from, to),
            Operation::AddForeignKey {
                fk,
                constraint_name,
            } => vec![format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({});",
                self.quote_table(&fk.from.schema, &fk.from.table),
                self.quote_ident(constraint_name),
                self.column_list(&fk.from),
                self.quote_table(&fk.to.schema, &fk.to.table),
                self.column_list(&fk.to),
            )],
            Operation::DropForeignKey {
                fk,
                constraint_name,
            } => vec![format!(
                "ALTER TABLE {} DROP CONSTRAINT {};",
                self.quote_table(&fk.from.schema, &fk.from.table),
                self.quote_ident(constraint_name)
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_schema::ForeignKey;

    fn render_one(op: &Operation) -> String {
        PgDialect.render(op).join("\n")
    }

    #[test]
    fn test_create_table_inline_pk() {
        let table = Table::new("public", "user")
            .column("id", Column::new("bigserial").primary_key())
            .column("email", Column::new("text").not_null().unique())
            .column("active", Column::new("boolean").not_null().default("true"));

        assert_eq!(
            PgDialect.create_table_sql(&table),
            "CREATE TABLE \"public\".\"user\" (\n    \
             \"id\" bigserial PRIMARY KEY,\n    \
             \"email\" text NOT NULL UNIQUE,\n    \
             \"active\" boolean NOT NULL DEFAULT true\n);"
        );
    }

    #[test]
    fn test_create_table_composite_pk() {
        let table = Table::new("public", "post_tag")
            .column("post_id", Column::new("bigint").primary_key())
            .column("tag_id", Column::new("bigint").primary_key());

        assert_eq!(
            PgDialect.create_table_sql(&table),
            "CREATE TABLE \"public\".\"post_tag\" (\n    \
             \"post_id\" bigint NOT NULL,\n    \
             \"tag_id\" bigint NOT NULL,\n    \
             PRIMARY KEY (\"post_id\", \"tag_id\")\n);"
        );
    }

    #[test]
    fn test_create_table_identity_and_empty() {
        let table =
            Table::new("public", "event").column("id", Column::new("bigint").identity().primary_key());
        insta::assert_snapshot!(
            PgDialect.create_table_sql(&table).replace('\n', " "),
            @r#"CREATE TABLE "public"."event" (     "id" bigint GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY );"#
        );

        let empty = Table::new("audit", "marker");
        assert_eq!(
            PgDialect.create_table_sql(&empty),
            "CREATE TABLE \"audit\".\"marker\" ();"
        );
    }

    #[test]
    fn test_render_rename_and_drop() {
        let rename = Operation::RenameTable {
            schema: "public".into(),
            from: "users".into(),
            to: "user".into(),
        };
        insta::assert_snapshot!(render_one(&rename), @r#"ALTER TABLE "public"."users" RENAME TO "user";"#);

        let drop = Operation::DropTable {
            schema: "public".into(),
            name: "legacy".into(),
        };
        insta::assert_snapshot!(render_one(&drop), @r#"DROP TABLE "public"."legacy";"#);
    }

    #[test]
    fn test_render_add_column() {
        let op = Operation::AddColumn {
            schema: "public".into(),
            table: "user".into(),
            column: "bio".into(),
            def: Column::new("varchar(280)").default("''"),
        };
        insta::assert_snapshot!(
            render_one(&op),
            @r#"ALTER TABLE "public"."user" ADD COLUMN "bio" varchar(280) DEFAULT '';"#
        );
    }

    #[test]
    fn test_render_alter_column_emits_one_statement_per_change() {
        let op = Operation::AlterColumn {
            schema: "public".into(),
            table: "user".into(),
            column: "age".into(),
            from: Column::new("integer"),
            to: Column::new("bigint").not_null().default("0"),
        };
        let stmts = PgDialect.render(&op);
        assert_eq!(
            stmts,
            vec![
                "ALTER TABLE \"public\".\"user\" ALTER COLUMN \"age\" TYPE bigint USING \"age\"::bigint;",
                "ALTER TABLE \"public\".\"user\" ALTER COLUMN \"age\" SET NOT NULL;",
                "ALTER TABLE \"public\".\"user\" ALTER COLUMN \"age\" SET DEFAULT 0;",
            ]
        );

        let op = Operation::AlterColumn {
            schema: "public".into(),
            table: "user".into(),
            column: "age".into(),
            from: Column::new("integer").default("0"),
            to: Column::new("integer"),
        };
        insta::assert_snapshot!(
            render_one(&op),
            @r#"ALTER TABLE "public"."user" ALTER COLUMN "age" DROP DEFAULT;"#
        );
    }

    #[test]
    fn test_render_foreign_keys() {
        let fk = ForeignKey::new(
            ForeignKeyRef::new("public", "post", ["author_id"]),
            ForeignKeyRef::new("public", "user", ["id"]),
        );
        let add = Operation::AddForeignKey {
            fk: fk.clone(),
            constraint_name: fk.default_constraint_name(),
        };
        insta::assert_snapshot!(
            render_one(&add),
            @r#"ALTER TABLE "public"."post" ADD CONSTRAINT "post_author_id_fkey" FOREIGN KEY ("author_id") REFERENCES "public"."user" ("id");"#
        );

        let drop = Operation::DropForeignKey {
            fk,
            constraint_name: "post_author_fk".into(),
        };
        insta::assert_snapshot!(
            render_one(&drop),
            @r#"ALTER TABLE "public"."post" DROP CONSTRAINT "post_author_fk";"#
        );
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(PgDialect.quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(PgDialect.quote_table("a", "b"), "\"a\".\"b\"");
    }
}
