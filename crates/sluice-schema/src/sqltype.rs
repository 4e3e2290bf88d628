//! SQL type normalization.
//!
//! Both the inspector and the desired-state builders funnel type names through
//! here, so `INT4`, `integer` and `int` all compare equal in a diff.

/// Normalize a type name into sluice's dialect-neutral vocabulary.
///
/// Lower-cases, collapses whitespace and maps aliases onto a single canonical
/// spelling. A length/precision modifier such as `(255)` or `(10, 2)` is kept,
/// wherever it appears, so the output of Postgres' `format_type()` and a
/// hand-written type name end up spelled the same way.
///
/// ```
/// use sluice_schema::normalize_sql_type;
/// assert_eq!(normalize_sql_type("VARCHAR(255)"), "varchar(255)");
/// assert_eq!(normalize_sql_type("character varying"), "varchar");
/// assert_eq!(normalize_sql_type("int8"), "bigint");
/// assert_eq!(normalize_sql_type("timestamp with time zone"), "timestamptz");
/// assert_eq!(normalize_sql_type("timestamp(3) with time zone"), "timestamptz(3)");
/// assert_eq!(normalize_sql_type("character varying(64)[]"), "varchar(64)[]");
/// assert_eq!(normalize_sql_type("char"), "char(1)");
/// ```
pub fn normalize_sql_type(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Some(elem) = collapsed.strip_suffix("[]") {
        return format!("{}[]", normalize_sql_type(elem));
    }

    // The catalog puts modifiers mid-name: `timestamp(3) with time zone`.
    let (base, args) = match (collapsed.find('('), collapsed.find(')')) {
        (Some(open), Some(close)) if close > open => {
            let base = format!(
                "{} {}",
                collapsed[..open].trim_end(),
                collapsed[close + 1..].trim_start()
            );
            let args: String = collapsed[open..=close]
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            (base.trim().to_string(), args)
        }
        _ => (collapsed, String::new()),
    };

    let name = canonical_name(&base);
    if args.is_empty() && matches!(name, "char" | "bit") {
        // Postgres stores a bare `char` or `bit` as length 1
        return format!("{name}(1)");
    }
    format!("{name}{args}")
}

/// Whether this type name is one of the `serial` pseudo-types.
pub fn is_serial_type(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "serial" | "serial4" | "bigserial" | "serial8" | "smallserial" | "serial2"
    )
}

fn canonical_name(base: &str) -> &str {
    match base {
        "int" | "int4" | "integer" | "serial" | "serial4" => "integer",
        "int8" | "bigint" | "bigserial" | "serial8" => "bigint",
        "int2" | "smallint" | "smallserial" | "serial2" => "smallint",
        "float4" | "real" => "real",
        "float8" | "double precision" | "float" => "double precision",
        "bool" | "boolean" => "boolean",
        "decimal" | "numeric" => "numeric",
        "character varying" | "varchar" => "varchar",
        "character" | "char" | "bpchar" => "char",
        "timestamp with time zone" | "timestamptz" => "timestamptz",
        "timestamp without time zone" | "timestamp" => "timestamp",
        "time with time zone" | "timetz" => "timetz",
        "time without time zone" | "time" => "time",
        other => other,
    }
}
