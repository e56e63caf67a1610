//! Postgres DDL for the namespace registry, per-namespace catalogs and chunk tables.

use indoc::formatdoc;

use crate::event::AttributeKind;
use crate::naming::{qualified_name, quote_ident};

pub(crate) const NAMESPACES_TABLE: &str = "eventide_namespaces";
pub(crate) const CHUNKS_TABLE: &str = "chunks";
pub(crate) const COLUMNS_TABLE: &str = "columns";
pub(crate) const LOOKUP_TABLE: &str = "chunk_lookup";

pub(crate) const TIMESTAMP_COLUMN: &str = "ts";
pub(crate) const PAYLOAD_COLUMN: &str = "payload";

pub(crate) fn build_namespaces_table_sql(base_schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            namespace text primary key,
            schema_name text not null unique,
            chunk_window_ms bigint not null,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(base_schema, NAMESPACES_TABLE),
    )
}

pub(crate) fn build_namespace_schema_sql(schema: &str) -> String {
    format!("create schema if not exists {}", quote_ident(schema))
}

pub(crate) fn build_drop_namespace_schema_sql(schema: &str) -> String {
    format!("drop schema if exists {} cascade", quote_ident(schema))
}

pub(crate) fn build_chunks_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            table_name text primary key,
            chunk_start bigint not null,
            signature jsonb not null,
            created_at timestamptz not null default now()
        )
        ",
        table = qualified_name(schema, CHUNKS_TABLE),
    )
}

pub(crate) fn build_chunks_index_sql(schema: &str) -> String {
    format!(
        "create index if not exists {} on {} (chunk_start)",
        quote_ident("chunks_start_idx"),
        qualified_name(schema, CHUNKS_TABLE)
    )
}

/// Namespace-wide key to column allocation. `unique (column_name)` keeps the
/// mapping injective even with concurrent writers.
pub(crate) fn build_columns_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            kind text not null,
            key text not null,
            column_name text not null unique,
            primary key (kind, key)
        )
        ",
        table = qualified_name(schema, COLUMNS_TABLE),
    )
}

pub(crate) fn build_lookup_table_sql(schema: &str) -> String {
    formatdoc!(
        "
        create table if not exists {table} (
            table_name text not null,
            kind text not null,
            key text not null,
            column_name text not null,
            chunk_start bigint not null,
            primary key (table_name, kind, key)
        )
        ",
        table = qualified_name(schema, LOOKUP_TABLE),
    )
}

pub(crate) fn build_lookup_index_sql(schema: &str) -> String {
    format!(
        "create index if not exists {} on {} (kind, key, chunk_start)",
        quote_ident("chunk_lookup_key_idx"),
        qualified_name(schema, LOOKUP_TABLE)
    )
}

/// Every statement needed before a namespace accepts writes, in order.
pub(crate) fn namespace_catalog_statements(schema: &str) -> Vec<String> {
    vec![
        build_namespace_schema_sql(schema),
        build_chunks_table_sql(schema),
        build_chunks_index_sql(schema),
        build_columns_table_sql(schema),
        build_lookup_table_sql(schema),
        build_lookup_index_sql(schema),
    ]
}

fn column_type(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Metadata => "text",
        AttributeKind::Dimension => "double precision",
    }
}

pub(crate) fn build_chunk_table_sql(
    schema: &str,
    table: &str,
    columns: &[(AttributeKind, &str)],
) -> String {
    let mut attributes = String::new();
    for (kind, column) in columns {
        attributes.push_str(&format!(
            "    {} {} null,\n",
            quote_ident(column),
            column_type(*kind)
        ));
    }
    formatdoc!(
        "
        create table if not exists {table} (
            {ts} bigint not null,
        {attributes}    {payload} bytea null
        )
        ",
        table = qualified_name(schema, table),
        ts = quote_ident(TIMESTAMP_COLUMN),
        attributes = attributes,
        payload = quote_ident(PAYLOAD_COLUMN),
    )
}

/// Index statements for a new chunk table: the timestamp first, then attribute
/// columns until `max_indexes` is reached. Remaining columns are scanned.
pub(crate) fn build_chunk_index_sql(
    schema: &str,
    table: &str,
    columns: &[&str],
    max_indexes: usize,
) -> Vec<String> {
    let target = qualified_name(schema, table);
    std::iter::once(TIMESTAMP_COLUMN)
        .chain(columns.iter().copied())
        .take(max_indexes)
        .enumerate()
        .map(|(i, column)| {
            format!(
                "create index if not exists {} on {} ({})",
                quote_ident(&format!("{table}_i{i}")),
                target,
                quote_ident(column)
            )
        })
        .collect()
}
