//! SQLite corpus reader.
//!
//! Streams [`Item`]s from a single table in ascending `id` order, starting
//! strictly after a given id. The table only needs an integer `id` column and
//! one text column; `date`, `topic_id` and `topic_title` are surfaced when the
//! table has them. Rows are fetched lazily in keyset pages so arbitrarily large
//! corpora never have to fit in memory.

use anyhow::{bail, Context, Result};
use sqlx::sqlite::SqliteArguments;
use sqlx::{Row, Sqlite, SqlitePool};
use std::collections::VecDeque;

use crate::models::{source_id_for, Item};

/// Text columns we recognise, in order of preference.
pub const TEXT_COLUMN_CANDIDATES: [&str; 4] = ["text", "message", "content", "body"];

const PAGE_SIZE: u64 = 500;

/// Which rows to read.
#[derive(Debug, Clone, Default)]
pub struct CorpusQuery {
    pub table: String,
    pub start_after_id: i64,
    pub limit: Option<u64>,
    pub topic_id: Option<i64>,
    pub topic_title_contains: Option<String>,
    pub min_text_len: Option<i64>,
}

impl CorpusQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }
}

/// Columns detected on the corpus table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusSchema {
    pub text_column: String,
    pub has_date: bool,
    pub has_topic_id: bool,
    pub has_topic_title: bool,
}

/// Inspect `table` and pick the columns to read.
pub async fn inspect_schema(pool: &SqlitePool, table: &str) -> Result<CorpusSchema> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
        .fetch_all(pool)
        .await
        .with_context(|| format!("Failed to inspect table '{}'", table))?;

    let columns: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
    if columns.is_empty() {
        bail!("Table '{}' not found in corpus", table);
    }
    if !columns.iter().any(|c| c == "id") {
        bail!(
            "Table '{}' must have an 'id' column. Found: {}",
            table,
            columns.join(", ")
        );
    }

    let text_column = TEXT_COLUMN_CANDIDATES
        .iter()
        .find(|cand| columns.iter().any(|c| c == *cand))
        .map(|c| c.to_string())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Table '{}' must have one of the text columns ({}). Found: {}",
                table,
                TEXT_COLUMN_CANDIDATES.join("|"),
                columns.join(", ")
            )
        })?;

    let has = |name: &str| columns.iter().any(|c| c == name);
    Ok(CorpusSchema {
        text_column,
        has_date: has("date"),
        has_topic_id: has("topic_id"),
        has_topic_title: has("topic_title"),
    })
}

enum Bind {
    Int(i64),
    Text(String),
}

/// WHERE clause (without the cursor condition) and its bind values.
fn filter_clause(schema: &CorpusSchema, query: &CorpusQuery) -> (Vec<String>, Vec<Bind>) {
    let mut where_parts = Vec::new();
    let mut binds = Vec::new();

    if let Some(min_len) = query.min_text_len {
        where_parts.push(format!("length({}) >= ?", quote_ident(&schema.text_column)));
        binds.push(Bind::Int(min_len));
    }
    // Filters on columns the table lacks are ignored.
    if let (Some(topic_id), true) = (query.topic_id, schema.has_topic_id) {
        where_parts.push("topic_id = ?".to_string());
        binds.push(Bind::Int(topic_id));
    }
    if let (Some(title), true) = (&query.topic_title_contains, schema.has_topic_title) {
        if !title.is_empty() {
            where_parts.push("topic_title LIKE ?".to_string());
            binds.push(Bind::Text(format!("%{}%", title)));
        }
    }

    (where_parts, binds)
}

fn bind_all<'q>(
    mut q: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: &[Bind],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for b in binds {
        q = match b {
            Bind::Int(v) => q.bind(*v),
            Bind::Text(s) => q.bind(s.clone()),
        };
    }
    q
}

/// Count rows matching `query`, capped by its limit.
pub async fn count_items(pool: &SqlitePool, query: &CorpusQuery) -> Result<u64> {
    let schema = inspect_schema(pool, &query.table).await?;
    let (mut where_parts, binds) = filter_clause(&schema, query);
    where_parts.insert(0, "id > ?".to_string());

    let sql = format!(
        "SELECT COUNT(*) AS n FROM {} WHERE {}",
        quote_ident(&query.table),
        where_parts.join(" AND ")
    );
    let q = bind_all(sqlx::query(&sql).bind(query.start_after_id), &binds);
    let row = q.fetch_one(pool).await?;
    let total = row.get::<i64, _>("n").max(0) as u64;

    Ok(match query.limit {
        Some(limit) => total.min(limit),
        None => total,
    })
}

/// Lazy ascending-by-id iterator over corpus rows.
pub struct ItemStream<'a> {
    pool: &'a SqlitePool,
    schema: CorpusSchema,
    query: CorpusQuery,
    cursor: i64,
    remaining: Option<u64>,
    buffer: VecDeque<Item>,
    exhausted: bool,
}

/// Open a stream over the rows matching `query`.
pub async fn stream_items<'a>(pool: &'a SqlitePool, query: CorpusQuery) -> Result<ItemStream<'a>> {
    let schema = inspect_schema(pool, &query.table).await?;
    Ok(ItemStream {
        pool,
        schema,
        cursor: query.start_after_id,
        remaining: query.limit,
        query,
        buffer: VecDeque::new(),
        exhausted: false,
    })
}

impl<'a> ItemStream<'a> {
    /// Next item, or `None` once the table (or the row limit) is exhausted.
    pub async fn next(&mut self) -> Result<Option<Item>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        let item = self.buffer.pop_front();
        if let (Some(_), Some(rem)) = (&item, self.remaining.as_mut()) {
            *rem -= 1;
        }
        Ok(item)
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let page = match self.remaining {
            Some(rem) => rem.min(PAGE_SIZE),
            None => PAGE_SIZE,
        };

        let mut select_cols = vec![
            "id".to_string(),
            format!("CAST({} AS TEXT) AS text", quote_ident(&self.schema.text_column)),
        ];
        if self.schema.has_date {
            select_cols.push("CAST(date AS TEXT) AS date".to_string());
        }
        if self.schema.has_topic_id {
            select_cols.push("CAST(topic_id AS INTEGER) AS topic_id".to_string());
        }
        if self.schema.has_topic_title {
            select_cols.push("CAST(topic_title AS TEXT) AS topic_title".to_string());
        }

        let (mut where_parts, binds) = filter_clause(&self.schema, &self.query);
        where_parts.insert(0, "id > ?".to_string());

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id ASC LIMIT ?",
            select_cols.join(", "),
            quote_ident(&self.query.table),
            where_parts.join(" AND ")
        );
        let q = bind_all(sqlx::query(&sql).bind(self.cursor), &binds).bind(page as i64);
        let rows = q.fetch_all(self.pool).await?;

        if (rows.len() as u64) < page {
            self.exhausted = true;
        }

        for row in &rows {
            let id: i64 = row.get("id");
            let text: Option<String> = row.get("text");
            let mut item = Item {
                id,
                text: text.unwrap_or_default(),
                source_id: source_id_for(id),
                date: None,
                topic_id: None,
                topic_title: None,
            };
            if self.schema.has_date {
                item.date = row.get("date");
            }
            if self.schema.has_topic_id {
                item.topic_id = row.get("topic_id");
            }
            if self.schema.has_topic_title {
                item.topic_title = row.get("topic_title");
            }
            self.cursor = id;
            self.buffer.push_back(item);
        }

        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
