//! Statistics gateway.
//!
//! The read-only adapter over the Postgres catalog and query planner. Talks
//! the Postgres wire protocol through `tokio-postgres`, pool-backed and
//! stateless beyond the connection pool itself.

pub mod pool;

use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::plan::{self, PlanMetrics, PlanNode, PlanScan};
use pool::{ConnectionPool, PoolConfig};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to connect to postgres: {0}")]
    Connect(#[source] tokio_postgres::Error),

    #[error("connection pool has been closed")]
    PoolClosed,

    #[error("refusing to plan a non-SELECT statement")]
    NotReadOnly,

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("failed to interpret plan output: {0}")]
    Plan(#[from] plan::PlanError),
}

/// Per-column catalog statistics, with conservative defaults when the
/// catalog has no row for a column (spec: `has_stats = false`, null
/// fraction 0, correlation 0, distinct −1 sentinel).
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnStats {
    pub distinct: f64,
    pub null_fraction: f64,
    pub correlation: f64,
    pub live_rows: i64,
    pub has_stats: bool,
}

impl Default for ColumnStats {
    fn default() -> Self {
        Self {
            distinct: -1.0,
            null_fraction: 0.0,
            correlation: 0.0,
            live_rows: 0,
            has_stats: false,
        }
    }
}

/// An existing index definition, parsed from `pg_indexes.indexdef`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub schema: String,
    pub relation: String,
    pub index_name: String,
    pub columns: Vec<String>,
}

/// One row pulled from `pg_stat_statements`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStat {
    pub query: String,
    pub calls: i64,
    pub mean_time_ms: f64,
    pub total_time_ms: f64,
    pub cache_hit_ratio: f64,
}

/// Full per-table statistics row, beyond the `(writes, reads)` pair the
/// synthesizer needs — kept for callers that want the fuller picture.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStatistics {
    pub relation: String,
    pub live_rows: i64,
    pub dead_rows: i64,
    pub inserts: i64,
    pub updates: i64,
    pub deletes: i64,
    pub sequential_scans: i64,
    pub index_scans: i64,
    pub write_ratio: f64,
}

const ADMIN_PREFIXES: &[&str] = &["SET", "SHOW", "EXPLAIN", "BEGIN", "COMMIT", "ROLLBACK"];

pub struct Gateway {
    pool: ConnectionPool,
    statement_timeout: Duration,
}

impl Gateway {
    pub async fn connect(config: PoolConfig, statement_timeout: Duration) -> Result<Self, GatewayError> {
        let pool = ConnectionPool::connect(config).await?;
        Ok(Self {
            pool,
            statement_timeout,
        })
    }

    /// Produces a structured plan for `sql` without persisting any effect:
    /// the plan is obtained inside a transaction that is always rolled
    /// back, under a per-call statement timeout. Only `SELECT`/`WITH ...
    /// SELECT` is accepted; anything else is rejected before any round-trip.
    pub async fn plan(&self, sql: &str) -> Result<(PlanNode, PlanMetrics, Vec<PlanScan>), GatewayError> {
        if !is_read_only(sql) {
            return Err(GatewayError::NotReadOnly);
        }

        let mut conn = self.pool.acquire().await?;
        let txn = conn.transaction().await?;

        txn.execute(
            &format!(
                "SET LOCAL statement_timeout = {}",
                self.statement_timeout.as_millis()
            ),
            &[],
        )
        .await?;

        let explain_sql = format!("EXPLAIN (ANALYZE, BUFFERS, FORMAT JSON) {}", sql);
        let row = txn.query_one(&explain_sql, &[]).await?;
        let plan_json: serde_json::Value = row.get(0);

        // Always roll back: the plan request must never persist an effect,
        // even for ANALYZE's own side-effect-free read execution.
        txn.rollback().await?;

        let (root, metrics) = plan::parse_explain_json(&plan_json)?;
        let scans = plan::find_scans(&root);
        Ok((root, metrics, scans))
    }

    /// Queries `pg_stats` for `relation.column`. Never returns `Err`;
    /// degrades to the default record on any failure or missing row.
    pub async fn column_stats(&self, relation: &str, column: &str) -> ColumnStats {
        match self.try_column_stats(relation, column).await {
            Ok(Some(stats)) => stats,
            Ok(None) => ColumnStats::default(),
            Err(e) => {
                log::warn!(
                    "catalog lookup failed for {}.{}: {} (degrading to default stats)",
                    relation,
                    column,
                    e
                );
                ColumnStats::default()
            }
        }
    }

    async fn try_column_stats(
        &self,
        relation: &str,
        column: &str,
    ) -> Result<Option<ColumnStats>, GatewayError> {
        let conn = self.pool.acquire().await?;
        let row = conn
            .query_opt(
                "SELECT n_distinct, null_frac, correlation FROM pg_stats \
                 WHERE tablename = $1 AND attname = $2",
                &[&relation, &column],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_distinct: f64 = row.get(0);
        let null_fraction: f64 = row.get(1);
        let correlation: f64 = row.get(2);
        let live_rows = self.row_count(relation).await;

        // pg_stats reports a negative fraction when distinct values scale
        // with table size; convert to an absolute count using live rows.
        let distinct = if raw_distinct < 0.0 {
            (raw_distinct * live_rows as f64).abs()
        } else {
            raw_distinct
        };

        Ok(Some(ColumnStats {
            distinct,
            null_fraction,
            correlation,
            live_rows,
            has_stats: true,
        }))
    }

    /// Returns `pg_stat_user_tables.n_live_tup`, or 0 if unknown.
    pub async fn row_count(&self, relation: &str) -> i64 {
        let result = async {
            let conn = self.pool.acquire().await?;
            let row = conn
                .query_opt(
                    "SELECT n_live_tup FROM pg_stat_user_tables WHERE relname = $1",
                    &[&relation],
                )
                .await?;
            Ok::<_, GatewayError>(row.map(|r| r.get::<_, i64>(0)))
        }
        .await;

        match result {
            Ok(Some(count)) => count,
            Ok(None) => 0,
            Err(e) => {
                log::warn!("row_count lookup failed for {}: {}", relation, e);
                0
            }
        }
    }

    /// Returns already-defined indexes, parsed from `pg_indexes.indexdef`.
    pub async fn existing_indexes(&self, relation: Option<&str>) -> Vec<IndexDef> {
        match self.try_existing_indexes(relation).await {
            Ok(defs) => defs,
            Err(e) => {
                log::warn!("existing_indexes lookup failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_existing_indexes(
        &self,
        relation: Option<&str>,
    ) -> Result<Vec<IndexDef>, GatewayError> {
        let conn = self.pool.acquire().await?;
        let rows = match relation {
            Some(relation) => {
                conn.query(
                    "SELECT schemaname, tablename, indexname, indexdef FROM pg_indexes WHERE tablename = $1",
                    &[&relation],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT schemaname, tablename, indexname, indexdef FROM pg_indexes",
                    &[],
                )
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                let indexdef: String = row.get(3);
                IndexDef {
                    schema: row.get(0),
                    relation: row.get(1),
                    index_name: row.get(2),
                    columns: parse_index_columns(&indexdef),
                }
            })
            .collect())
    }

    /// Returns `(writes, reads)` counters for `relation`: `writes =
    /// inserts + updates + deletes`, `reads = sequential_scans +
    /// index_scans`. Unknown counters are zero.
    pub async fn table_io_counters(&self, relation: &str) -> (i64, i64) {
        match self.table_statistics(relation).await {
            Some(stats) => (
                stats.inserts + stats.updates + stats.deletes,
                stats.sequential_scans + stats.index_scans,
            ),
            None => (0, 0),
        }
    }

    /// Full per-relation statistics row, beyond the io-counter pair.
    pub async fn table_statistics(&self, relation: &str) -> Option<TableStatistics> {
        match self.try_table_statistics(relation).await {
            Ok(stats) => stats,
            Err(e) => {
                log::warn!("table_statistics lookup failed for {}: {}", relation, e);
                None
            }
        }
    }

    async fn try_table_statistics(
        &self,
        relation: &str,
    ) -> Result<Option<TableStatistics>, GatewayError> {
        let conn = self.pool.acquire().await?;
        let row = conn
            .query_opt(
                "SELECT n_live_tup, n_dead_tup, n_tup_ins, n_tup_upd, n_tup_del, \
                        seq_scan, idx_scan \
                 FROM pg_stat_user_tables WHERE relname = $1",
                &[&relation],
            )
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let inserts: i64 = row.get(2);
        let updates: i64 = row.get(3);
        let deletes: i64 = row.get(4);
        let sequential_scans: i64 = row.get(5);
        let index_scans: i64 = row.get(6);

        let writes = inserts + updates + deletes;
        let reads = sequential_scans + index_scans;
        let write_ratio = if writes + reads > 0 {
            writes as f64 / (writes + reads) as f64
        } else {
            0.3
        };

        Ok(Some(TableStatistics {
            relation: relation.to_string(),
            live_rows: row.get(0),
            dead_rows: row.get(1),
            inserts,
            updates,
            deletes,
            sequential_scans,
            index_scans,
            write_ratio,
        }))
    }

    /// Pulls candidate queries from `pg_stat_statements`, excluding
    /// administrative patterns, ordered by total execution time descending.
    pub async fn query_stats(
        &self,
        min_calls: i64,
        min_mean_ms: f64,
        limit: i64,
    ) -> Result<Vec<QueryStat>, GatewayError> {
        let conn = self.pool.acquire().await?;
        let rows = conn
            .query(
                "SELECT query, calls, mean_exec_time, total_exec_time, \
                        shared_blks_hit, shared_blks_read \
                 FROM pg_stat_statements \
                 WHERE calls >= $1 AND mean_exec_time >= $2 \
                 ORDER BY total_exec_time DESC \
                 LIMIT $3",
                &[&min_calls, &min_mean_ms, &limit],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let query: String = row.get(0);
                let hit: i64 = row.get(4);
                let read: i64 = row.get(5);
                let cache_hit_ratio = if hit + read > 0 {
                    hit as f64 / (hit + read) as f64
                } else {
                    1.0
                };
                QueryStat {
                    query,
                    calls: row.get(1),
                    mean_time_ms: row.get(2),
                    total_time_ms: row.get(3),
                    cache_hit_ratio,
                }
            })
            .filter(|stat| !is_admin_pattern(&stat.query))
            .collect())
    }
}

fn is_read_only(sql: &str) -> bool {
    let trimmed = sql.trim_start().to_uppercase();
    trimmed.starts_with("SELECT") || trimmed.starts_with("WITH")
}

fn is_admin_pattern(query: &str) -> bool {
    let trimmed = query.trim_start();
    let upper = trimmed.to_uppercase();
    if ADMIN_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        return true;
    }
    upper.contains("PG_CATALOG") || upper.contains("INFORMATION_SCHEMA")
}

/// Extracts the column list from `CREATE INDEX ... (col1, col2) ...`,
/// splitting on top-level commas between the *matching* parentheses (not
/// just the first `')'`, which would close early on an expression column
/// like `(total::numeric)`) and trimming any type-cast suffix, plus a
/// redundant enclosing paren, from each column.
fn parse_index_columns(indexdef: &str) -> Vec<String> {
    let Some(open) = indexdef.find('(') else {
        return Vec::new();
    };
    let Some(close) = matching_paren(indexdef, open) else {
        return Vec::new();
    };

    let cast_re = Regex::new(r"::\w+(\(\d+\))?$").unwrap();
    split_top_level(&indexdef[open + 1..close])
        .into_iter()
        .map(|c| cast_re.replace(strip_outer_parens(c.trim()), "").trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Finds the index of the `)` that closes the `(` at `open`, tracking
/// nesting depth rather than stopping at the first `)` encountered.
fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Splits on commas that sit at nesting depth zero, so a comma inside a
/// parenthesized expression column doesn't split that column in two.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Strips one layer of enclosing parentheses, if the whole string is
/// wrapped in a single matching pair (as `pg_indexes` renders expression
/// columns, e.g. `(total::numeric)`).
fn strip_outer_parens(s: &str) -> &str {
    if s.starts_with('(') && s.ends_with(')') && matching_paren(s, 0) == Some(s.len() - 1) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
