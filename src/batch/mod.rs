//! Batch analyzer.
//!
//! Drives the per-query pipeline (placeholder rewrite -> plan -> AST walk
//! -> synthesize) across a list of SQL strings with a bounded worker pool,
//! then reduces the per-query proposals into one aggregate report. A
//! `Semaphore` caps in-flight workers; a `JoinSet` collects results as they
//! complete.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::gateway::{Gateway, GatewayError, QueryStat};
use crate::parser::{self, ParserError};
use crate::plan::PlanScan;
use crate::synthesizer::{self, IndexProposal};

/// Truncation length for a failed query's text in a failure record.
const TRUNCATED_QUERY_LEN: usize = 200;

/// Default bounded worker count.
pub const DEFAULT_WORKERS: usize = 10;

/// Top-level error aggregation for the batch/report boundary.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] ParserError),

    #[error("plan unavailable: {0}")]
    PlanUnavailable(#[from] GatewayError),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("analysis failed: {0}")]
    AnalysisFailure(String),
}

/// The outcome of analyzing a single query.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub query: String,
    pub scans: Vec<PlanScan>,
    pub proposals: Vec<IndexProposal>,
    pub execution_time_ms: Option<f64>,
    pub cache_hit_ratio: Option<f64>,
    pub error: Option<String>,
}

/// A per-relation rollup of the proposals touching it.
#[derive(Debug, Clone, Default)]
pub struct RelationSummary {
    pub proposal_count: usize,
    pub total_current_cost: f64,
    pub total_estimated_cost: f64,
}

/// The aggregate result of analyzing a batch of queries.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub analyzed_queries: usize,
    pub failed_queries: usize,
    pub relations: HashMap<String, RelationSummary>,
    pub top_proposals: Vec<IndexProposal>,
    pub total_current_cost: f64,
    pub total_estimated_cost: f64,
    pub estimated_improvement_pct: f64,
    pub failures: Vec<(String, String)>,
    /// Stamped by the caller after `analyse`/`analyse_from_query_stats`
    /// returns; left `None` by `aggregate` itself so the reduction stays
    /// pure and independent of wall-clock time.
    pub generated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl BatchReport {
    /// A human-readable one-paragraph summary of the report.
    pub fn get_summary(&self) -> String {
        let stamp = self
            .generated_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unstamped".to_string());
        format!(
            "[{}] analyzed {} queries ({} failed) touching {} relations: {} proposals \
             (top {}), estimated cost {:.1} -> {:.1} ({:.1}% improvement)",
            stamp,
            self.analyzed_queries,
            self.failed_queries,
            self.relations.len(),
            self.relations.values().map(|r| r.proposal_count).sum::<usize>(),
            self.top_proposals.len(),
            self.total_current_cost,
            self.total_estimated_cost,
            self.estimated_improvement_pct,
        )
    }
}

/// Replaces positional placeholders (`$1`, `$2`, ...) with syntactically
/// valid literals so the query can be planned. The rewrite is never
/// persisted; it exists only for the duration of the plan request. Kept as
/// a standalone function since both single-query and batch analysis call
/// it before planning.
pub fn rewrite_placeholders(sql: &str) -> String {
    let re = Regex::new(r"\$\d+").unwrap();
    re.replace_all(sql, "1").to_string()
}

/// Carries each `pg_stat_statements` row's `cache_hit_ratio` alongside its
/// query text, so [`BatchAnalyzer::analyse_from_query_stats`] doesn't have
/// to discard it the way a bare `Vec<String>` would.
fn query_stats_to_pairs(stats: Vec<QueryStat>) -> Vec<(String, Option<f64>)> {
    stats
        .into_iter()
        .map(|s| (s.query, Some(s.cache_hit_ratio)))
        .collect()
}

pub struct BatchAnalyzer {
    gateway: Arc<Gateway>,
    workers: usize,
}

impl BatchAnalyzer {
    pub fn new(gateway: Arc<Gateway>, workers: usize) -> Self {
        Self { gateway, workers }
    }

    /// Analyzes a single query end-to-end: rewrite, plan, parse,
    /// synthesize. Surfaces `InvalidQuery` directly rather than capturing
    /// it, unlike batch analysis which records every failure per-query.
    /// `cache_hit_ratio` is `None` here since a bare query string carries no
    /// `pg_stat_statements` row to source it from; [`Self::analyse_from_query_stats`]
    /// threads the real ratio through instead.
    pub async fn analyse_one(&self, query: &str) -> Result<AnalysisResult, AdvisorError> {
        self.analyse_one_with_cache_hit_ratio(query, None).await
    }

    async fn analyse_one_with_cache_hit_ratio(
        &self,
        query: &str,
        cache_hit_ratio: Option<f64>,
    ) -> Result<AnalysisResult, AdvisorError> {
        let rewritten = rewrite_placeholders(query);
        let parsed = parser::parse(&rewritten)?;
        let (_, metrics, scans) = self.gateway.plan(&rewritten).await?;
        let proposals = synthesizer::synthesize(&parsed, &scans, &self.gateway).await;

        Ok(AnalysisResult {
            query: query.to_string(),
            scans,
            proposals,
            execution_time_ms: metrics.execution_time_ms,
            cache_hit_ratio,
            error: None,
        })
    }

    /// Runs the pipeline across `queries` with up to `self.workers`
    /// concurrent in-flight workers, invoking `progress_cb(completed,
    /// total)` under a mutex after each completion, and reduces the
    /// per-query results into a [`BatchReport`].
    pub async fn analyse<F>(&self, queries: Vec<String>, progress_cb: Option<F>) -> BatchReport
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let queries = queries.into_iter().map(|q| (q, None)).collect();
        self.analyse_with_cache_hit_ratios(queries, progress_cb).await
    }

    /// Same as [`Self::analyse`], but each query carries the
    /// `cache_hit_ratio` already known for it (from `pg_stat_statements`),
    /// which is threaded onto the corresponding [`AnalysisResult`] instead
    /// of being dropped on the floor.
    async fn analyse_with_cache_hit_ratios<F>(
        &self,
        queries: Vec<(String, Option<f64>)>,
        progress_cb: Option<F>,
    ) -> BatchReport
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let total = queries.len();
        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));
        let completed = Arc::new(Mutex::new(0usize));
        let progress_cb = progress_cb.map(Arc::new);

        let mut join_set = JoinSet::new();

        for (query, cache_hit_ratio) in queries {
            let gateway = self.gateway.clone();
            let permit = semaphore.clone();
            let completed = completed.clone();
            let progress_cb = progress_cb.clone();

            join_set.spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                let analyzer = BatchAnalyzer {
                    gateway,
                    workers: 1,
                };
                let result = analyzer
                    .run_one_capturing_errors(&query, cache_hit_ratio)
                    .await;

                let mut completed_guard = completed.lock().await;
                *completed_guard += 1;
                if let Some(cb) = &progress_cb {
                    cb(*completed_guard, total);
                }
                drop(completed_guard);

                result
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => log::error!("worker task panicked: {}", e),
            }
        }

        aggregate(results)
    }

    /// Identical to [`Self::analyse_one_with_cache_hit_ratio`] but captures
    /// every error kind into `AnalysisResult.error` instead of propagating,
    /// so one bad query never aborts the rest of the batch.
    async fn run_one_capturing_errors(
        &self,
        query: &str,
        cache_hit_ratio: Option<f64>,
    ) -> AnalysisResult {
        match self.analyse_one_with_cache_hit_ratio(query, cache_hit_ratio).await {
            Ok(result) => result,
            Err(e) => AnalysisResult {
                query: query.to_string(),
                scans: Vec::new(),
                proposals: Vec::new(),
                execution_time_ms: None,
                cache_hit_ratio,
                error: Some(e.to_string()),
            },
        }
    }

    /// Pulls candidate queries from `pg_stat_statements` and runs them
    /// through the same bounded-concurrency pipeline as [`Self::analyse`],
    /// carrying each query's `cache_hit_ratio` through to its result.
    pub async fn analyse_from_query_stats<F>(
        &self,
        min_calls: i64,
        min_mean_ms: f64,
        limit: i64,
        progress_cb: Option<F>,
    ) -> Result<BatchReport, AdvisorError>
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let stats = self
            .gateway
            .query_stats(min_calls, min_mean_ms, limit)
            .await?;
        Ok(self
            .analyse_with_cache_hit_ratios(query_stats_to_pairs(stats), progress_cb)
            .await)
    }
}

/// Reduces per-query results into a [`BatchReport`]: dedup proposals by
/// identity key keeping the highest priority, group by relation, compute
/// totals, record up to 20 top proposals, and truncate failing queries to
/// 200 chars.
fn aggregate(results: Vec<AnalysisResult>) -> BatchReport {
    let mut report = BatchReport::default();
    let mut best: HashMap<_, IndexProposal> = HashMap::new();

    for result in &results {
        if let Some(error) = &result.error {
            report.failed_queries += 1;
            let truncated: String = result.query.chars().take(TRUNCATED_QUERY_LEN).collect();
            report.failures.push((truncated, error.clone()));
            continue;
        }

        report.analyzed_queries += 1;

        for proposal in &result.proposals {
            let key = proposal.identity_key();
            match best.get(&key) {
                Some(existing) if existing.priority >= proposal.priority => {}
                _ => {
                    best.insert(key, proposal.clone());
                }
            }
        }
    }

    let mut all_proposals: Vec<IndexProposal> = best.into_values().collect();
    all_proposals.sort_by(|a, b| b.priority.cmp(&a.priority));

    for proposal in &all_proposals {
        let summary = report.relations.entry(proposal.relation.clone()).or_default();
        summary.proposal_count += 1;
        summary.total_current_cost += proposal.current_cost;
        summary.total_estimated_cost += proposal.estimated_cost;

        report.total_current_cost += proposal.current_cost;
        report.total_estimated_cost += proposal.estimated_cost;
    }

    report.estimated_improvement_pct = if report.total_current_cost > 0.0 {
        let pct = (report.total_current_cost - report.total_estimated_cost)
            / report.total_current_cost
            * 100.0;
        pct.max(0.0)
    } else {
        0.0
    };

    report.top_proposals = all_proposals.into_iter().take(20).collect();
    report
}

/// Given a final proposal list, drops any proposal whose full column set
/// (case-insensitive) is already entirely covered by an existing index on
/// the same relation.
pub fn drop_already_covered(
    proposals: Vec<IndexProposal>,
    existing_by_relation: &HashMap<String, Vec<Vec<String>>>,
) -> Vec<IndexProposal> {
    proposals
        .into_iter()
        .filter(|proposal| {
            let Some(existing_sets) = existing_by_relation.get(&proposal.relation) else {
                return true;
            };
            let wanted: Vec<String> = proposal.columns.iter().map(|c| c.to_lowercase()).collect();
            !existing_sets.iter().any(|existing| {
                let existing_lower: Vec<String> =
                    existing.iter().map(|c| c.to_lowercase()).collect();
                wanted.iter().all(|c| existing_lower.contains(c))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesizer::IndexKind;

    fn proposal(relation: &str, columns: &[&str], priority: i64) -> IndexProposal {
        IndexProposal {
            relation: relation.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind: IndexKind::Btree,
            partial_predicate: None,
            include_columns: Vec::new(),
            reason: "test".to_string(),
            improvement: 0.9,
            current_cost: 100.0,
            estimated_cost: 10.0,
            priority,
            warning: None,
        }
    }

    #[test]
    fn query_stats_to_pairs_carries_cache_hit_ratio_through() {
        let stats = vec![
            QueryStat {
                query: "SELECT 1".to_string(),
                calls: 10,
                mean_time_ms: 5.0,
                total_time_ms: 50.0,
                cache_hit_ratio: 0.92,
            },
            QueryStat {
                query: "SELECT 2".to_string(),
                calls: 3,
                mean_time_ms: 1.0,
                total_time_ms: 3.0,
                cache_hit_ratio: 0.0,
            },
        ];

        let pairs = query_stats_to_pairs(stats);
        assert_eq!(
            pairs,
            vec![
                ("SELECT 1".to_string(), Some(0.92)),
                ("SELECT 2".to_string(), Some(0.0)),
            ]
        );
    }

    #[test]
    fn rewrite_placeholders_substitutes_every_distinct_marker() {
        let rewritten = rewrite_placeholders("SELECT * FROM t WHERE x = $1 AND y = $2");
        assert!(!rewritten.contains('$'));
        assert!(rewritten.contains("x = 1"));
        assert!(rewritten.contains("y = 1"));
    }

    #[test]
    fn aggregate_dedupes_across_queries_keeping_highest_priority() {
        let a = AnalysisResult {
            query: "q1".to_string(),
            scans: Vec::new(),
            proposals: vec![proposal("users", &["email"], 40)],
            execution_time_ms: None,
            cache_hit_ratio: None,
            error: None,
        };
        let b = AnalysisResult {
            query: "q2".to_string(),
            scans: Vec::new(),
            proposals: vec![proposal("users", &["email"], 90)],
            execution_time_ms: None,
            cache_hit_ratio: None,
            error: None,
        };

        let report = aggregate(vec![a, b]);
        assert_eq!(report.top_proposals.len(), 1);
        assert_eq!(report.top_proposals[0].priority, 90);
        assert_eq!(report.analyzed_queries, 2);
    }

    #[test]
    fn aggregate_truncates_failing_query_and_counts_failure() {
        let long_query = "x".repeat(400);
        let result = AnalysisResult {
            query: long_query,
            scans: Vec::new(),
            proposals: Vec::new(),
            execution_time_ms: None,
            cache_hit_ratio: None,
            error: Some("plan unavailable".to_string()),
        };

        let report = aggregate(vec![result]);
        assert_eq!(report.failed_queries, 1);
        assert_eq!(report.failures[0].0.len(), TRUNCATED_QUERY_LEN);
        assert_eq!(report.failures[0].1, "plan unavailable");
    }

    #[test]
    fn top_proposals_capped_at_twenty() {
        let results: Vec<AnalysisResult> = (0..30)
            .map(|i| AnalysisResult {
                query: format!("q{}", i),
                scans: Vec::new(),
                proposals: vec![proposal(&format!("t{}", i), &["c"], i)],
                execution_time_ms: None,
                cache_hit_ratio: None,
                error: None,
            })
            .collect();

        let report = aggregate(results);
        assert_eq!(report.top_proposals.len(), 20);
        assert_eq!(report.top_proposals[0].priority, 29);
    }

    #[test]
    fn drop_already_covered_filters_case_insensitively() {
        let proposals = vec![proposal("users", &["Email"], 50)];
        let mut existing = HashMap::new();
        existing.insert("users".to_string(), vec![vec!["email".to_string()]]);
        let result = drop_already_covered(proposals, &existing);
        assert!(result.is_empty());
    }
}
