//! Recommendation synthesizer.
//!
//! Merges a [`ParsedQuery`](crate::parser::ParsedQuery) and the
//! [`PlanScan`](crate::plan::PlanScan)s found for the same query into zero
//! or more [`IndexProposal`]s, applying the cost model and the
//! over-indexing check. Pure arithmetic over already-gathered data plus one
//! catalog round-trip per retained proposal (the over-indexing check).

use std::collections::{HashMap, HashSet};

use crate::gateway::{ColumnStats, Gateway, IndexDef};
use crate::parser::{ColumnRole, ParsedQuery, PredicateClass};
use crate::plan::PlanScan;

/// Index access method. `Gin`/`Gist` are threaded through the model but
/// never selected by the synthesizer itself — every emitted proposal is
/// `Btree` today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Btree,
    Gin,
    Gist,
}

impl IndexKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IndexKind::Btree => "btree",
            IndexKind::Gin => "gin",
            IndexKind::Gist => "gist",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexProposal {
    pub relation: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub partial_predicate: Option<String>,
    pub include_columns: Vec<String>,
    pub reason: String,
    pub improvement: f64,
    pub current_cost: f64,
    pub estimated_cost: f64,
    pub priority: i64,
    pub warning: Option<String>,
}

impl IndexProposal {
    /// `(relation, sorted(columns), partial_predicate, include_columns)` —
    /// the identity used for deduplication within a query and across a
    /// batch.
    pub fn identity_key(&self) -> (String, Vec<String>, Option<String>, Vec<String>) {
        let mut columns = self.columns.clone();
        columns.sort();
        (
            self.relation.clone(),
            columns,
            self.partial_predicate.clone(),
            self.include_columns.clone(),
        )
    }
}

/// Synthesizes proposals for every scan detected in one query, against the
/// parsed query's extracted column intent.
pub async fn synthesize(
    parsed: &ParsedQuery,
    scans: &[PlanScan],
    gateway: &Gateway,
) -> Vec<IndexProposal> {
    let mut proposals = Vec::new();

    for scan in scans {
        if let Some(proposal) = per_scan_proposal(parsed, scan) {
            proposals.push(proposal);
        }
    }

    proposals.extend(join_driven_proposals(parsed));

    for proposal in &mut proposals {
        apply_cost_model(proposal, parsed, scans, gateway).await;
    }

    let mut deduped = dedupe_keep_highest_priority(proposals);
    deduped.sort_by(|a, b| b.priority.cmp(&a.priority));

    annotate_over_indexing(&mut deduped, gateway).await;

    deduped
}

/// Column selection, partial predicate, column ordering, and proposal
/// emission for a single scan.
fn per_scan_proposal(parsed: &ParsedQuery, scan: &PlanScan) -> Option<IndexProposal> {
    let single_table = parsed.tables.len() == 1;

    let mut selected: Vec<String> = parsed
        .where_columns
        .iter()
        .filter(|c| {
            parsed
                .column_table
                .get(&(ColumnRole::Where, (*c).clone()))
                .map(|r| r == &scan.relation)
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    if selected.is_empty() && single_table {
        selected = parsed.where_columns.iter().cloned().collect();
    }

    let (constant_columns, index_columns): (Vec<String>, Vec<String>) = selected
        .iter()
        .cloned()
        .partition(|c| parsed.constant_filters.contains_key(c));

    if !index_columns.is_empty() {
        // A composite index still leads with the constant-filter columns
        // (they sort first as equality predicates); the partial predicate
        // narrows the index to exactly the rows the constant filter admits.
        let all_columns: Vec<String> = constant_columns
            .iter()
            .chain(index_columns.iter())
            .cloned()
            .collect();
        let ordered = order_columns(parsed, &all_columns);
        let partial_predicate = Some(render_partial_predicate(parsed, &constant_columns));
        return Some(IndexProposal {
            relation: scan.relation.clone(),
            columns: ordered,
            kind: IndexKind::Btree,
            partial_predicate,
            include_columns: Vec::new(),
            reason: format!("WHERE filter on {}", scan.relation),
            improvement: 0.0,
            current_cost: scan.cost,
            estimated_cost: 0.0,
            priority: 0,
            warning: None,
        });
    }

    if !constant_columns.is_empty() {
        // Every selected column is a constant-equality filter. A plain
        // index on those columns serves the filter exactly as well as a
        // partial one would, so no partial predicate is attached. The
        // presumed-primary-key column is dropped, same as the join-driven
        // path; if nothing is left the proposal is suppressed entirely.
        let without_id: Vec<String> = constant_columns
            .into_iter()
            .filter(|c| c != "id")
            .collect();
        if without_id.is_empty() {
            return None;
        }
        let ordered = order_columns(parsed, &without_id);
        return Some(IndexProposal {
            relation: scan.relation.clone(),
            columns: ordered,
            kind: IndexKind::Btree,
            partial_predicate: None,
            include_columns: Vec::new(),
            reason: format!("WHERE filter on {}", scan.relation),
            improvement: 0.0,
            current_cost: scan.cost,
            estimated_cost: 0.0,
            priority: 0,
            warning: None,
        });
    }

    if selected.is_empty() {
        let order_by_for_relation: Vec<String> = parsed
            .order_by_columns
            .iter()
            .filter(|c| {
                single_table
                    || parsed
                        .column_table
                        .get(&(ColumnRole::OrderBy, (*c).clone()))
                        .map(|r| r == &scan.relation)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();

        if !order_by_for_relation.is_empty() {
            return Some(IndexProposal {
                relation: scan.relation.clone(),
                columns: order_by_for_relation,
                kind: IndexKind::Btree,
                partial_predicate: None,
                include_columns: Vec::new(),
                reason: format!("ORDER BY on {}", scan.relation),
                improvement: 0.0,
                current_cost: scan.cost,
                estimated_cost: 0.0,
                priority: 0,
                warning: None,
            });
        }
    }

    // No WHERE columns for this relation and no usable ORDER BY columns.
    None
}

fn render_partial_predicate(parsed: &ParsedQuery, columns: &[String]) -> String {
    columns
        .iter()
        .filter_map(|c| parsed.constant_filters.get(c).map(|lit| format!("{} = {}", c, lit)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Equality first, then range, then other; stable within class. Appends
/// any `ORDER BY` columns not already present.
fn order_columns(parsed: &ParsedQuery, columns: &[String]) -> Vec<String> {
    if columns.len() <= 1 {
        // Single-column indexes skip the ordering step entirely, including
        // the ORDER BY append.
        return columns.to_vec();
    }

    let rank = |c: &str| match parsed.predicate_types.get(c) {
        Some(PredicateClass::Equality) => 0,
        Some(PredicateClass::Range) => 1,
        Some(PredicateClass::Other) | None => 2,
    };

    let mut indexed: Vec<(usize, &String)> = columns.iter().enumerate().collect();
    indexed.sort_by_key(|(i, c)| (rank(c), *i));
    let mut result: Vec<String> = indexed.into_iter().map(|(_, c)| c.clone()).collect();

    append_missing_order_by(parsed, &mut result);
    result
}

fn append_missing_order_by(parsed: &ParsedQuery, columns: &mut Vec<String>) {
    let present: HashSet<&String> = columns.iter().collect();
    for c in &parsed.order_by_columns {
        if !present.contains(c) {
            columns.push(c.clone());
        }
    }
}

/// For each `(column, relation)` join mapping, skip `id` (presumed primary
/// key), group by relation, one proposal per relation with priority fixed
/// to 2.
fn join_driven_proposals(parsed: &ParsedQuery) -> Vec<IndexProposal> {
    let mut by_relation: HashMap<String, Vec<String>> = HashMap::new();

    for column in &parsed.join_columns {
        if column == "id" {
            continue;
        }
        if let Some(relation) = parsed
            .column_table
            .get(&(ColumnRole::Join, column.clone()))
        {
            by_relation
                .entry(relation.clone())
                .or_default()
                .push(column.clone());
        }
    }

    let mut relations: Vec<&String> = by_relation.keys().collect();
    relations.sort();

    relations
        .into_iter()
        .map(|relation| {
            let columns = by_relation.get(relation).unwrap().clone();
            IndexProposal {
                relation: relation.clone(),
                columns,
                kind: IndexKind::Btree,
                partial_predicate: None,
                include_columns: Vec::new(),
                reason: format!("JOIN condition on {}", relation),
                improvement: 0.0,
                current_cost: 0.0,
                estimated_cost: 0.0,
                priority: 2,
                warning: None,
            }
        })
        .collect()
}

/// The cost model, applied in place to every proposal that came out of
/// per-scan / join-driven emission. Join-driven proposals keep their fixed
/// priority of 2 and are left untouched (no scan/cost data to model
/// against).
async fn apply_cost_model(
    proposal: &mut IndexProposal,
    parsed: &ParsedQuery,
    scans: &[PlanScan],
    gateway: &Gateway,
) {
    if proposal.priority == 2 && proposal.current_cost == 0.0 {
        // join-driven proposal: no scan to derive a selectivity estimate from.
        let _ = parsed;
        return;
    }

    let scan = scans.iter().find(|s| s.relation == proposal.relation);
    let leading_column = proposal.columns.first().cloned();

    let plan_selectivity = match scan {
        Some(scan) => {
            let scanned = scan.actual_rows + scan.rows_removed_by_filter;
            1.0 - (scan.rows_removed_by_filter as f64 / scanned.max(1) as f64)
        }
        None => 0.1,
    };

    let catalog_stats: Option<ColumnStats> = match &leading_column {
        Some(column) => Some(gateway.column_stats(&proposal.relation, column).await),
        None => None,
    };

    let catalog_selectivity = catalog_stats
        .as_ref()
        .filter(|s| s.has_stats && s.distinct > 0.0)
        .map(|s| (1.0 / s.distinct) * (1.0 - s.null_fraction));

    let mut selectivity = match catalog_selectivity {
        Some(catalog) => 0.6 * plan_selectivity + 0.4 * catalog,
        None => plan_selectivity,
    };
    selectivity = selectivity.clamp(0.001, 1.0);

    if proposal.partial_predicate.is_some() {
        selectivity *= 0.8;
    }

    let mut improvement = improvement_step(selectivity);

    let correlation = catalog_stats.as_ref().map(|s| s.correlation).unwrap_or(0.0);
    improvement *= 1.0 - 0.15 * correlation.abs();
    improvement = improvement.clamp(0.05, 0.98);

    if !proposal.include_columns.is_empty() {
        improvement = (improvement * 1.15).min(0.98);
    }

    let current_cost = if let Some(scan) = scan {
        scan.cost
    } else {
        proposal.current_cost
    };

    proposal.improvement = improvement;
    proposal.current_cost = current_cost;
    proposal.estimated_cost = current_cost * (1.0 - improvement);
    proposal.priority = (current_cost * improvement).floor() as i64;
}

fn improvement_step(selectivity: f64) -> f64 {
    if selectivity < 0.001 {
        0.98
    } else if selectivity < 0.01 {
        0.95
    } else if selectivity < 0.05 {
        0.85
    } else if selectivity < 0.1 {
        0.70
    } else if selectivity < 0.2 {
        0.50
    } else {
        0.20
    }
}

/// Deduplicates by identity key, retaining the highest-priority proposal
/// for each key.
fn dedupe_keep_highest_priority(proposals: Vec<IndexProposal>) -> Vec<IndexProposal> {
    let mut best: HashMap<(String, Vec<String>, Option<String>, Vec<String>), IndexProposal> =
        HashMap::new();

    for proposal in proposals {
        let key = proposal.identity_key();
        match best.get(&key) {
            Some(existing) if existing.priority >= proposal.priority => {}
            _ => {
                best.insert(key, proposal);
            }
        }
    }

    best.into_values().collect()
}

/// Annotates each retained proposal with an over-indexing warning. The
/// existing-index counter increments between sibling proposals on the same
/// relation within this synthesis pass.
async fn annotate_over_indexing(proposals: &mut [IndexProposal], gateway: &Gateway) {
    let mut seen_counts: HashMap<String, i64> = HashMap::new();

    for proposal in proposals.iter_mut() {
        let existing: Vec<IndexDef> = gateway.existing_indexes(Some(&proposal.relation)).await;
        let base_count = existing.len() as i64;
        let (writes, reads) = gateway.table_io_counters(&proposal.relation).await;
        let write_ratio = if writes + reads > 0 {
            writes as f64 / (writes + reads) as f64
        } else {
            0.3
        };

        let bumped = seen_counts.entry(proposal.relation.clone()).or_insert(0);
        let existing_count = base_count + *bumped;
        *bumped += 1;

        let mut warnings = Vec::new();
        if existing_count >= 5 {
            warnings.push(format!(
                "{} already has {} indexes",
                proposal.relation, existing_count
            ));
        }
        if write_ratio > 0.5 && (existing_count + 1) as f64 * 0.15 > 0.30 {
            warnings.push(format!(
                "{} is write-heavy (write ratio {:.2}); an additional index adds write overhead",
                proposal.relation, write_ratio
            ));
        }

        if !warnings.is_empty() {
            proposal.warning = Some(warnings.join("; "));
        }
    }
}

/// Exposes the per-scan proposal step for integration tests that want to
/// exercise column selection without standing up a [`Gateway`].
#[doc(hidden)]
pub fn per_scan_proposal_for_tests(parsed: &ParsedQuery, scan: &PlanScan) -> Option<IndexProposal> {
    per_scan_proposal(parsed, scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::plan::PlanScan;
    use test_case::test_case;

    fn scan(relation: &str, actual_rows: i64, removed: i64, cost: f64) -> PlanScan {
        PlanScan {
            relation: relation.to_string(),
            alias: None,
            actual_rows,
            rows_removed_by_filter: removed,
            cost,
            startup_cost: 0.0,
            filter: None,
            node_time_ms: None,
        }
    }

    #[test]
    fn equality_before_range_in_composite_index() {
        let parsed =
            parse("SELECT * FROM orders WHERE status = 'pending' AND total > 500").unwrap();
        let s = scan("orders", 100, 900, 1000.0);
        let proposal = per_scan_proposal(&parsed, &s).expect("expected a proposal");
        assert_eq!(proposal.columns, vec!["status".to_string(), "total".to_string()]);
        assert_eq!(
            proposal.partial_predicate,
            Some("status = 'pending'".to_string())
        );
    }

    #[test]
    fn pure_constant_filter_without_index_columns_is_suppressed() {
        let parsed = parse("SELECT * FROM users WHERE id = 42").unwrap();
        let s = scan("users", 1, 0, 5.0);
        assert!(per_scan_proposal(&parsed, &s).is_none());
    }

    #[test]
    fn sole_non_id_constant_filter_still_gets_a_plain_index() {
        let parsed = parse("SELECT * FROM users WHERE email = 'u@x.com'").unwrap();
        let s = scan("users", 1, 499_999, 800.0);
        let proposal = per_scan_proposal(&parsed, &s).expect("expected a proposal");
        assert_eq!(proposal.columns, vec!["email".to_string()]);
        assert!(proposal.partial_predicate.is_none());
    }

    #[test]
    fn order_by_only_proposal_when_where_is_empty() {
        let parsed = parse("SELECT * FROM users ORDER BY created_at DESC").unwrap();
        let s = scan("users", 1000, 0, 500.0);
        let proposal = per_scan_proposal(&parsed, &s).unwrap();
        assert_eq!(proposal.columns, vec!["created_at".to_string()]);
        assert!(proposal.reason.contains("ORDER BY"));
    }

    #[test]
    fn order_by_only_proposal_preserves_clause_sequence() {
        // Column order must satisfy the actual sort: an index on
        // (first_name, last_name) would not serve `ORDER BY last_name,
        // first_name` at all.
        let parsed = parse("SELECT * FROM t ORDER BY last_name, first_name").unwrap();
        let s = scan("t", 1000, 0, 500.0);
        let proposal = per_scan_proposal(&parsed, &s).unwrap();
        assert_eq!(
            proposal.columns,
            vec!["last_name".to_string(), "first_name".to_string()]
        );
    }

    #[test]
    fn composite_where_index_leading_column_is_deterministic_across_runs() {
        // Both `a` and `b` are equality predicates, so `order_columns`'s
        // stable sort falls back to traversal order; it must not depend on
        // HashSet iteration, which is randomized per process.
        let parsed = parse("SELECT * FROM t WHERE b = 2 AND a = 1").unwrap();
        let s = scan("t", 1, 999, 1000.0);
        let proposal = per_scan_proposal(&parsed, &s).unwrap();
        assert_eq!(proposal.columns, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn join_proposal_excludes_id_and_fixes_priority() {
        let parsed = parse(
            "SELECT u.name, o.total FROM users u JOIN orders o ON u.id = o.user_id WHERE o.status = 'completed'",
        )
        .unwrap();
        let proposals = join_driven_proposals(&parsed);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].relation, "orders");
        assert_eq!(proposals[0].columns, vec!["user_id".to_string()]);
        assert_eq!(proposals[0].priority, 2);
    }

    #[test_case(0.0005 => 0.98; "below 0.001")]
    #[test_case(0.005 => 0.95; "below 0.01")]
    #[test_case(0.03 => 0.85; "below 0.05")]
    #[test_case(0.08 => 0.70; "below 0.1")]
    #[test_case(0.15 => 0.50; "below 0.2")]
    #[test_case(0.9 => 0.20; "else")]
    fn improvement_step_matches_thresholds(selectivity: f64) -> f64 {
        improvement_step(selectivity)
    }

    #[test]
    fn dedupe_keeps_highest_priority() {
        let a = IndexProposal {
            relation: "users".to_string(),
            columns: vec!["email".to_string()],
            kind: IndexKind::Btree,
            partial_predicate: None,
            include_columns: Vec::new(),
            reason: "a".to_string(),
            improvement: 0.9,
            current_cost: 100.0,
            estimated_cost: 10.0,
            priority: 50,
            warning: None,
        };
        let mut b = a.clone();
        b.priority = 90;
        b.reason = "b".to_string();

        let deduped = dedupe_keep_highest_priority(vec![a, b]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].priority, 90);
    }
}
