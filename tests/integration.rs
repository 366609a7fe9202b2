//! End-to-end exercises of the pure core: parser -> plan -> synthesizer ->
//! ddl, without a live Postgres connection. These drive the pipeline
//! against hand-built plan fixtures the way `EXPLAIN (FORMAT JSON)` would
//! actually shape them.

use index_advisor::ddl;
use index_advisor::parser;
use index_advisor::plan::{self, PlanScan};
use index_advisor::synthesizer::{self, IndexProposal};

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

/// Synthesizes proposals without a gateway round-trip, for tests that only
/// need the pure column-selection/ordering/partial-predicate rules, not the
/// cost model (which needs catalog stats).
fn per_scan_only(sql: &str, scans: &[PlanScan]) -> Vec<IndexProposal> {
    let parsed = parser::parse(sql).unwrap();
    scans
        .iter()
        .filter_map(|s| synthesizer::per_scan_proposal_for_tests(&parsed, s))
        .collect()
}

#[test]
fn equality_filter_on_high_cardinality_column_suggests_a_plain_index() {
    let scans = vec![scan("users", 1, 499_999, 800.0)];
    let proposals = per_scan_only("SELECT * FROM users WHERE email = 'u@x.com'", &scans);
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].relation, "users");
    assert_eq!(proposals[0].columns, vec!["email".to_string()]);
    assert!(proposals[0].partial_predicate.is_none());
    assert_eq!(ddl::index_name(&proposals[0]), "idx_users_email");
}

#[test]
fn mixed_equality_and_range_forms_a_partial_composite_index() {
    let scans = vec![scan("orders", 500, 9500, 1500.0)];
    let proposals = per_scan_only(
        "SELECT * FROM orders WHERE status = 'pending' AND total > 500",
        &scans,
    );
    assert_eq!(proposals.len(), 1);
    assert_eq!(
        proposals[0].columns,
        vec!["status".to_string(), "total".to_string()]
    );
    assert_eq!(
        proposals[0].partial_predicate,
        Some("status = 'pending'".to_string())
    );
    assert!(ddl::index_name(&proposals[0]).ends_with("_partial"));
}

#[test]
fn order_by_only_query_suggests_an_index_on_the_sort_key() {
    let scans = vec![scan("users", 1000, 0, 600.0)];
    let proposals = per_scan_only(
        "SELECT * FROM users ORDER BY created_at DESC LIMIT 10",
        &scans,
    );
    assert_eq!(proposals.len(), 1);
    assert_eq!(proposals[0].columns, vec!["created_at".to_string()]);
    assert!(proposals[0].reason.contains("ORDER BY"));
}

#[test]
fn primary_key_only_lookup_suggests_nothing() {
    let scans = vec![scan("users", 1, 0, 4.0)];
    let proposals = per_scan_only("SELECT * FROM users WHERE id = 42", &scans);
    assert!(proposals.is_empty());
}

#[test]
fn plan_walker_finds_every_seq_scan_across_a_join_in_preorder() {
    let payload = serde_json::json!([{
        "Plan": {
            "Node Type": "Hash Join",
            "Total Cost": 2000.0,
            "Plan Rows": 500,
            "Plans": [
                {
                    "Node Type": "Seq Scan",
                    "Relation Name": "users",
                    "Total Cost": 800.0,
                    "Plan Rows": 1000,
                    "Actual Rows": 950,
                    "Rows Removed by Filter": 50
                },
                {
                    "Node Type": "Hash",
                    "Total Cost": 1200.0,
                    "Plans": [
                        {
                            "Node Type": "Seq Scan",
                            "Relation Name": "orders",
                            "Total Cost": 1100.0,
                            "Plan Rows": 300,
                            "Actual Rows": 280
                        }
                    ]
                }
            ]
        },
        "Execution Time": 20.0
    }]);

    let (root, _) = plan::parse_explain_json(&payload).unwrap();
    let scans = plan::find_scans(&root);
    assert_eq!(scans.len(), 2);
    assert_eq!(scans[0].relation, "users");
    assert_eq!(scans[1].relation, "orders");
}

#[test]
fn ddl_round_trip_preserves_the_column_list() {
    let scans = vec![scan("orders", 500, 9500, 1500.0)];
    let proposals = per_scan_only(
        "SELECT * FROM orders WHERE status = 'pending' AND total > 500",
        &scans,
    );
    let rendered = ddl::render(&proposals[0]);

    // Re-parse the column list out of the rendered DDL the same way the
    // gateway parses `pg_indexes.indexdef`.
    let open = rendered.find('(').unwrap();
    let close = rendered[open..].find(')').unwrap() + open;
    let columns: Vec<&str> = rendered[open + 1..close].split(", ").collect();
    assert_eq!(columns, proposals[0].columns);
}
