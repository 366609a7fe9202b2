//! Execution-plan walker.
//!
//! Consumes the structured JSON produced by `EXPLAIN (ANALYZE, BUFFERS,
//! FORMAT JSON)` and locates full-table-scan nodes by depth-first
//! traversal. Pure: operates only on an already-deserialized plan tree,
//! never touches the network.

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan JSON did not contain a top-level plan array")]
    MalformedPlan,

    #[error("failed to deserialize EXPLAIN output: {0}")]
    Deserialize(#[from] serde_json::Error),
}

const SEQ_SCAN: &str = "Seq Scan";

/// One element of the top-level array `EXPLAIN (FORMAT JSON)` returns.
#[derive(Debug, Deserialize, Clone)]
pub struct RawPlan {
    #[serde(rename = "Plan")]
    pub plan: PlanNode,
    #[serde(rename = "Planning Time")]
    pub planning_time: Option<f64>,
    #[serde(rename = "Execution Time")]
    pub execution_time: Option<f64>,
}

/// A single node of the Postgres plan tree, deserialized field-for-field
/// from the JSON keys `EXPLAIN (FORMAT JSON)` emits.
#[derive(Debug, Deserialize, Clone)]
pub struct PlanNode {
    #[serde(rename = "Node Type")]
    pub node_type: String,
    #[serde(rename = "Relation Name")]
    pub relation_name: Option<String>,
    #[serde(rename = "Alias")]
    pub alias: Option<String>,
    #[serde(rename = "Startup Cost")]
    pub startup_cost: Option<f64>,
    #[serde(rename = "Total Cost")]
    pub total_cost: Option<f64>,
    #[serde(rename = "Plan Rows")]
    pub plan_rows: Option<i64>,
    #[serde(rename = "Actual Startup Time")]
    pub actual_startup_time: Option<f64>,
    #[serde(rename = "Actual Total Time")]
    pub actual_total_time: Option<f64>,
    #[serde(rename = "Actual Rows")]
    pub actual_rows: Option<i64>,
    #[serde(rename = "Actual Loops")]
    pub actual_loops: Option<i64>,
    #[serde(rename = "Rows Removed by Filter")]
    pub rows_removed_by_filter: Option<i64>,
    #[serde(rename = "Filter")]
    pub filter: Option<String>,
    #[serde(rename = "Plans")]
    pub plans: Option<Vec<PlanNode>>,
}

/// A detected full-table scan, emitted in pre-order traversal position.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanScan {
    pub relation: String,
    pub alias: Option<String>,
    pub actual_rows: i64,
    pub rows_removed_by_filter: i64,
    pub cost: f64,
    pub startup_cost: f64,
    pub filter: Option<String>,
    pub node_time_ms: Option<f64>,
}

/// Top-level execution metrics surfaced alongside the detected scans.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanMetrics {
    pub execution_time_ms: Option<f64>,
    pub planning_time_ms: Option<f64>,
    pub total_cost: f64,
    pub node_type: String,
    pub actual_rows: Option<i64>,
}

/// Parses `EXPLAIN (FORMAT JSON)` output (as returned directly by
/// `tokio-postgres`'s JSON support) into a root plan node plus metrics.
pub fn parse_explain_json(value: &serde_json::Value) -> Result<(PlanNode, PlanMetrics), PlanError> {
    let plans: Vec<RawPlan> = serde_json::from_value(value.clone())?;
    let raw = plans.into_iter().next().ok_or(PlanError::MalformedPlan)?;
    let metrics = PlanMetrics {
        execution_time_ms: raw.execution_time.or(raw.plan.actual_total_time),
        planning_time_ms: raw.planning_time,
        total_cost: raw.plan.total_cost.unwrap_or(0.0),
        node_type: raw.plan.node_type.clone(),
        actual_rows: raw.plan.actual_rows,
    };
    Ok((raw.plan, metrics))
}

/// Depth-first-walks the plan tree, emitting a [`PlanScan`] for every
/// `Seq Scan` node encountered, in pre-order.
pub fn find_scans(root: &PlanNode) -> Vec<PlanScan> {
    let mut scans = Vec::new();
    walk(root, &mut scans);
    scans
}

fn walk(node: &PlanNode, scans: &mut Vec<PlanScan>) {
    if node.node_type == SEQ_SCAN {
        scans.push(PlanScan {
            relation: node
                .relation_name
                .clone()
                .unwrap_or_else(|| "<unknown>".to_string()),
            alias: node.alias.clone(),
            actual_rows: node.actual_rows.unwrap_or(0),
            rows_removed_by_filter: node.rows_removed_by_filter.unwrap_or(0),
            cost: node.total_cost.unwrap_or(0.0),
            startup_cost: node.startup_cost.unwrap_or(0.0),
            filter: node.filter.clone(),
            node_time_ms: node.actual_total_time,
        });
    }

    if let Some(children) = &node.plans {
        for child in children {
            walk(child, scans);
        }
    }
}
