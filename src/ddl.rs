//! DDL rendering.
//!
//! Turns an [`IndexProposal`](crate::synthesizer::IndexProposal) into the
//! `CREATE INDEX` statement an operator would run. Pure string formatting;
//! no SQL parsing or catalog access.

use crate::synthesizer::{IndexKind, IndexProposal};

/// Generates the canonical index name: `idx_<relation>_<col1_col2_...>`,
/// with `_partial` and/or `_covering` suffixes appended in that order.
pub fn index_name(proposal: &IndexProposal) -> String {
    let mut name = format!(
        "idx_{}_{}",
        proposal.relation,
        proposal.columns.join("_")
    );
    if proposal.partial_predicate.is_some() {
        name.push_str("_partial");
    }
    if !proposal.include_columns.is_empty() {
        name.push_str("_covering");
    }
    name
}

/// Renders the full `CREATE INDEX` statement for a proposal.
pub fn render(proposal: &IndexProposal) -> String {
    let name = index_name(proposal);
    let mut stmt = format!("CREATE INDEX {} ON {}", name, proposal.relation);

    if !matches!(proposal.kind, IndexKind::Btree) {
        stmt.push_str(&format!(" USING {}", proposal.kind.as_sql()));
    }

    stmt.push_str(&format!(" ({})", proposal.columns.join(", ")));

    if !proposal.include_columns.is_empty() {
        stmt.push_str(&format!(" INCLUDE ({})", proposal.include_columns.join(", ")));
    }

    if let Some(predicate) = &proposal.partial_predicate {
        stmt.push_str(&format!(" WHERE {}", predicate));
    }

    stmt.push(';');
    stmt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesizer::IndexProposal;

    fn base_proposal() -> IndexProposal {
        IndexProposal {
            relation: "users".to_string(),
            columns: vec!["email".to_string()],
            kind: IndexKind::Btree,
            partial_predicate: None,
            include_columns: Vec::new(),
            reason: "WHERE filter on users".to_string(),
            improvement: 0.95,
            current_cost: 800.0,
            estimated_cost: 40.0,
            priority: 760,
            warning: None,
        }
    }

    #[test]
    fn simple_index_has_no_suffix() {
        let proposal = base_proposal();
        assert_eq!(index_name(&proposal), "idx_users_email");
        assert_eq!(
            render(&proposal),
            "CREATE INDEX idx_users_email ON users (email);"
        );
    }

    #[test]
    fn partial_index_appends_suffix_and_where_clause() {
        let mut proposal = base_proposal();
        proposal.relation = "orders".to_string();
        proposal.columns = vec!["status".to_string(), "total".to_string()];
        proposal.partial_predicate = Some("status = 'pending'".to_string());
        assert_eq!(index_name(&proposal), "idx_orders_status_total_partial");
        assert_eq!(
            render(&proposal),
            "CREATE INDEX idx_orders_status_total_partial ON orders (status, total) WHERE status = 'pending';"
        );
    }

    #[test]
    fn covering_index_includes_and_suffixes_after_partial() {
        let mut proposal = base_proposal();
        proposal.partial_predicate = Some("email IS NOT NULL".to_string());
        proposal.include_columns = vec!["name".to_string()];
        assert_eq!(index_name(&proposal), "idx_users_email_partial_covering");
        assert!(render(&proposal).contains("INCLUDE (name)"));
    }
}
