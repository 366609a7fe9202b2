//! SQL AST walker.
//!
//! Resolves table aliases, classifies predicates (equality / range / other)
//! and maps every referenced column to the relation it scans. Pure: no I/O,
//! no network, no catalog access. The only external collaborator is the
//! `sqlparser` crate, which turns a SQL string into an AST this module then
//! walks with a finite set of tagged matches.

use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, OrderByKind, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParserError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("unable to parse SQL: {0}")]
    SyntaxError(String),

    #[error("expected a single SELECT statement, found {0}")]
    UnsupportedStatement(String),

    #[error("unsupported query shape: {0}")]
    UnsupportedQueryShape(String),
}

/// Which predicate class dominates a column reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateClass {
    Equality,
    Range,
    Other,
}

/// The role a column reference plays, used as part of `column_table`'s key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnRole {
    Where,
    OrderBy,
    Join,
}

/// A column set that remembers first-seen traversal order. `HashSet`'s
/// iteration order is randomized per process, which would make the
/// synthesizer's column ordering (and therefore its catalog lookups and
/// priorities) nondeterministic across runs; this keeps membership-test
/// cost at `HashSet` speed while iterating in the order columns were
/// actually encountered in the AST.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedColumnSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl OrderedColumnSet {
    fn insert(&mut self, column: String) {
        if self.seen.insert(column.clone()) {
            self.order.push(column);
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.seen.contains(column)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.order.iter()
    }
}

impl<'a> IntoIterator for &'a OrderedColumnSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

/// The structured result of walking a single `SELECT` (or `WITH ... SELECT`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub tables: Vec<String>,
    pub aliases: HashMap<String, String>,
    pub where_columns: OrderedColumnSet,
    pub order_by_columns: OrderedColumnSet,
    pub join_columns: OrderedColumnSet,
    pub column_table: HashMap<(ColumnRole, String), String>,
    pub predicate_types: HashMap<String, PredicateClass>,
    pub constant_filters: HashMap<String, String>,
}

impl ParsedQuery {
    fn register_table(&mut self, relation: String, alias: Option<String>) {
        let key = alias.unwrap_or_else(|| relation.clone());
        self.aliases.insert(key, relation.clone());
        self.tables.push(relation);
    }

    fn resolve(&self, qualifier: &str) -> Option<&String> {
        self.aliases.get(qualifier)
    }

    fn record_reference(&mut self, role: ColumnRole, qualifier: Option<&str>, column: &str) {
        match role {
            ColumnRole::Where => {
                self.where_columns.insert(column.to_string());
            }
            ColumnRole::OrderBy => {
                self.order_by_columns.insert(column.to_string());
            }
            ColumnRole::Join => {
                self.join_columns.insert(column.to_string());
            }
        }
        if let Some(q) = qualifier {
            if let Some(relation) = self.resolve(q) {
                self.column_table
                    .insert((role, column.to_string()), relation.clone());
            }
        } else if self.tables.len() == 1 {
            let relation = self.tables[0].clone();
            self.column_table
                .insert((role, column.to_string()), relation);
        }
    }
}

/// Running operator context threaded through `WHERE` recursion instead of
/// living as mutable state on a walker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorContext {
    None,
    Equality,
    Range,
    Other,
}

impl OperatorContext {
    fn from_operator(op: &BinaryOperator) -> Self {
        match op {
            BinaryOperator::Eq => OperatorContext::Equality,
            BinaryOperator::Lt
            | BinaryOperator::Gt
            | BinaryOperator::LtEq
            | BinaryOperator::GtEq
            | BinaryOperator::NotEq => OperatorContext::Range,
            _ => OperatorContext::Other,
        }
    }

    fn as_predicate_class(self) -> Option<PredicateClass> {
        match self {
            OperatorContext::Equality => Some(PredicateClass::Equality),
            OperatorContext::Range => Some(PredicateClass::Range),
            OperatorContext::Other => Some(PredicateClass::Other),
            OperatorContext::None => None,
        }
    }
}

/// Parses a single `SELECT` (or `WITH ... SELECT`) statement into a
/// [`ParsedQuery`].
pub fn parse(sql: &str) -> Result<ParsedQuery, ParserError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(ParserError::EmptyQuery);
    }

    let dialect = PostgreSqlDialect {};
    let statements = SqlParser::parse_sql(&dialect, trimmed)
        .map_err(|e| ParserError::SyntaxError(e.to_string()))?;

    let statement = statements
        .into_iter()
        .next()
        .ok_or(ParserError::EmptyQuery)?;

    let query = match statement {
        Statement::Query(q) => *q,
        other => return Err(ParserError::UnsupportedStatement(statement_kind(&other))),
    };

    let mut parsed = ParsedQuery::default();
    walk_query(&query, &mut parsed)?;
    Ok(parsed)
}

fn statement_kind(statement: &Statement) -> String {
    match statement {
        Statement::Insert { .. } => "INSERT".to_string(),
        Statement::Update { .. } => "UPDATE".to_string(),
        Statement::Delete { .. } => "DELETE".to_string(),
        Statement::CreateTable { .. } => "CREATE TABLE".to_string(),
        other => format!("{:?}", std::mem::discriminant(other)),
    }
}

fn walk_query(query: &Query, parsed: &mut ParsedQuery) -> Result<(), ParserError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select.as_ref(),
        SetExpr::Query(inner) => return walk_query(inner, parsed),
        other => {
            return Err(ParserError::UnsupportedQueryShape(format!(
                "unsupported set expression: {:?}",
                std::mem::discriminant(other)
            )))
        }
    };

    walk_select(select, parsed)?;

    for order_expr in order_by_exprs(query) {
        walk_expr_for_columns(&order_expr.expr, ColumnRole::OrderBy, OperatorContext::None, parsed);
    }

    Ok(())
}

/// `Query::order_by` switched from a bare `Vec<OrderByExpr>` to
/// `Option<OrderBy>` wrapping an `OrderByKind` a few releases back; this
/// normalizes either shape to a flat list so the walker doesn't care which.
fn order_by_exprs(query: &Query) -> Vec<sqlparser::ast::OrderByExpr> {
    match &query.order_by {
        Some(order_by) => match &order_by.kind {
            OrderByKind::Expressions(exprs) => exprs.clone(),
            OrderByKind::All(_) => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn walk_select(select: &Select, parsed: &mut ParsedQuery) -> Result<(), ParserError> {
    for twj in &select.from {
        walk_table_with_joins(twj, parsed)?;
    }

    if let Some(selection) = &select.selection {
        walk_expr_for_columns(selection, ColumnRole::Where, OperatorContext::None, parsed);
    }

    // Subqueries nested in SELECT items are out of scope per the walker's
    // supported subset; only scalar expressions are inspected for aliases.
    for item in &select.projection {
        if let SelectItem::ExprWithAlias { expr, .. } | SelectItem::UnnamedExpr(expr) = item {
            if matches!(expr, Expr::Subquery(_)) {
                return Err(ParserError::UnsupportedQueryShape(
                    "subquery in SELECT list".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn walk_table_with_joins(twj: &TableWithJoins, parsed: &mut ParsedQuery) -> Result<(), ParserError> {
    register_table_factor(&twj.relation, parsed)?;
    for join in &twj.joins {
        walk_join(join, parsed)?;
    }
    Ok(())
}

fn register_table_factor(factor: &TableFactor, parsed: &mut ParsedQuery) -> Result<(), ParserError> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let relation = name.to_string();
            let alias_name = alias.as_ref().map(|a| a.name.value.clone());
            parsed.register_table(relation, alias_name);
            Ok(())
        }
        TableFactor::Derived { .. } => Err(ParserError::UnsupportedQueryShape(
            "derived table (subquery) in FROM".to_string(),
        )),
        other => Err(ParserError::UnsupportedQueryShape(format!(
            "unsupported FROM item: {:?}",
            std::mem::discriminant(other)
        ))),
    }
}

fn walk_join(join: &Join, parsed: &mut ParsedQuery) -> Result<(), ParserError> {
    register_table_factor(&join.relation, parsed)?;

    let constraint = match &join.join_operator {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => Some(c),
        _ => None,
    };

    if let Some(JoinConstraint::On(expr)) = constraint {
        walk_expr_for_columns(expr, ColumnRole::Join, OperatorContext::None, parsed);
    }
    // USING(col) joins name bare columns directly; they carry no qualifier
    // and are recorded against the single-relation fallback only.
    if let Some(JoinConstraint::Using(objects)) = constraint {
        for obj in objects {
            if let Some(ident) = obj.0.last() {
                parsed.record_reference(ColumnRole::Join, None, &ident.value);
            }
        }
    }

    Ok(())
}

/// Recurses through a `WHERE`/`ON` expression tree, carrying the operator
/// context down to leaf column references.
fn walk_expr_for_columns(
    expr: &Expr,
    role: ColumnRole,
    context: OperatorContext,
    parsed: &mut ParsedQuery,
) {
    match expr {
        Expr::BinaryOp { left, op, right } => {
            let child_context = OperatorContext::from_operator(op);

            if role == ColumnRole::Where && *op == BinaryOperator::Eq {
                if let (Some((qualifier, column)), Some(literal)) =
                    (column_ref(left), rendered_literal(right))
                {
                    parsed.constant_filters.insert(column.clone(), literal);
                    let _ = qualifier;
                }
            }

            if matches!(op, BinaryOperator::And | BinaryOperator::Or) {
                walk_expr_for_columns(left, role, context, parsed);
                walk_expr_for_columns(right, role, context, parsed);
            } else {
                walk_expr_for_columns(left, role, child_context, parsed);
                walk_expr_for_columns(right, role, child_context, parsed);
            }
        }
        Expr::Nested(inner) => walk_expr_for_columns(inner, role, context, parsed),
        Expr::UnaryOp { expr: inner, .. } => walk_expr_for_columns(inner, role, context, parsed),
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            walk_expr_for_columns(inner, role, OperatorContext::Other, parsed)
        }
        Expr::InList { expr: inner, .. } => {
            walk_expr_for_columns(inner, role, OperatorContext::Other, parsed)
        }
        Expr::Between { expr: inner, .. } => {
            walk_expr_for_columns(inner, role, OperatorContext::Range, parsed)
        }
        Expr::Like { expr: inner, .. } | Expr::ILike { expr: inner, .. } => {
            walk_expr_for_columns(inner, role, OperatorContext::Other, parsed)
        }
        Expr::Identifier(ident) => {
            record_leaf(role, None, &ident.value, context, parsed);
        }
        Expr::CompoundIdentifier(parts) => {
            if parts.len() >= 2 {
                let qualifier = parts[parts.len() - 2].value.as_str();
                let column = &parts[parts.len() - 1].value;
                record_leaf(role, Some(qualifier), column, context, parsed);
            } else if let Some(last) = parts.last() {
                record_leaf(role, None, &last.value, context, parsed);
            }
        }
        _ => {}
    }
}

fn record_leaf(
    role: ColumnRole,
    qualifier: Option<&str>,
    column: &str,
    context: OperatorContext,
    parsed: &mut ParsedQuery,
) {
    parsed.record_reference(role, qualifier, column);
    if role == ColumnRole::Where {
        if let Some(class) = context.as_predicate_class() {
            parsed
                .predicate_types
                .entry(column.to_string())
                .or_insert(class);
        }
    }
}

fn column_ref(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(ident) => Some((None, ident.value.clone())),
        Expr::CompoundIdentifier(parts) => {
            let column = parts.last()?.value.clone();
            let qualifier = if parts.len() >= 2 {
                Some(parts[parts.len() - 2].value.clone())
            } else {
                None
            };
            Some((qualifier, column))
        }
        _ => None,
    }
}

/// Renders a literal as plain SQL text: single-quoted strings, bare
/// integers, bare booleans. Only literal-on-the-right `column = literal`
/// is detected; `literal = column` is not.
fn rendered_literal(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Value(value) => match &value.value {
            sqlparser::ast::Value::SingleQuotedString(s) => Some(format!("'{}'", s)),
            sqlparser::ast::Value::Number(n, _) => Some(n.clone()),
            sqlparser::ast::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_query() {
        assert_eq!(parse("   "), Err(ParserError::EmptyQuery));
    }

    #[test]
    fn rejects_unparseable_sql() {
        assert!(matches!(parse("SELEC * FORM t"), Err(ParserError::SyntaxError(_))));
    }

    #[test]
    fn single_table_equality_filter() {
        let parsed = parse("SELECT * FROM users WHERE email = 'u@x.com'").unwrap();
        assert_eq!(parsed.tables, vec!["users".to_string()]);
        assert!(parsed.where_columns.contains("email"));
        assert_eq!(
            parsed.predicate_types.get("email"),
            Some(&PredicateClass::Equality)
        );
        assert_eq!(
            parsed.constant_filters.get("email"),
            Some(&"'u@x.com'".to_string())
        );
        assert_eq!(
            parsed
                .column_table
                .get(&(ColumnRole::Where, "email".to_string())),
            Some(&"users".to_string())
        );
    }

    #[test]
    fn range_and_equality_classes() {
        let parsed =
            parse("SELECT * FROM orders WHERE status = 'pending' AND total > 500").unwrap();
        assert_eq!(
            parsed.predicate_types.get("status"),
            Some(&PredicateClass::Equality)
        );
        assert_eq!(
            parsed.predicate_types.get("total"),
            Some(&PredicateClass::Range)
        );
        assert!(!parsed.constant_filters.contains_key("total"));
    }

    #[test]
    fn order_by_single_table_no_where() {
        let parsed = parse("SELECT * FROM users ORDER BY created_at DESC LIMIT 10").unwrap();
        assert!(parsed.where_columns.is_empty());
        assert!(parsed.order_by_columns.contains("created_at"));
        assert_eq!(
            parsed
                .column_table
                .get(&(ColumnRole::OrderBy, "created_at".to_string())),
            Some(&"users".to_string())
        );
    }

    #[test]
    fn order_by_columns_preserve_clause_sequence() {
        let parsed = parse("SELECT * FROM t ORDER BY last_name, first_name").unwrap();
        let ordered: Vec<&String> = parsed.order_by_columns.iter().collect();
        assert_eq!(ordered, vec!["last_name", "first_name"]);
    }

    #[test]
    fn where_columns_preserve_predicate_sequence() {
        let parsed = parse("SELECT * FROM t WHERE b = 2 AND a = 1").unwrap();
        let ordered: Vec<&String> = parsed.where_columns.iter().collect();
        assert_eq!(ordered, vec!["b", "a"]);
    }

    #[test]
    fn join_condition_and_alias_resolution() {
        let parsed = parse(
            "SELECT u.name, o.total FROM users u JOIN orders o ON u.id = o.user_id WHERE o.status = 'completed'",
        )
        .unwrap();
        assert!(parsed.join_columns.contains("id"));
        assert!(parsed.join_columns.contains("user_id"));
        assert_eq!(
            parsed
                .column_table
                .get(&(ColumnRole::Join, "user_id".to_string())),
            Some(&"orders".to_string())
        );
        assert_eq!(
            parsed
                .column_table
                .get(&(ColumnRole::Where, "status".to_string())),
            Some(&"orders".to_string())
        );
    }

    #[test]
    fn unqualified_column_in_multi_table_query_is_unresolved() {
        let parsed =
            parse("SELECT * FROM a JOIN b ON a.id = b.a_id WHERE flagged = true").unwrap();
        assert!(parsed.where_columns.contains("flagged"));
        assert!(!parsed
            .column_table
            .contains_key(&(ColumnRole::Where, "flagged".to_string())));
    }
}
