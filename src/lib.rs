//! index_advisor — an automated index-recommendation engine for PostgreSQL.
//!
//! Given a SQL query, or a batch of them drawn from `pg_stat_statements`,
//! this crate locates table scans that could be avoided with a secondary
//! index, infers the optimal column set and ordering for each candidate
//! index, estimates the expected improvement from cataloged statistics,
//! flags over-indexing risk on write-heavy relations, and renders
//! ready-to-execute `CREATE INDEX` DDL.
//!
//! The core is organized leaves-first, matching the data flow:
//! `SQL -> (parser | plan) -> gateway stats -> synthesizer -> batch`.

pub mod batch;
pub mod config;
pub mod ddl;
pub mod gateway;
pub mod parser;
pub mod plan;
pub mod synthesizer;
