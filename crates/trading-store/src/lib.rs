//! SQL persistence for signals, executions, daily risk metrics, alerts and
//! scan outcomes.
//!
//! Runs on `sqlx::AnyPool`, so the same code serves SQLite (default and
//! tests) and Postgres. Timestamps are stored as RFC-3339 text with
//! millisecond precision in UTC, which keeps lexical and chronological
//! ordering identical.

mod rows;
pub mod store;

pub use store::SqlStore;
