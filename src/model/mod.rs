//! Shared domain types for the aggregation engine.

pub mod types;
