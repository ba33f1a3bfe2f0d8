//! 错误聚合与计分

pub mod aggregator;
pub mod engine;

pub use aggregator::{AggregationMethod, ErrorAggregator, ErrorSequence};
pub use engine::{PersonScoreState, ScoringEngine, ScoringPolicy};
