pub mod context;
pub mod runner;

pub use context::{AggregationContext, ContextLimits};
pub use runner::FeedEngine;
