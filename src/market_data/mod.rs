pub mod aggregator;
pub mod candle_store;
pub mod classifier;
pub mod reconciler;
pub mod upstream;
