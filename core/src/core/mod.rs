pub mod engine;
pub mod job;
pub mod queue;
pub mod result_aggregator;
pub mod state;
pub mod throttle;
