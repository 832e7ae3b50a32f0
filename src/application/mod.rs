//! Application layer: the parallel executor orchestrating the pipeline.

pub mod executor;

pub use executor::{ExecutorEvent, JobReport, ParallelExecutor};
