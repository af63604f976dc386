pub mod request;
pub mod runner;
pub mod summary;

pub use request::OptimizationRequest;
pub use runner::{run_optimization, CancelFlag, OptimizationRun};
pub use summary::RunSummary;
