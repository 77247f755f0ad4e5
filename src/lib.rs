pub mod aggregate;
pub mod archive;
pub mod config;
pub mod dataset;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod pipeline;
pub mod render;

// Re-export the types a caller needs to set up and run a request
pub use config::{RunRequest, ValidatedRequest, ValidationError};
pub use dataset::DatasetIndex;
pub use extract::EndpointExtractor;
pub use fetch::HttpFetcher;
pub use model::{RunReport, RunState};
pub use pipeline::{Orchestrator, RunError};
