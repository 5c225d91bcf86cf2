pub mod cache;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod memory;
pub mod metrics_consts;
pub mod pipeline;
pub mod planner;
pub mod report;
pub mod result;
pub mod retry;
pub mod streaming;
pub mod time;

pub use engine::{CheckOptions, DuplicateDetectionEngine};
pub use error::{DetectionError, ErrorKind};
pub use result::DetectionResult;
pub use streaming::DetectionMode;
