pub mod cache_manager;
pub mod file_handler;
pub mod metrics;
pub mod service;

pub use cache_manager::build_cache;
pub use file_handler::{FileHandler, FileInfo};
pub use metrics::RetrieverMetrics;
pub use service::{build_router, AppState};
