pub mod metrics;
pub mod routing_table;
pub mod service;

pub use metrics::RouterMetrics;
pub use routing_table::{Endpoint, RoutingTable};
pub use service::{build_router, AppState};
