pub mod catalog;
pub mod dlq;
pub mod lock;
pub mod pool;
pub mod source;
pub mod source_catalog;

pub use catalog::{ContainerCatalog, ContainerRecord};
pub use dlq::DeadLetterQueue;
pub use lock::ShardLockTable;
pub use pool::{connect, init_schema};
pub use source::{PendingFile, SourceConnector};
pub use source_catalog::{CatalogEntry, SourceCatalogTable};
