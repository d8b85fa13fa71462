pub mod heartbeat;
pub mod metrics;
pub mod packer;
pub mod recovery;
pub mod shard_worker;
pub mod shutdown;
pub mod source_provider;
pub mod writer_state;

pub use heartbeat::HeartbeatManager;
pub use metrics::PackerMetrics;
pub use packer::Packer;
pub use recovery::RecoveryManager;
pub use shard_worker::ShardWorker;
pub use shutdown::Shutdown;
pub use source_provider::{PendingFile, SourceProvider};
pub use writer_state::WriterState;
