//! Keeps a shard lock alive via periodic renewal, grounded on
//! `des/packer/multi_shard_packer.py::HeartbeatManager`.

use std::sync::Arc;

use des_db::ShardLockTable;
use sqlx::PgPool;
use tokio::task::JoinHandle;

pub struct HeartbeatManager {
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatManager {
    /// Spawns a background task renewing `shard_id`'s lock every `ttl_secs / 2`
    /// seconds until dropped or explicitly stopped.
    pub fn start(pool: PgPool, shard_id: u32, holder_id: Arc<str>, ttl_secs: u64) -> Self {
        let interval = std::time::Duration::from_secs((ttl_secs / 2).max(1));
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // first tick fires immediately; skip it.
            loop {
                tick.tick().await;
                let table = ShardLockTable::new(&pool);
                if let Err(e) = table.renew(shard_id, &holder_id, ttl_secs as i64).await {
                    tracing::warn!(shard_id, error = %e, "failed to renew shard lock");
                }
            }
        });
        HeartbeatManager { handle: Some(handle) }
    }

    pub fn stop(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
