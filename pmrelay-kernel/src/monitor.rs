use crate::models::now_unix;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{info, warn};

/// Passe hors ligne les hôtes muets depuis plus de `offline_after_secs`,
/// toutes les `check_interval_secs`.
pub fn spawn_host_monitor(store: Arc<Store>, offline_after_secs: i64, check_interval_secs: u64) {
    task::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(check_interval_secs.max(1)));
        loop {
            interval.tick().await;
            match store.mark_stale_offline(now_unix() - offline_after_secs) {
                Ok(0) => {}
                Ok(n) => info!("[monitor] {n} host(s) marked offline"),
                Err(e) => warn!("[monitor] offline sweep failed: {e}"),
            }
        }
    });
}
