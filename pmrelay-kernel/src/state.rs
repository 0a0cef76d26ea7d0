use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Un verrou async par hôte : les ingests d'un même hôte sont sérialisés,
/// deux hôtes différents ne se bloquent jamais.
#[derive(Clone, Default)]
pub struct HostLocks {
    locks: Shared<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl HostLocks {
    pub fn for_host(&self, host_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(host_id).or_default().clone()
    }

    pub fn forget(&self, host_id: i64) {
        self.locks.lock().remove(&host_id);
    }
}
