use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::RwLock;

/// État partagé synchrone (sections critiques courtes, jamais traversées par un await).
pub type Shared<T> = Arc<Mutex<T>>;

/// État partagé asynchrone pour les handlers qui gardent le verrou à travers un await.
pub type SharedRw<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub fn new_rw<T>(value: T) -> SharedRw<T> {
    Arc::new(RwLock::new(value))
}
