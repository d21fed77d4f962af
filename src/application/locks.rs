use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// Lazily-created named async locks. Promotion and rollback hold the model's
/// lock across their read-check-swap sequence so concurrent pointer changes
/// for the same model serialize; different models proceed in parallel.
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_a_lock() {
        let locks = KeyedLocks::new();
        let a = locks.get("model-1");
        let b = locks.get("model-1");
        let c = locks.get("model-2");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn lock_serializes_critical_sections() {
        let locks = Arc::new(KeyedLocks::new());
        let counter = Arc::new(Mutex::new(0i32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let lock = locks.get("model-1");
                let _guard = lock.lock().await;
                let before = *counter.lock().unwrap();
                tokio::task::yield_now().await;
                *counter.lock().unwrap() = before + 1;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
    }
}
