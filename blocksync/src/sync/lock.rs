use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::CacheKey;

/// Per-key mutual exclusion.
///
/// Each key maps to a weakly held async mutex: entries only live while a sync holds or awaits the lock, so the map never grows
/// past the number of keys being synced at once.
#[derive(Debug, Default, Clone)]
pub(crate) struct KeyLocks {
    locks: Arc<Mutex<HashMap<CacheKey, Weak<AsyncMutex<()>>>>>,
}

impl KeyLocks {
    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();

            locks.retain(|_, lock| lock.strong_count() > 0);

            match locks.get(key).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(key.clone(), Arc::downgrade(&lock));
                    lock
                }
            }
        };

        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap().values().filter(|lock| lock.strong_count() > 0).count()
    }
}
