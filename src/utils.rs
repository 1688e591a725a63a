//! Small shared helpers

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Current unix time in seconds
pub fn unix_time() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Random identifier that survives hash changes of the thing it names
pub fn new_uid() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Read-lock, recovering the data if a writer panicked
pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write-lock, recovering the data if a writer panicked
pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_is_unique() {
        assert_ne!(new_uid(), new_uid());
        assert_eq!(new_uid().len(), 32);
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let lock_value = std::sync::Arc::new(RwLock::new(1));
        let cloned = lock_value.clone();
        let _ = std::thread::spawn(move || {
            let _guard = cloned.write().unwrap();
            panic!("poison");
        })
        .join();

        assert!(lock_value.is_poisoned());
        *write_lock(&lock_value) += 1;
        assert_eq!(*read_lock(&lock_value), 2);
    }
}
