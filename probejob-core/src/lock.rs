//! Execution mutex.
//!
//! A single timed exclusive-access primitive guarding the driver. The driver
//! lives in a one-slot channel: acquiring the mutex takes it out, dropping the
//! guard puts it back. Code that does not hold a guard has no way to reach the
//! driver, so no two execute phases can ever talk to the probe at once.

use crossbeam_channel::{Receiver, Sender};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use thiserror::Error;

/// Default bound on how long a job waits for the probe.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Exclusive access was not obtained within the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exclusive probe access not obtained within {timeout:?}")]
pub struct LockTimeout {
    pub timeout: Duration,
}

/// Exclusive-access service shared by every job of a process.
///
/// Waiters are served in no particular order.
pub struct ExecutionMutex<D> {
    slot_tx: Sender<D>,
    slot_rx: Receiver<D>,
    timeout: Duration,
}

impl<D: Send> ExecutionMutex<D> {
    pub fn new(driver: D, timeout: Duration) -> Self {
        let (slot_tx, slot_rx) = crossbeam_channel::bounded(1);
        slot_tx
            .send(driver)
            .unwrap_or_else(|_| unreachable!("the mutex holds its own receiver"));
        Self { slot_tx, slot_rx, timeout }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire with the configured timeout.
    pub fn lock(&self) -> Result<ProbeGuard<'_, D>, LockTimeout> {
        self.lock_for(self.timeout)
    }

    pub fn lock_for(&self, timeout: Duration) -> Result<ProbeGuard<'_, D>, LockTimeout> {
        match self.slot_rx.recv_timeout(timeout) {
            Ok(driver) => Ok(ProbeGuard { driver: Some(driver), slot: &self.slot_tx }),
            Err(_) => Err(LockTimeout { timeout }),
        }
    }

    pub fn try_lock(&self) -> Option<ProbeGuard<'_, D>> {
        self.slot_rx
            .try_recv()
            .ok()
            .map(|driver| ProbeGuard { driver: Some(driver), slot: &self.slot_tx })
    }

    pub fn is_locked(&self) -> bool {
        self.slot_rx.is_empty()
    }
}

impl<D> std::fmt::Debug for ExecutionMutex<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionMutex")
            .field("timeout", &self.timeout)
            .field("locked", &self.slot_rx.is_empty())
            .finish()
    }
}

/// Scoped exclusive access to the driver. Released on drop, on every exit
/// path including unwinding.
pub struct ProbeGuard<'a, D> {
    driver: Option<D>,
    slot: &'a Sender<D>,
}

impl<D> Deref for ProbeGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        match &self.driver {
            Some(driver) => driver,
            None => unreachable!("driver is only taken on drop"),
        }
    }
}

impl<D> DerefMut for ProbeGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        match &mut self.driver {
            Some(driver) => driver,
            None => unreachable!("driver is only taken on drop"),
        }
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for ProbeGuard<'_, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProbeGuard").field(&self.driver).finish()
    }
}

impl<D> Drop for ProbeGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // The slot is empty while a guard exists, so this never blocks.
            let _ = self.slot.send(driver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_guard_releases_on_drop() {
        let mutex = ExecutionMutex::new(0u32, Duration::from_millis(10));
        {
            let mut guard = mutex.lock().unwrap();
            *guard += 1;
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.lock().unwrap(), 1);
    }

    #[test]
    fn test_lock_times_out_while_held() {
        let mutex = ExecutionMutex::new((), Duration::from_millis(20));
        let _held = mutex.lock().unwrap();

        let start = Instant::now();
        let err = mutex.lock().unwrap_err();
        assert_eq!(err.timeout, Duration::from_millis(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_release_on_panic() {
        let mutex = Arc::new(ExecutionMutex::new(Vec::<u8>::new(), Duration::from_millis(50)));
        let worker = {
            let mutex = mutex.clone();
            thread::spawn(move || {
                let mut guard = mutex.lock().unwrap();
                guard.push(1);
                panic!("driver call blew up");
            })
        };
        assert!(worker.join().is_err());
        assert_eq!(*mutex.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_waiter_acquires_after_release() {
        let mutex = Arc::new(ExecutionMutex::new(0u32, Duration::from_secs(2)));
        let guard = mutex.lock().unwrap();
        let waiter = {
            let mutex = mutex.clone();
            thread::spawn(move || {
                let value = *mutex.lock().unwrap();
                value
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert_eq!(waiter.join().unwrap(), 0);
    }
}
