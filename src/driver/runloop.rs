//! Serialises control calls against the worker's event processing

use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use super::{Driver, DriverError, FrameSink};

/// Owner of the driver; hands out exclusive access between event rounds.
///
/// Control callers register as pending before taking the runloop lock, and
/// the worker waits for the pending count to drain before each
/// `process_events`, so control calls are never starved by the event loop.
pub struct Runloop {
    driver: Arc<dyn Driver>,
    pending: Mutex<usize>,
    drained: Condvar,
    lock: Mutex<()>,
}

impl Runloop {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            pending: Mutex::new(0),
            drained: Condvar::new(),
            lock: Mutex::new(()),
        }
    }

    /// Exclusive driver access for a control call
    pub fn enter(&self) -> RunloopGuard<'_> {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        let lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        RunloopGuard {
            runloop: self,
            lock: Some(lock),
        }
    }

    /// One round of event processing; called only by the capture worker
    pub fn pump(&self, sink: &dyn FrameSink) -> Result<(), DriverError> {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            while *pending > 0 {
                pending = self
                    .drained
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        let _lock = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.driver.process_events(sink)
    }

    /// Bypasses the lock: used to break the worker out of `process_events`
    pub fn interrupt(&self) {
        self.driver.interrupt();
    }

    fn leave(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

pub struct RunloopGuard<'a> {
    runloop: &'a Runloop,
    lock: Option<MutexGuard<'a, ()>>,
}

impl Deref for RunloopGuard<'_> {
    type Target = dyn Driver;

    fn deref(&self) -> &Self::Target {
        &*self.runloop.driver
    }
}

impl Drop for RunloopGuard<'_> {
    fn drop(&mut self) {
        // Release the runloop before the worker is told it may proceed.
        drop(self.lock.take());
        self.runloop.leave();
    }
}
