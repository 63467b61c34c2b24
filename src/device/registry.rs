use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use super::DeviceSession;
use crate::driver::{DeviceHandle, DriverError, Runloop};
use crate::error::{Error, Result};
use crate::pipeline::CloseReason;
use crate::BridgeConfig;

/// Published view of the open sessions, replaced wholesale on every change
#[derive(Default, Clone)]
struct Sessions {
    by_index: HashMap<u32, Arc<DeviceSession>>,
    by_handle: HashMap<DeviceHandle, Arc<DeviceSession>>,
}

/// Whether new sessions may be opened
enum Admission {
    Open,
    Closed(CloseReason),
}

/// Device index -> session map with lazy, single-flight opening.
///
/// Lookups read an `ArcSwap` snapshot without locking. Opening, closing and
/// faulting serialise on one mutex, so concurrent first requests for an
/// index result in exactly one `open_device` call.
pub struct DeviceRegistry {
    runloop: Arc<Runloop>,
    config: BridgeConfig,
    sessions: ArcSwap<Sessions>,
    admission: Mutex<Admission>,
}

impl DeviceRegistry {
    /// Registry starts closed; call `reopen` once the driver is initialised
    pub fn new(runloop: Arc<Runloop>, config: BridgeConfig) -> Self {
        Self {
            runloop,
            config,
            sessions: ArcSwap::from_pointee(Sessions::default()),
            admission: Mutex::new(Admission::Closed(CloseReason::Stopped)),
        }
    }

    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.admission.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, index: u32) -> Option<Arc<DeviceSession>> {
        self.sessions.load().by_index.get(&index).cloned()
    }

    /// Resolve a driver handle; called on the worker for every frame
    pub fn lookup(&self, handle: DeviceHandle) -> Option<Arc<DeviceSession>> {
        self.sessions.load().by_handle.get(&handle).cloned()
    }

    pub fn get_or_open(&self, index: u32) -> Result<Arc<DeviceSession>> {
        if index >= self.config.max_devices {
            return Err(Error::device(index, DriverError::NoSuchDevice(index)));
        }
        if let Some(session) = self.get(index) {
            return Ok(session);
        }

        let admission = self.admission();
        if let Admission::Closed(reason) = &*admission {
            return Err(reason.to_error());
        }
        // Another caller may have finished opening while we waited.
        if let Some(session) = self.get(index) {
            return Ok(session);
        }

        let session = Arc::new(DeviceSession::open(
            index,
            Arc::clone(&self.runloop),
            &self.config,
        )?);
        let mut next = Sessions::clone(&self.sessions.load());
        next.by_index.insert(index, Arc::clone(&session));
        next.by_handle.insert(session.handle(), Arc::clone(&session));
        self.sessions.store(Arc::new(next));
        drop(admission);

        info!(index, handle = %session.handle(), "Device session opened");
        Ok(session)
    }

    /// Close and forget one session; false if it was not open.
    ///
    /// The driver handle is released before the admission lock, so a
    /// concurrent reopen of the same index never finds the device busy.
    pub fn close(&self, index: u32) -> bool {
        let _admission = self.admission();
        let mut next = Sessions::clone(&self.sessions.load());
        let Some(session) = next.by_index.remove(&index) else {
            return false;
        };
        next.by_handle.remove(&session.handle());
        self.sessions.store(Arc::new(next));
        session.close();
        true
    }

    /// Refuse new sessions until `reopen`; open sessions are left alone.
    ///
    /// Waits for an in-flight open to finish, so once this returns no
    /// `open_device` call can start.
    pub fn refuse_new(&self) {
        *self.admission() = Admission::Closed(CloseReason::Stopped);
    }

    /// Close every session and refuse new ones until `reopen`
    pub fn close_all(&self) {
        let previous = {
            let mut admission = self.admission();
            *admission = Admission::Closed(CloseReason::Stopped);
            self.sessions.swap(Arc::new(Sessions::default()))
        };
        for session in previous.by_index.values() {
            session.close();
        }
        debug!(count = previous.by_index.len(), "Closed all device sessions");
    }

    /// Wake every reader with `Faulted` and refuse new sessions.
    /// Devices stay claimed until `close_all`.
    pub fn fault_all(&self, reason: &str) {
        let mut admission = self.admission();
        *admission = Admission::Closed(CloseReason::Faulted(reason.to_owned()));
        for session in self.sessions.load().by_index.values() {
            session.fault(reason);
        }
    }

    pub fn reopen(&self) {
        *self.admission() = Admission::Open;
    }

    pub fn len(&self) -> usize {
        self.sessions.load().by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
