//! Blocking, thread-safe frame access on top of the callback-driven driver
//!
//! A [`CaptureBridge`] owns one worker thread that pumps the driver's event
//! loop. Frames delivered on that thread are decoded and published into the
//! per-stream mailboxes of the [`DeviceRegistry`]; application threads call
//! [`CaptureBridge::get_frame`] and block on those mailboxes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::{decode_frame, Frame, Stream};
use crate::device::{DeviceRegistry, DeviceSession};
use crate::driver::{Accelerometer, DeviceHandle, Driver, FrameSink, Led, RawTiltState, Runloop};
use crate::error::{Error, Result};
use crate::pipeline::{MailboxStats, Publish};
use crate::BridgeConfig;

/// Lifecycle of the capture worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The driver failed; only `stop` leaves this state
    Faulted,
}

struct Lifecycle {
    state: WorkerState,
    fault: Option<String>,
}

struct Shared {
    config: BridgeConfig,
    runloop: Arc<Runloop>,
    registry: DeviceRegistry,
    lifecycle: Mutex<Lifecycle>,
    decode_errors: AtomicU64,
}

impl Shared {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Err unless frames can currently be requested
    fn ensure_running(&self) -> Result<()> {
        let lifecycle = self.lifecycle();
        match lifecycle.state {
            WorkerState::Starting | WorkerState::Running => Ok(()),
            WorkerState::Faulted => Err(Error::Faulted(
                lifecycle.fault.clone().unwrap_or_default(),
            )),
            WorkerState::Stopped | WorkerState::Stopping => Err(Error::Closed),
        }
    }

    /// Decode and publish one driver buffer. Malformed buffers are counted,
    /// logged and dropped; the mailbox keeps its previous frame.
    fn dispatch(
        &self,
        handle: DeviceHandle,
        stream: Stream,
        data: &[u8],
        timestamp: u32,
    ) -> Result<Publish> {
        let outcome = self.publish(handle, stream, data, timestamp);
        if let Err(err) = &outcome {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("kinect_sync.decode_errors", "stream" => stream.as_str())
                .increment(1);
            warn!(%handle, %stream, timestamp, %err, "Dropping frame");
        }
        outcome
    }

    fn publish(
        &self,
        handle: DeviceHandle,
        stream: Stream,
        data: &[u8],
        timestamp: u32,
    ) -> Result<Publish> {
        let Some(session) = self.registry.lookup(handle) else {
            trace!(%handle, %stream, "Frame for a device without a session");
            return Ok(Publish::Rejected);
        };

        let frame = decode_frame(session.format(stream), data, timestamp)?;
        let outcome = session.mailbox(stream).publish(frame);
        match outcome {
            Publish::Stored => {
                metrics::counter!("kinect_sync.frames_published", "stream" => stream.as_str())
                    .increment(1);
            }
            Publish::Replaced => {
                metrics::counter!("kinect_sync.frames_published", "stream" => stream.as_str())
                    .increment(1);
                metrics::counter!("kinect_sync.frames_overwritten", "stream" => stream.as_str())
                    .increment(1);
            }
            Publish::Rejected => {}
        }
        Ok(outcome)
    }
}

impl FrameSink for Shared {
    fn on_frame(&self, handle: DeviceHandle, stream: Stream, data: &[u8], timestamp: u32) {
        // Already logged; the worker keeps pumping.
        let _ = self.dispatch(handle, stream, data, timestamp);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("Capture worker running");
    loop {
        if !matches!(
            shared.lifecycle().state,
            WorkerState::Starting | WorkerState::Running
        ) {
            break;
        }

        let Err(err) = shared.runloop.pump(&*shared) else {
            continue;
        };

        let mut lifecycle = shared.lifecycle();
        if lifecycle.state == WorkerState::Stopping {
            debug!(%err, "Event processing ended for shutdown");
            break;
        }

        let reason = err.to_string();
        lifecycle.state = WorkerState::Faulted;
        lifecycle.fault = Some(reason.clone());
        drop(lifecycle);

        metrics::counter!("kinect_sync.worker_faults").increment(1);
        error!(%err, "Capture worker faulted");
        shared.registry.fault_all(&reason);
        break;
    }
    debug!("Capture worker exited");
}

/// Synchronous frame-acquisition bridge.
///
/// Independent instances do not share state, so several bridges can drive
/// several drivers in one process.
pub struct CaptureBridge {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureBridge {
    pub fn new(driver: Arc<dyn Driver>, config: BridgeConfig) -> Self {
        let runloop = Arc::new(Runloop::new(driver));
        let registry = DeviceRegistry::new(Arc::clone(&runloop), config.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                runloop,
                registry,
                lifecycle: Mutex::new(Lifecycle {
                    state: WorkerState::Stopped,
                    fault: None,
                }),
                decode_errors: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_driver(driver: impl Driver + 'static, config: BridgeConfig) -> Self {
        Self::new(Arc::new(driver), config)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn state(&self) -> WorkerState {
        self.shared.lifecycle().state
    }

    /// Initialise the driver and spawn the worker. No-op while running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut lifecycle = self.shared.lifecycle();
            match lifecycle.state {
                WorkerState::Starting | WorkerState::Running => return Ok(()),
                WorkerState::Faulted => {
                    return Err(Error::Faulted(lifecycle.fault.clone().unwrap_or_default()))
                }
                WorkerState::Stopping => return Err(Error::Closed),
                WorkerState::Stopped => lifecycle.state = WorkerState::Starting,
            }
        }
        info!("Starting capture bridge");

        if let Err(err) = self.shared.runloop.enter().init() {
            self.shared.lifecycle().state = WorkerState::Stopped;
            return Err(err.into());
        }
        self.shared.registry.reopen();

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.config.worker_thread_name.clone())
            .spawn(move || worker_loop(shared));
        match spawned {
            Ok(handle) => *worker = Some(handle),
            Err(err) => {
                self.shared.registry.close_all();
                self.shared.runloop.interrupt();
                self.shared.lifecycle().state = WorkerState::Stopped;
                return Err(err.into());
            }
        }

        let mut lifecycle = self.shared.lifecycle();
        // The worker may already have faulted.
        if lifecycle.state == WorkerState::Starting {
            lifecycle.state = WorkerState::Running;
        }
        info!("Capture bridge running");
        Ok(())
    }

    /// Interrupt the driver, join the worker and release every device.
    ///
    /// Blocked `get_frame` calls fail with `Closed`. Leaves a faulted bridge
    /// ready for `start`.
    pub fn stop(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.state == WorkerState::Stopped {
                return;
            }
            lifecycle.state = WorkerState::Stopping;
        }
        info!("Stopping capture bridge");

        // No open may reach the driver once it is interrupted.
        self.shared.registry.refuse_new();
        self.shared.runloop.interrupt();
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("Capture worker panicked");
            }
        }
        self.shared.registry.close_all();

        let mut lifecycle = self.shared.lifecycle();
        lifecycle.state = WorkerState::Stopped;
        lifecycle.fault = None;
        info!("Capture bridge stopped");
    }

    /// Open device `index` without starting any stream
    #[instrument(level = "debug", skip(self))]
    pub fn open(&self, index: u32) -> Result<Arc<DeviceSession>> {
        self.shared.ensure_running()?;
        self.shared.registry.get_or_open(index)
    }

    /// Close one device; its blocked readers fail with `Closed`
    pub fn close_device(&self, index: u32) -> bool {
        self.shared.registry.close(index)
    }

    pub fn session(&self, index: u32) -> Option<Arc<DeviceSession>> {
        self.shared.registry.get(index)
    }

    /// Latest frame of `stream` from device `index`, blocking until one arrives.
    ///
    /// Opens the device and starts the stream on first use. With `timeout`
    /// the wait ends in `Error::Timeout`; without it the call waits until a
    /// frame arrives or the bridge stops or faults.
    pub fn get_frame(&self, index: u32, stream: Stream, timeout: Option<Duration>) -> Result<Frame> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.shared.ensure_running()?;

        let session = self.shared.registry.get_or_open(index)?;
        session.enable_stream(stream)?;
        session.mailbox(stream).take_until(deadline)
    }

    pub fn get_depth(&self, index: u32) -> Result<Frame> {
        self.get_frame(index, Stream::Depth, None)
    }

    pub fn get_color(&self, index: u32) -> Result<Frame> {
        self.get_frame(index, Stream::Color, None)
    }

    pub fn set_led(&self, index: u32, led: Led) -> Result<()> {
        self.open(index)?.set_led(led)
    }

    pub fn set_tilt(&self, index: u32, degrees: f64) -> Result<()> {
        self.open(index)?.set_tilt(degrees)
    }

    pub fn get_tilt_state(&self, index: u32) -> Result<RawTiltState> {
        self.open(index)?.tilt_state()
    }

    pub fn get_accelerometer(&self, index: u32) -> Result<Accelerometer> {
        Ok(self.get_tilt_state(index)?.accelerometer())
    }

    /// Driver-side entry point: decode `data` and publish it.
    ///
    /// Normally invoked on the worker from inside `process_events`.
    pub fn on_frame(
        &self,
        handle: DeviceHandle,
        stream: Stream,
        data: &[u8],
        timestamp: u32,
    ) -> Result<Publish> {
        self.shared.dispatch(handle, stream, data, timestamp)
    }

    pub fn mailbox_stats(&self, index: u32, stream: Stream) -> Option<MailboxStats> {
        self.session(index).map(|s| s.mailbox(stream).stats())
    }

    /// Driver buffers dropped because their size did not match the format
    pub fn decode_errors(&self) -> u64 {
        self.shared.decode_errors.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DEPTH_BYTES;
    use crate::driver::{SimController, SimDriver};

    fn bridge() -> (CaptureBridge, SimController) {
        let (driver, controller) = SimDriver::new(2);
        let config = BridgeConfig {
            poll_interval_ms: 20,
            ..BridgeConfig::default()
        };
        (CaptureBridge::with_driver(driver, config), controller)
    }

    #[test]
    fn short_buffer_is_rejected_without_publishing() {
        let (bridge, _controller) = bridge();
        bridge.start().unwrap();
        let session = bridge.open(0).unwrap();
        let mailbox = session.mailbox(Stream::Depth);

        bridge
            .on_frame(session.handle(), Stream::Depth, &vec![0u8; DEPTH_BYTES], 1)
            .unwrap();
        let generation = mailbox.generation();

        let err = bridge
            .on_frame(session.handle(), Stream::Depth, &[0u8; 100], 2)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Decode {
                stream: Stream::Depth,
                expected: DEPTH_BYTES,
                actual: 100,
            }
        ));
        assert_eq!(mailbox.generation(), generation);
        assert_eq!(bridge.decode_errors(), 1);
        assert_eq!(mailbox.take().unwrap().timestamp(), 1);
    }

    #[test]
    fn frames_for_unknown_handles_are_ignored() {
        let (bridge, _controller) = bridge();
        bridge.start().unwrap();
        let outcome = bridge
            .on_frame(DeviceHandle(77), Stream::Color, &[0u8; 3], 0)
            .unwrap();
        assert_eq!(outcome, Publish::Rejected);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (bridge, _controller) = bridge();
        assert_eq!(bridge.state(), WorkerState::Stopped);
        bridge.start().unwrap();
        bridge.start().unwrap();
        assert_eq!(bridge.state(), WorkerState::Running);
        bridge.stop();
        bridge.stop();
        assert_eq!(bridge.state(), WorkerState::Stopped);
    }

    #[test]
    fn requests_before_start_are_closed() {
        let (bridge, controller) = bridge();
        assert!(matches!(bridge.open(0), Err(Error::Closed)));
        assert!(matches!(bridge.get_depth(0), Err(Error::Closed)));
        assert_eq!(controller.open_calls(0), 0);
    }
}
