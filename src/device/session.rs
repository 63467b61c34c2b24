use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::capture::{Stream, StreamFormat};
use crate::driver::{DeviceHandle, Led, RawTiltState, Runloop};
use crate::error::{Error, Result};
use crate::pipeline::FrameMailbox;
use crate::BridgeConfig;

/// One opened device and the mailboxes of its two streams.
///
/// Streams are started lazily on first request and stay active until the
/// session closes.
pub struct DeviceSession {
    index: u32,
    handle: DeviceHandle,
    runloop: Arc<Runloop>,
    depth_format: StreamFormat,
    color_format: StreamFormat,
    active: Mutex<[bool; 2]>,
    depth: FrameMailbox,
    color: FrameMailbox,
    closed: AtomicBool,
}

fn slot(stream: Stream) -> usize {
    match stream {
        Stream::Depth => 0,
        Stream::Color => 1,
    }
}

impl DeviceSession {
    /// Claim device `index` through the driver
    pub fn open(index: u32, runloop: Arc<Runloop>, config: &BridgeConfig) -> Result<Self> {
        let handle = runloop
            .enter()
            .open_device(index)
            .map_err(|e| Error::device(index, e))?;
        debug!(index, %handle, "Opened device");

        let mailbox = |stream| FrameMailbox::new(stream, config.poll_interval(), config.wake_policy);
        Ok(Self {
            index,
            handle,
            runloop,
            depth_format: config.depth_format,
            color_format: config.color_format,
            active: Mutex::new([false; 2]),
            depth: mailbox(Stream::Depth),
            color: mailbox(Stream::Color),
            closed: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn format(&self, stream: Stream) -> StreamFormat {
        match stream {
            Stream::Depth => self.depth_format,
            Stream::Color => self.color_format,
        }
    }

    pub fn mailbox(&self, stream: Stream) -> &FrameMailbox {
        match stream {
            Stream::Depth => &self.depth,
            Stream::Color => &self.color,
        }
    }

    pub fn is_active(&self, stream: Stream) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)[slot(stream)]
    }

    /// Configure and start `stream` unless it is already running
    pub fn enable_stream(&self, stream: Stream) -> Result<()> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = self.mailbox(stream).closed_error() {
            return Err(err);
        }
        if active[slot(stream)] {
            return Ok(());
        }

        let format = self.format(stream);
        let driver = self.runloop.enter();
        driver
            .set_stream_format(self.handle, stream, format)
            .and_then(|()| driver.start_stream(self.handle, stream))
            .map_err(|e| Error::device(self.index, e))?;

        active[slot(stream)] = true;
        info!(index = self.index, %stream, ?format, "Stream started");
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(index = self.index))]
    pub fn set_led(&self, led: Led) -> Result<()> {
        self.runloop
            .enter()
            .set_led(self.handle, led)
            .map_err(|e| Error::device(self.index, e))
    }

    #[instrument(level = "debug", skip(self), fields(index = self.index))]
    pub fn set_tilt(&self, degrees: f64) -> Result<()> {
        self.runloop
            .enter()
            .set_tilt(self.handle, degrees)
            .map_err(|e| Error::device(self.index, e))
    }

    pub fn tilt_state(&self) -> Result<RawTiltState> {
        self.runloop
            .enter()
            .tilt_state(self.handle)
            .map_err(|e| Error::device(self.index, e))
    }

    /// Wake readers with `Faulted`; the device stays claimed until `close`
    pub(crate) fn fault(&self, reason: &str) {
        self.depth.fault(reason);
        self.color.fault(reason);
    }

    /// Stop active streams, close both mailboxes and release the device
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let driver = self.runloop.enter();
            for stream in Stream::ALL {
                if std::mem::take(&mut active[slot(stream)]) {
                    if let Err(err) = driver.stop_stream(self.handle, stream) {
                        warn!(index = self.index, %stream, %err, "Failed to stop stream");
                    }
                }
            }
        }

        self.depth.close();
        self.color.close();

        if let Err(err) = self.runloop.enter().close_device(self.handle) {
            warn!(index = self.index, %err, "Failed to release device");
        }
        debug!(index = self.index, "Device session closed");
    }
}
