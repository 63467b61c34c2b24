//! Single-slot frame exchange between the capture worker and blocking readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::capture::{Frame, Stream};
use crate::error::{Error, Result};

/// How many blocked readers a publish wakes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakePolicy {
    /// Wake a single reader. Concurrent readers of one stream can starve.
    #[default]
    One,
    /// Wake every reader; one consumes, the rest go back to waiting.
    All,
}

/// Why a mailbox stopped accepting frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Stopped,
    Faulted(String),
}

impl CloseReason {
    pub(crate) fn to_error(&self) -> Error {
        match self {
            CloseReason::Stopped => Error::Closed,
            CloseReason::Faulted(reason) => Error::Faulted(reason.clone()),
        }
    }
}

/// Result of handing a frame to a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// Slot was empty
    Stored,
    /// An unread frame was discarded
    Replaced,
    /// Mailbox is closed; the frame was dropped
    Rejected,
}

struct Slot {
    frame: Option<Frame>,
    generation: u64,
    closed: Option<CloseReason>,
    waiters: usize,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    taken: AtomicU64,
    overwritten: AtomicU64,
}

/// Counter snapshot for one mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub published: u64,
    pub taken: u64,
    pub overwritten: u64,
}

/// Latest-wins exchange point for one (device, stream) pair.
///
/// `publish` replaces whatever is in the slot and never waits on readers.
/// `take` empties the slot, waiting in bounded steps of `poll_interval`
/// until a frame arrives, the mailbox closes, or the caller's deadline passes.
pub struct FrameMailbox {
    stream: Stream,
    slot: Mutex<Slot>,
    ready: Condvar,
    wake: WakePolicy,
    poll_interval: Duration,
    stats: CachePadded<Stats>,
}

impl FrameMailbox {
    pub fn new(stream: Stream, poll_interval: Duration, wake: WakePolicy) -> Self {
        Self {
            stream,
            slot: Mutex::new(Slot {
                frame: None,
                generation: 0,
                closed: None,
                waiters: 0,
            }),
            ready: Condvar::new(),
            wake,
            poll_interval,
            stats: CachePadded::new(Stats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Producer: replace the slot contents and wake waiting readers
    pub fn publish(&self, frame: Frame) -> Publish {
        let mut slot = self.lock();
        if slot.closed.is_some() {
            return Publish::Rejected;
        }

        let outcome = match slot.frame.replace(frame) {
            Some(_) => {
                self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
                Publish::Replaced
            }
            None => Publish::Stored,
        };
        slot.generation += 1;
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        match self.wake {
            WakePolicy::One => self.ready.notify_one(),
            WakePolicy::All => self.ready.notify_all(),
        }
        outcome
    }

    /// Consumer: block until a frame is available and remove it
    pub fn take(&self) -> Result<Frame> {
        self.take_until(None)
    }

    /// Like [`take`](Self::take) but gives up with `Error::Timeout` after `timeout`
    pub fn take_timeout(&self, timeout: Duration) -> Result<Frame> {
        self.take_until(Some(Instant::now() + timeout))
    }

    pub(crate) fn take_until(&self, deadline: Option<Instant>) -> Result<Frame> {
        let mut slot = self.lock();
        loop {
            if let Some(reason) = &slot.closed {
                return Err(reason.to_error());
            }
            if let Some(frame) = slot.frame.take() {
                self.stats.taken.fetch_add(1, Ordering::Relaxed);
                return Ok(frame);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout(self.stream));
                    }
                    (deadline - now).min(self.poll_interval)
                }
                None => self.poll_interval,
            };

            slot.waiters += 1;
            let (guard, _) = self
                .ready
                .wait_timeout(slot, wait)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
            slot.waiters -= 1;
        }
    }

    /// Close for shutdown; every blocked and later `take` fails with `Closed`
    pub fn close(&self) {
        self.close_with(CloseReason::Stopped);
    }

    /// Close after a worker fault; readers fail with `Faulted`
    pub fn fault(&self, reason: impl Into<String>) {
        self.close_with(CloseReason::Faulted(reason.into()));
    }

    fn close_with(&self, reason: CloseReason) {
        let mut slot = self.lock();
        // First reason wins: a stop after a fault keeps reporting the fault.
        if slot.closed.is_none() {
            slot.closed = Some(reason);
        }
        slot.frame = None;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// The error a `take` would fail with, if the mailbox is closed
    pub(crate) fn closed_error(&self) -> Option<Error> {
        self.lock().closed.as_ref().map(CloseReason::to_error)
    }

    /// Number of publishes so far; never decreases
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn has_frame(&self) -> bool {
        self.lock().frame.is_some()
    }

    /// Readers currently parked in `take`
    pub fn waiting(&self) -> usize {
        self.lock().waiters
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            published: self.stats.published.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use bytes::Bytes;
    use rand::Rng;

    use super::*;
    use crate::capture::{StreamFormat, DEPTH_BYTES};

    static ZEROS: [u8; DEPTH_BYTES] = [0; DEPTH_BYTES];

    fn depth_frame(timestamp: u32) -> Frame {
        Frame::from_parts(
            StreamFormat::Depth11Bit,
            timestamp,
            Bytes::from_static(&ZEROS),
        )
    }

    fn mailbox(poll: Duration, wake: WakePolicy) -> Arc<FrameMailbox> {
        Arc::new(FrameMailbox::new(Stream::Depth, poll, wake))
    }

    fn wait_for_waiters(mailbox: &FrameMailbox, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while mailbox.waiting() < count {
            assert!(Instant::now() < deadline, "readers never blocked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn last_publish_wins() {
        let mb = mailbox(Duration::from_millis(5), WakePolicy::One);
        assert_eq!(mb.publish(depth_frame(1)), Publish::Stored);
        assert_eq!(mb.publish(depth_frame(2)), Publish::Replaced);
        assert_eq!(mb.publish(depth_frame(3)), Publish::Replaced);

        assert_eq!(mb.take().unwrap().timestamp(), 3);
        assert!(!mb.has_frame());
        assert_eq!(mb.generation(), 3);
        assert_eq!(
            mb.stats(),
            MailboxStats {
                published: 3,
                taken: 1,
                overwritten: 2,
            }
        );
    }

    #[test]
    fn publish_wakes_one_reader() {
        // Long poll interval so only publish can wake the readers.
        let mb = mailbox(Duration::from_secs(30), WakePolicy::One);
        let (tx, rx) = flume::unbounded();
        for _ in 0..2 {
            let mb = Arc::clone(&mb);
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = tx.send(mb.take());
            });
        }
        wait_for_waiters(&mb, 2);

        mb.publish(depth_frame(1));
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(first.timestamp(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(mb.waiting(), 1);

        mb.publish(depth_frame(2));
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(second.timestamp(), 2);
    }

    #[test]
    fn wake_all_still_hands_each_frame_to_one_reader() {
        let mb = mailbox(Duration::from_secs(30), WakePolicy::All);
        let (tx, rx) = flume::unbounded();
        for _ in 0..3 {
            let mb = Arc::clone(&mb);
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = tx.send(mb.take());
            });
        }
        wait_for_waiters(&mb, 3);

        mb.publish(depth_frame(10));
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_ok());
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        wait_for_waiters(&mb, 2);
        mb.close();
    }

    #[test]
    fn blocked_take_is_woken_by_publish() {
        // Long poll interval: a missed notify would leave the reader asleep
        // well past the receive deadline below.
        let mut rng = rand::thread_rng();
        for round in 0..50u32 {
            let mb = mailbox(Duration::from_secs(30), WakePolicy::One);
            let (tx, rx) = flume::bounded(1);
            {
                let mb = Arc::clone(&mb);
                thread::spawn(move || {
                    let _ = tx.send(mb.take());
                });
            }
            wait_for_waiters(&mb, 1);
            thread::sleep(Duration::from_micros(rng.gen_range(0..2_000)));
            mb.publish(depth_frame(round));

            let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
            assert_eq!(frame.timestamp(), round);
            assert_eq!(mb.waiting(), 0);
        }
    }

    #[test]
    fn publish_racing_take_is_never_lost() {
        let mut rng = rand::thread_rng();
        for round in 0..50u32 {
            let mb = mailbox(Duration::from_millis(5), WakePolicy::One);
            let reader_delay = Duration::from_micros(rng.gen_range(0..2_000));
            let writer_delay = Duration::from_micros(rng.gen_range(0..2_000));

            let reader = {
                let mb = Arc::clone(&mb);
                thread::spawn(move || {
                    thread::sleep(reader_delay);
                    mb.take_timeout(Duration::from_secs(5))
                })
            };
            thread::sleep(writer_delay);
            mb.publish(depth_frame(round));

            let frame = reader.join().unwrap().unwrap();
            assert_eq!(frame.timestamp(), round);
        }
    }

    #[test]
    fn close_wakes_every_reader() {
        let mb = mailbox(Duration::from_secs(30), WakePolicy::One);
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mb = Arc::clone(&mb);
                thread::spawn(move || mb.take())
            })
            .collect();
        wait_for_waiters(&mb, 4);

        mb.close();
        for reader in readers {
            assert!(matches!(reader.join().unwrap(), Err(Error::Closed)));
        }
        assert!(matches!(mb.take(), Err(Error::Closed)));
        assert_eq!(mb.publish(depth_frame(1)), Publish::Rejected);
    }

    #[test]
    fn fault_is_reported_and_sticks() {
        let mb = mailbox(Duration::from_secs(30), WakePolicy::One);
        let reader = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.take())
        };
        wait_for_waiters(&mb, 1);

        mb.fault("usb transfer failed");
        mb.close();
        assert!(matches!(reader.join().unwrap(), Err(Error::Faulted(_))));
        assert!(matches!(mb.take(), Err(Error::Faulted(_))));
    }

    #[test]
    fn closed_mailbox_drops_pending_frame() {
        let mb = mailbox(Duration::from_millis(5), WakePolicy::One);
        mb.publish(depth_frame(1));
        mb.close();
        assert!(!mb.has_frame());
        assert!(matches!(mb.take(), Err(Error::Closed)));
    }

    #[test]
    fn deadline_bounds_the_wait() {
        let mb = mailbox(Duration::from_secs(30), WakePolicy::One);
        let started = Instant::now();
        let err = mb.take_timeout(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::Timeout(Stream::Depth)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
