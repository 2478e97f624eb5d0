use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::driver::{Display, DisplayCallback, DisplayData, DriverError, FrameBuf, SetBufSync};

/// Simulated display controller.
///
/// Cheap to clone; clones share the same scan-out state.
#[derive(Debug, Clone)]
pub struct HeadlessDisplay {
    inner: Arc<DisplayState>,
}

#[derive(Debug)]
struct DisplayState {
    scanout: Mutex<Option<FrameBuf>>,
    flips: AtomicU64,
    vblanks: AtomicU64,
    vblank_interval: Duration,
}

impl HeadlessDisplay {
    pub(super) fn new(vblank_interval: Duration) -> Self {
        Self {
            inner: Arc::new(DisplayState {
                scanout: Mutex::new(None),
                flips: AtomicU64::new(0),
                vblanks: AtomicU64::new(0),
                vblank_interval,
            }),
        }
    }

    /// The frame buffer currently being scanned out.
    pub fn scanout(&self) -> Option<FrameBuf> {
        *self.inner.scanout.lock()
    }

    /// Number of frame buffers set so far.
    pub fn flip_count(&self) -> u64 {
        self.inner.flips.load(Ordering::Acquire)
    }

    pub fn vblank_count(&self) -> u64 {
        self.inner.vblanks.load(Ordering::Acquire)
    }
}

impl Display for HeadlessDisplay {
    fn set_frame_buf(&self, frame: &FrameBuf, sync: SetBufSync) -> Result<(), DriverError> {
        if frame.width == 0 || frame.height == 0 || frame.pitch < frame.width {
            return Err(DriverError::InvalidArgument("frame buffer geometry"));
        }
        *self.inner.scanout.lock() = Some(*frame);
        self.inner.flips.fetch_add(1, Ordering::AcqRel);
        log::trace!("scanout -> {:#x} ({sync:?})", frame.base.0);
        Ok(())
    }

    fn wait_vblank_start(&self) {
        if !self.inner.vblank_interval.is_zero() {
            std::thread::sleep(self.inner.vblank_interval);
        }
        self.inner.vblanks.fetch_add(1, Ordering::AcqRel);
    }
}

/// Number of queued entries whose callback has not finished yet.
#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Bounded queue of flips consumed by a dedicated display thread.
pub(super) struct DisplayQueue {
    sender: Option<Sender<DisplayData>>,
    pending: Arc<Pending>,
    thread: Option<JoinHandle<()>>,
}

impl DisplayQueue {
    pub(super) fn spawn(max_pending: u32, mut callback: DisplayCallback) -> Result<Self, DriverError> {
        if max_pending == 0 {
            return Err(DriverError::InvalidArgument("display queue needs at least one slot"));
        }

        let (sender, receiver): (Sender<DisplayData>, Receiver<DisplayData>) =
            crossbeam_channel::bounded(max_pending as usize);
        let pending = Arc::new(Pending::default());

        let thread = {
            let pending = Arc::clone(&pending);
            std::thread::Builder::new()
                .name("presto-display".into())
                .spawn(move || {
                    for data in receiver {
                        callback(&data);
                        let mut count = pending.count.lock();
                        *count -= 1;
                        if *count == 0 {
                            pending.drained.notify_all();
                        }
                    }
                    log::debug!("display thread exiting");
                })
                .map_err(|_| DriverError::Native(-1))?
        };

        Ok(Self {
            sender: Some(sender),
            pending,
            thread: Some(thread),
        })
    }

    /// Queues an entry, blocking while the queue is full.
    pub(super) fn push(&self, data: DisplayData) -> Result<(), DriverError> {
        let sender = self.sender.as_ref().ok_or(DriverError::DisplayQueueClosed)?;
        *self.pending.count.lock() += 1;
        if sender.send(data).is_err() {
            *self.pending.count.lock() -= 1;
            return Err(DriverError::DisplayQueueClosed);
        }
        Ok(())
    }

    pub(super) fn pending(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Blocks until every queued entry has been displayed.
    pub(super) fn drain(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.drained.wait(&mut count);
        }
    }

    /// Closes the queue and joins the display thread once it has drained.
    pub(super) fn shutdown(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("display thread panicked");
            }
        }
    }
}

impl Drop for DisplayQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DisplayPixelFormat, GpuAddress};

    fn frame(base: usize) -> FrameBuf {
        FrameBuf {
            base: GpuAddress(base),
            pitch: 16,
            pixel_format: DisplayPixelFormat::A8B8G8R8,
            width: 16,
            height: 8,
        }
    }

    #[test]
    fn display_records_scanout_and_counts() {
        let display = HeadlessDisplay::new(Duration::ZERO);
        assert!(display.scanout().is_none());

        display.set_frame_buf(&frame(0x1000), SetBufSync::NextFrame).unwrap();
        display.wait_vblank_start();

        assert_eq!(display.scanout().unwrap().base, GpuAddress(0x1000));
        assert_eq!(display.flip_count(), 1);
        assert_eq!(display.vblank_count(), 1);
    }

    #[test]
    fn display_rejects_narrow_pitch() {
        let display = HeadlessDisplay::new(Duration::ZERO);
        let mut bad = frame(0x1000);
        bad.pitch = 8;
        assert!(display.set_frame_buf(&bad, SetBufSync::Immediate).is_err());
        assert_eq!(display.flip_count(), 0);
    }

    #[test]
    fn queue_runs_callbacks_in_order_and_drains() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut queue = {
            let seen = Arc::clone(&seen);
            DisplayQueue::spawn(
                2,
                Box::new(move |data: &DisplayData| seen.lock().push(data.address.0)),
            )
            .unwrap()
        };

        for base in [1usize, 2, 3, 4, 5] {
            queue.push(DisplayData { address: GpuAddress(base) }).unwrap();
        }
        queue.drain();

        assert_eq!(queue.pending(), 0);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);

        queue.shutdown();
        assert_eq!(
            queue.push(DisplayData { address: GpuAddress(6) }),
            Err(DriverError::DisplayQueueClosed)
        );
    }
}
