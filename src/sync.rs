//! Frame handoff between the producer thread and the render thread.
//!
//! The producer publishes a frame by calling [`FrameLink::notify_present_ready`]
//! at the end of `end_paint`; the render thread drains the notification
//! with [`FrameLink::wait_present_ready`] before locking the payload and
//! presenting. The payload mutex is only held inside
//! `start_paint..end_paint` on one side and inside `present` on the other.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::payload::RenderPayload;

pub struct FrameLink {
    pub payload: Mutex<RenderPayload>,
    present_ready: Mutex<bool>,
    condvar: Condvar,
}

impl FrameLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            payload: Mutex::new(RenderPayload::new()),
            present_ready: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    /// Signal the render thread that a new frame is ready.
    pub fn notify_present_ready(&self) {
        let mut ready = self.present_ready.lock();
        *ready = true;
        self.condvar.notify_one();
    }

    /// Block up to `timeout` for a new frame. Returns whether one was
    /// published; the flag is drained either way so spurious wakeups
    /// don't double-present.
    pub fn wait_present_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.present_ready.lock();
        if !*ready {
            let _ = self.condvar.wait_for(&mut ready, timeout);
        }
        std::mem::take(&mut *ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn notify_wakes_waiter() {
        let link = FrameLink::new();
        let l2 = Arc::clone(&link);
        let t = std::thread::spawn(move || {
            l2.wait_present_ready(Duration::from_secs(5))
        });
        // Give the waiter a moment to park, then publish.
        std::thread::sleep(Duration::from_millis(20));
        link.notify_present_ready();
        assert!(t.join().expect("waiter thread"));
    }

    #[test]
    fn wait_times_out_without_frame() {
        let link = FrameLink::new();
        let start = Instant::now();
        assert!(!link.wait_present_ready(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn ready_flag_drains_on_wait() {
        let link = FrameLink::new();
        link.notify_present_ready();
        assert!(link.wait_present_ready(Duration::from_millis(1)));
        assert!(!link.wait_present_ready(Duration::from_millis(1)));
    }
}
