//! Latest-frame slot shared between the capture callback and the consumer.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::capture::frame::Frame;
use crate::capture::timecode::TimecodeBundle;

/// Holds at most one unread frame with its timecodes.
///
/// The lock is only ever held to swap a finished frame in or copy one out;
/// nothing else can reach the guarded state.
pub struct FrameSlot {
    inner: Mutex<SlotState>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct SlotState {
    frame: Frame,
    timecodes: TimecodeBundle,
    dirty: bool,
}

#[derive(Default)]
struct Stats {
    frames_published: AtomicU64,
    frames_fetched: AtomicU64,
    frames_overwritten: AtomicU64,
}

/// Counters for one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotStats {
    pub published: u64,
    pub fetched: u64,
    /// Unread frames replaced by a newer arrival
    pub overwritten: u64,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotState::default()),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: swap a fully written frame and its timecodes into the slot.
    ///
    /// On return `frame` and `timecodes` hold the previous slot contents,
    /// ready to be reused as scratch space. Returns true if an unread frame
    /// was overwritten.
    pub fn publish(&self, frame: &mut Frame, timecodes: &mut TimecodeBundle) -> bool {
        let overwritten = {
            let mut state = self.inner.lock();
            std::mem::swap(&mut state.frame, frame);
            std::mem::swap(&mut state.timecodes, timecodes);
            std::mem::replace(&mut state.dirty, true)
        };

        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        if overwritten {
            self.stats.frames_overwritten.fetch_add(1, Ordering::Relaxed);
        }
        overwritten
    }

    /// Consumer: copy the frame out if it has not been read yet.
    ///
    /// Never waits for new data; returns false immediately when nothing new
    /// has arrived since the last successful fetch.
    pub fn fetch(&self, out: &mut Frame, timecodes: Option<&mut TimecodeBundle>) -> bool {
        let mut state = self.inner.lock();
        if !state.dirty {
            return false;
        }
        out.copy_from(&state.frame);
        if let Some(tc) = timecodes {
            tc.copy_from(&state.timecodes);
        }
        state.dirty = false;
        drop(state);

        self.stats.frames_fetched.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn has_unread(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Mark any held frame as read, e.g. when a new capture session starts.
    pub fn discard(&self) {
        self.inner.lock().dirty = false;
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            published: self.stats.frames_published.load(Ordering::Relaxed),
            fetched: self.stats.frames_fetched.load(Ordering::Relaxed),
            overwritten: self.stats.frames_overwritten.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    fn filled(value: u8) -> Frame {
        Frame::from_bytes(&[value; 16], 2, 2, 8, PixelFormat::Bgra8Bit).unwrap()
    }

    #[test]
    fn test_fetch_empty_slot() {
        let slot = FrameSlot::new();
        let mut out = Frame::default();
        assert!(!slot.fetch(&mut out, None));
        assert!(out.is_empty());
    }

    #[test]
    fn test_fetch_consumes_once() {
        let slot = FrameSlot::new();
        let mut frame = filled(3);
        let mut tc = TimecodeBundle::default();
        assert!(!slot.publish(&mut frame, &mut tc));

        let mut out = Frame::default();
        assert!(slot.fetch(&mut out, None));
        assert_eq!(out.as_bytes(), &[3; 16]);
        assert!(!slot.fetch(&mut out, None));
        assert_eq!(out.as_bytes(), &[3; 16]);
    }

    #[test]
    fn test_publish_overwrites_unread() {
        let slot = FrameSlot::new();
        let mut tc = TimecodeBundle::default();
        assert!(!slot.publish(&mut filled(1), &mut tc));
        assert!(slot.publish(&mut filled(2), &mut tc));

        let mut out = Frame::default();
        assert!(slot.fetch(&mut out, None));
        assert_eq!(out.as_bytes(), &[2; 16]);

        let stats = slot.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.overwritten, 1);
        assert_eq!(stats.fetched, 1);
    }

    #[test]
    fn test_publish_returns_previous_as_scratch() {
        let slot = FrameSlot::new();
        let mut tc = TimecodeBundle::default();
        let mut scratch = filled(1);
        slot.publish(&mut scratch, &mut tc);
        assert!(scratch.is_empty());

        let mut scratch = filled(2);
        slot.publish(&mut scratch, &mut tc);
        assert_eq!(scratch.as_bytes(), &[1; 16]);
    }

    #[test]
    fn test_discard() {
        let slot = FrameSlot::new();
        slot.publish(&mut filled(1), &mut TimecodeBundle::default());
        assert!(slot.has_unread());
        slot.discard();
        assert!(!slot.fetch(&mut Frame::default(), None));
    }
}
