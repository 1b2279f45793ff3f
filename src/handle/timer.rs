//! `HandleTime`: a handle with no OS FD, driven entirely by the loop's
//! [`TimerWheel`](crate::timer::TimerWheel) (spec §3, §4.4).

use crate::handle::HandleId;
use crate::timer::TimerKey;

/// Callback invoked when a timer fires. Returning `0` continues the timer
/// (if repeats remain); nonzero requests close (spec §4.4).
pub type TimerCallback = Box<dyn FnMut(HandleId) -> i32>;

pub struct TimerState {
    pub first_gap: i64,
    pub gap: i64,
    /// `< 0` fires forever, `0` removes after the first fire, `> 0`
    /// decrements on each fire.
    pub repeat: i64,
    pub callback: Option<TimerCallback>,
    pub key: Option<TimerKey>,
}

impl TimerState {
    pub fn new(first_gap: i64, gap: i64, repeat: i64, callback: TimerCallback) -> TimerState {
        TimerState {
            first_gap,
            gap,
            repeat,
            callback: Some(callback),
            key: None,
        }
    }

    /// `true` while the timer should remain on the wheel (invariant:
    /// `OPEN && !CLOSING && callback != null`, checked by the caller).
    pub fn has_repeats_left(&self) -> bool {
        self.repeat != 0
    }

    pub fn consume_repeat(&mut self) {
        if self.repeat > 0 {
            self.repeat -= 1;
        }
    }
}
