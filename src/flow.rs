//! Credit-based flow control (RFC 7540 §5.2, §6.9).
//!
//! Only DATA payloads count. Each direction keeps one window per stream and
//! one for the connection; a payload may be sent only when both have room.

use crate::types::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use log::trace;

/// A window update is not allowed to push a window past 2^31-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow-control window overflow")]
pub struct WindowOverflow;

/// A signed flow-control window. SETTINGS_INITIAL_WINDOW_SIZE changes may
/// drive it negative; a negative window simply admits nothing until enough
/// WINDOW_UPDATE credit arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window(i32);

impl Window {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self(initial as i32)
    }

    /// Octets that may currently be sent (or received) against this window.
    #[must_use]
    pub fn available(self) -> usize {
        if self.0 > 0 {
            self.0 as usize
        } else {
            0
        }
    }

    /// Applies a WINDOW_UPDATE increment.
    pub fn grow(&mut self, increment: u32) -> Result<(), WindowOverflow> {
        let grown = i64::from(self.0) + i64::from(increment);
        if grown > i64::from(MAX_WINDOW_SIZE) {
            return Err(WindowOverflow);
        }
        self.0 = grown as i32;
        Ok(())
    }

    /// Accounts for `n` octets of DATA. Callers check `available` first.
    pub fn consume(&mut self, n: usize) {
        self.0 -= n as i32;
    }

    /// Applies a SETTINGS_INITIAL_WINDOW_SIZE delta. The result may be
    /// negative but can never overflow: both operands are within 2^31-1.
    pub fn adjust(&mut self, delta: i64) {
        self.0 = (i64::from(self.0) + delta) as i32;
    }
}

/// Replenish policy for receive windows: once more than half the initial
/// credit is consumed, top back up to the initial value in one update.
#[must_use]
pub fn replenish(window: &mut Window, initial: u32) -> Option<u32> {
    let available = window.available();
    if available >= (initial / 2) as usize {
        return None;
    }
    let increment = initial - available as u32;
    window
        .grow(increment)
        .expect("replenish stays within the initial window");
    Some(increment)
}

/// The connection-level window pair. Stream windows live on the streams.
#[derive(Debug)]
pub struct FlowController {
    pub send: Window,
    pub recv: Window,
}

impl FlowController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            send: Window::new(DEFAULT_WINDOW_SIZE),
            recv: Window::new(DEFAULT_WINDOW_SIZE),
        }
    }

    /// Accounts for an inbound DATA payload and yields the WINDOW_UPDATE
    /// increment to send on stream 0, if the window ran low.
    pub fn on_data_received(&mut self, n: usize) -> Option<u32> {
        self.recv.consume(n);
        let increment = replenish(&mut self.recv, DEFAULT_WINDOW_SIZE);
        if let Some(increment) = increment {
            trace!("connection recv window low, replenishing by {}", increment);
        }
        increment
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_past_the_ceiling_overflows() {
        let mut window = Window::new(MAX_WINDOW_SIZE - 10);
        assert_eq!(window.grow(11), Err(WindowOverflow));
        assert_eq!(window.grow(10), Ok(()));
        assert_eq!(window.available(), MAX_WINDOW_SIZE as usize);
    }

    #[test]
    fn settings_delta_may_go_negative() {
        let mut window = Window::new(100);
        window.consume(100);
        window.adjust(-50);
        assert_eq!(window.available(), 0);
        window.grow(60).unwrap();
        assert_eq!(window.available(), 10);
    }

    #[test]
    fn replenish_triggers_below_half() {
        let mut window = Window::new(DEFAULT_WINDOW_SIZE);
        window.consume(10_000);
        assert_eq!(replenish(&mut window, DEFAULT_WINDOW_SIZE), None);
        window.consume(30_000);
        assert_eq!(
            replenish(&mut window, DEFAULT_WINDOW_SIZE),
            Some(40_000)
        );
        assert_eq!(window.available(), DEFAULT_WINDOW_SIZE as usize);
    }
}
