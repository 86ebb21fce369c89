//! Per-node timeout accounting.
//!
//! A node can look healthy at the socket level while every operation sent
//! to it times out. The tracker keeps three signals that let the engine force
//! a reconnect in that case:
//!
//! - the number of continuous timeouts (reset by any success)
//! - the timeout ratio over the last [`RATIO_WINDOW`] outcomes
//! - how long timeouts have persisted without a success

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::TimeoutThresholds;

/// Outcomes kept for the ratio check.
pub const RATIO_WINDOW: usize = 100;

#[derive(Debug, Default)]
pub struct TimeoutTracker {
    continuous: u32,
    first_timeout: Option<Instant>,
    window: VecDeque<bool>,
    timeouts_in_window: usize,
}

impl TimeoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_timeout(&mut self, now: Instant) {
        self.continuous = self.continuous.saturating_add(1);
        self.first_timeout.get_or_insert(now);
        self.push(true);
    }

    pub fn record_success(&mut self) {
        self.continuous = 0;
        self.first_timeout = None;
        self.push(false);
    }

    fn push(&mut self, timed_out: bool) {
        if self.window.len() == RATIO_WINDOW && self.window.pop_front() == Some(true) {
            self.timeouts_in_window -= 1;
        }
        self.window.push_back(timed_out);
        if timed_out {
            self.timeouts_in_window += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn continuous(&self) -> u32 {
        self.continuous
    }

    /// Timeout percentage over the window, once the window is full.
    pub fn ratio(&self) -> Option<u32> {
        (self.window.len() == RATIO_WINDOW)
            .then(|| (self.timeouts_in_window * 100 / RATIO_WINDOW) as u32)
    }

    /// Describes the first exceeded threshold, if any.
    pub fn breach(&self, thresholds: &TimeoutThresholds, now: Instant) -> Option<String> {
        if thresholds.continuous > 0 && self.continuous > thresholds.continuous {
            return Some(format!("{} continuous timeouts", self.continuous));
        }
        if thresholds.ratio_percent > 0 {
            if let Some(ratio) = self.ratio().filter(|r| *r > thresholds.ratio_percent) {
                return Some(format!("timeout ratio {}%", ratio));
            }
        }
        if !thresholds.duration.is_zero() && self.continuous > 0 {
            if let Some(since) = self.first_timeout {
                let elapsed = now.saturating_duration_since(since);
                if elapsed >= thresholds.duration {
                    return Some(format!("timing out for {:?}", elapsed));
                }
            }
        }
        None
    }
}
