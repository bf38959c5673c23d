//! Auto-scroll policy for a message view.
//!
//! The controller never touches a real view; it reads [`ScrollMetrics`] from
//! a [`ScrollSurface`] and asks it to scroll. Callers pass the current
//! instant in, so the debounce timer and the auto-scroll guard are driven by
//! whatever clock the surface uses.

use std::time::{Duration, Instant};

use crate::config::ScrollConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }
}

pub trait ScrollSurface {
    fn metrics(&self) -> ScrollMetrics;
    fn scroll_to_bottom(&mut self, smooth: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDecision {
    /// First population: jumped to the newest message
    Jumped,
    /// Smooth-scrolled to the newest message
    Followed,
    /// The user is reading older messages
    Suppressed,
    /// Our own scroll is still running
    Skipped,
    /// The list did not grow
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ScrollController {
    threshold_px: f64,
    debounce: Duration,
    user_scrolling: bool,
    auto_scrolling: bool,
    auto_scroll_deadline: Option<Instant>,
    debounce_deadline: Option<Instant>,
    last_len: usize,
    populated: bool,
}

impl Default for ScrollController {
    fn default() -> Self {
        Self::new(100.0, Duration::from_millis(300))
    }
}

impl ScrollController {
    pub fn new(threshold_px: f64, debounce: Duration) -> Self {
        Self {
            threshold_px,
            debounce,
            user_scrolling: false,
            auto_scrolling: false,
            auto_scroll_deadline: None,
            debounce_deadline: None,
            last_len: 0,
            populated: false,
        }
    }

    pub fn from_config(config: &ScrollConfig) -> Self {
        Self::new(config.threshold_px, Duration::from_millis(config.debounce_ms))
    }

    pub fn is_near_bottom(&self, metrics: &ScrollMetrics) -> bool {
        metrics.distance_from_bottom() <= self.threshold_px
    }

    pub fn is_user_scrolling(&self) -> bool {
        self.user_scrolling
    }

    pub fn is_auto_scrolling(&self) -> bool {
        self.auto_scrolling
    }

    /// When [`poll_timers`](Self::poll_timers) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.debounce_deadline, self.auto_scroll_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Feed every scroll event of the view.
    pub fn on_scroll(&mut self, surface: &impl ScrollSurface, now: Instant) {
        let metrics = surface.metrics();
        if self.auto_scrolling {
            if metrics.distance_from_bottom() <= 1.0 {
                self.end_auto_scroll();
            }
            return;
        }

        if !self.is_near_bottom(&metrics) {
            self.user_scrolling = true;
        }
        self.debounce_deadline = Some(now + self.debounce);
    }

    /// The view reports that a smooth scroll we started has ended.
    pub fn on_auto_scroll_finished(&mut self) {
        self.end_auto_scroll();
    }

    fn end_auto_scroll(&mut self) {
        self.auto_scrolling = false;
        self.auto_scroll_deadline = None;
    }

    /// Drop the auto-scroll guard once its deadline has passed, even if the
    /// animation never reported reaching the bottom.
    fn expire_auto_scroll(&mut self, now: Instant) -> bool {
        match self.auto_scroll_deadline {
            Some(deadline) if now >= deadline => {
                self.end_auto_scroll();
                true
            }
            _ => false,
        }
    }

    /// Re-evaluate once scrolling has been quiet for the debounce period and
    /// release a stale auto-scroll guard. Returns true when a timer fired.
    pub fn poll_timers(&mut self, surface: &impl ScrollSurface, now: Instant) -> bool {
        let guard_fired = self.expire_auto_scroll(now);
        let debounce_fired = match self.debounce_deadline {
            Some(deadline) if now >= deadline => {
                self.debounce_deadline = None;
                if self.is_near_bottom(&surface.metrics()) {
                    self.user_scrolling = false;
                }
                true
            }
            _ => false,
        };
        guard_fired || debounce_fired
    }

    /// React to the message list having `len` entries.
    pub fn on_messages_changed(
        &mut self,
        surface: &mut impl ScrollSurface,
        len: usize,
        now: Instant,
    ) -> ScrollDecision {
        let grew = len > self.last_len;
        self.last_len = len;
        if !grew {
            return ScrollDecision::Unchanged;
        }

        if !self.populated {
            self.populated = true;
            surface.scroll_to_bottom(false);
            return ScrollDecision::Jumped;
        }
        self.expire_auto_scroll(now);
        if self.auto_scrolling {
            return ScrollDecision::Skipped;
        }
        if self.user_scrolling || !self.is_near_bottom(&surface.metrics()) {
            return ScrollDecision::Suppressed;
        }

        self.auto_scrolling = true;
        self.auto_scroll_deadline = Some(now + self.debounce);
        surface.scroll_to_bottom(true);
        ScrollDecision::Followed
    }

    /// Forget all state; used on room change and teardown.
    pub fn reset(&mut self) {
        self.user_scrolling = false;
        self.end_auto_scroll();
        self.debounce_deadline = None;
        self.last_len = 0;
        self.populated = false;
    }
}
