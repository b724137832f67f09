//! Debounce buffer for order-affecting changes.

use std::time::{Duration, Instant};

/// Collects items until the stream goes quiet for `window`, or until
/// `max_delay` has passed since the first buffered item.
#[derive(Debug)]
pub struct Coalescer<T> {
    window: Duration,
    max_delay: Duration,
    items: Vec<T>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl<T> Coalescer<T> {
    pub fn new(window: Duration, max_delay: Duration) -> Self {
        Self {
            window,
            max_delay: max_delay.max(window),
            items: Vec::new(),
            first_at: None,
            last_at: None,
        }
    }

    pub fn push(&mut self, item: T, now: Instant) {
        if self.first_at.is_none() {
            self.first_at = Some(now);
        }
        self.last_at = Some(now);
        self.items.push(item);
    }

    /// When the buffer should drain, if anything is buffered.
    pub fn deadline(&self) -> Option<Instant> {
        let first = self.first_at?;
        let last = self.last_at?;
        Some((last + self.window).min(first + self.max_delay))
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Take everything buffered, in arrival order.
    pub fn drain(&mut self) -> Vec<T> {
        self.first_at = None;
        self.last_at = None;
        std::mem::take(&mut self.items)
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.drain();
    }
}
