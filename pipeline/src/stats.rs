use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use serde::Serialize;

/// Run flags and counters shared by both sides of the pipeline.
#[derive(Default)]
pub struct RunState {
    active: AtomicBool,
    halted: AtomicBool,
    completed: AtomicU32,
    interrupts: AtomicU32,
    overruns: AtomicU32,
    submitted: AtomicU32,
    usb_errors: AtomicU32,
    dma_errors: AtomicU32,
    starved: AtomicU32,
}

/// A snapshot of the pipeline counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub active: bool,
    pub completed: u32,
    pub interrupts: u32,
    pub overruns: u32,
    pub submitted: u32,
    pub usb_errors: u32,
    pub dma_errors: u32,
    pub starved: u32,
}

fn bump(counter: &AtomicU32, n: u32) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl RunState {
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            completed: AtomicU32::new(0),
            interrupts: AtomicU32::new(0),
            overruns: AtomicU32::new(0),
            submitted: AtomicU32::new(0),
            usb_errors: AtomicU32::new(0),
            dma_errors: AtomicU32::new(0),
            starved: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.active.store(false, Ordering::Release);
        self.halted.store(false, Ordering::Release);
        for counter in [
            &self.completed,
            &self.interrupts,
            &self.overruns,
            &self.submitted,
            &self.usb_errors,
            &self.dma_errors,
            &self.starved,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Capture was stopped explicitly and must not be resumed implicitly.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::Release);
    }

    pub(crate) fn count_completed(&self, n: u32) {
        bump(&self.completed, n)
    }

    pub(crate) fn count_interrupt(&self) {
        bump(&self.interrupts, 1)
    }

    pub(crate) fn count_overrun(&self) {
        bump(&self.overruns, 1)
    }

    pub(crate) fn count_submitted(&self) {
        bump(&self.submitted, 1)
    }

    pub(crate) fn count_usb_error(&self) {
        bump(&self.usb_errors, 1)
    }

    pub(crate) fn count_dma_error(&self) {
        bump(&self.dma_errors, 1)
    }

    pub(crate) fn count_starved(&self) {
        bump(&self.starved, 1)
    }

    pub fn statistics(&self) -> Statistics {
        Statistics {
            active: self.is_active(),
            completed: self.completed.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            usb_errors: self.usb_errors.load(Ordering::Relaxed),
            dma_errors: self.dma_errors.load(Ordering::Relaxed),
            starved: self.starved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears() {
        let run = RunState::new();
        run.set_active(true);
        run.count_overrun();
        run.count_completed(3);
        assert_eq!(run.statistics().completed, 3);
        run.reset();
        assert_eq!(run.statistics(), Statistics::default());
    }
}
