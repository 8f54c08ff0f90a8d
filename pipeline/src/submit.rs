use serde::{Deserialize, Serialize};

use crate::hal::{Busy, BulkIn};
use crate::{
    BufferHandle, BufferState, Census, RunState, Statistics, SubmitPool,
};

/// One buffer handed to the USB bulk-IN path.
#[derive(Debug)]
pub struct Transfer {
    pub handle: BufferHandle,
    /// Capture sequence number of the buffer.
    pub sequence: u32,
    data: *const u8,
    len: usize,
}

// Note(unsafe): The transfer only carries the location of a buffer owned by the USB hardware.
unsafe impl Send for Transfer {}

impl Transfer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The captured samples.
    ///
    /// # Safety
    /// The slice must not be used after the transfer was reported to
    /// [SubmissionSink::complete()]. The buffer is recycled for capture afterwards.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.data, self.len)
    }
}

/// Outcome of [SubmissionSink::try_submit_next()].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Submit {
    /// A transfer is already in flight.
    InFlight,
    /// No buffer is ready.
    Idle,
    /// The buffer was accepted by the USB stack.
    Submitted(BufferHandle),
    /// The USB stack could not take the buffer. It stays at the head of the ready queue.
    Busy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Complete,
    /// Aborted by a bus reset or the host.
    Aborted,
}

/// What the caller has to do with the capture side after a completed transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Resume {
    /// Capture is stopped and should be started.
    Start,
    Hold,
}

/// When capture stopped by an overrun is resumed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    /// Resume as soon as a USB transfer has returned a buffer to the pool.
    #[default]
    OnDrain,
    /// Only resume on an explicit start.
    Manual,
}

/// The submission side of the pipeline.
///
/// Owned by the USB context. Keeps at most one transfer in flight.
pub struct SubmissionSink<'a, U, const N: usize, const SIZE: usize> {
    pool: SubmitPool<'a, N, SIZE>,
    run: &'a RunState,
    usb: U,
    in_flight: Option<BufferHandle>,
    idle: bool,
    policy: RestartPolicy,
}

impl<'a, U: BulkIn, const N: usize, const SIZE: usize>
    SubmissionSink<'a, U, N, SIZE>
{
    pub(crate) fn new(
        pool: SubmitPool<'a, N, SIZE>,
        run: &'a RunState,
        usb: U,
    ) -> Self {
        Self {
            pool,
            run,
            usb,
            in_flight: None,
            idle: true,
            policy: RestartPolicy::default(),
        }
    }

    /// Hand the oldest ready buffer to USB unless a transfer is in flight.
    pub fn try_submit_next(&mut self) -> Submit {
        if self.in_flight.is_some() {
            return Submit::InFlight;
        }

        let Some(handle) = self.pool.peek_ready() else {
            self.idle = true;
            return Submit::Idle;
        };

        let slot = self.pool.slot(handle);
        slot.transition(
            handle,
            BufferState::QueuedForSubmission,
            BufferState::OwnedByUsbHardware,
        );
        let transfer = Transfer {
            handle,
            sequence: slot.sequence(),
            data: slot.data_ptr(),
            len: slot.valid(),
        };

        match self.usb.write(transfer) {
            Ok(()) => {
                // Note(unwrap): The handle was peeked and this side is the only consumer.
                let taken = self.pool.take_ready().unwrap();
                debug_assert_eq!(taken, handle);
                self.in_flight = Some(handle);
                self.idle = false;
                self.run.count_submitted();
                Submit::Submitted(handle)
            }
            Err(Busy) => {
                slot.transition(
                    handle,
                    BufferState::OwnedByUsbHardware,
                    BufferState::QueuedForSubmission,
                );
                Submit::Busy
            }
        }
    }

    /// Report the end of the transfer of `handle` and recycle the buffer.
    ///
    /// On success the next ready buffer is submitted.
    ///
    /// # Panics
    /// If `handle` is not the transfer in flight.
    pub fn complete(
        &mut self,
        handle: BufferHandle,
        status: TransferStatus,
    ) -> Resume {
        assert_eq!(
            self.in_flight,
            Some(handle),
            "Completion for {handle} not in flight"
        );
        self.in_flight = None;
        self.pool.release(handle);

        match status {
            TransferStatus::Complete => {
                self.try_submit_next();
                if self.policy == RestartPolicy::OnDrain
                    && !self.run.is_active()
                    && !self.run.is_halted()
                {
                    Resume::Start
                } else {
                    Resume::Hold
                }
            }
            TransferStatus::Aborted => {
                self.run.count_usb_error();
                log::warn!("Bulk transfer of {handle} aborted");
                Resume::Hold
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn in_flight(&self) -> Option<BufferHandle> {
        self.in_flight
    }

    pub fn ready_len(&self) -> usize {
        self.pool.ready_len()
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.policy
    }

    pub fn set_restart_policy(&mut self, policy: RestartPolicy) {
        self.policy = policy;
    }

    pub fn statistics(&self) -> Statistics {
        self.run.statistics()
    }

    pub fn census(&self) -> Census {
        self.pool.census()
    }

    pub fn usb_mut(&mut self) -> &mut U {
        &mut self.usb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_conserved, capture_one, split};
    use crate::Pipeline;

    #[test]
    fn idle_without_data() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (_engine, mut sink) = split(&mut pipeline, 2);
        assert_eq!(sink.try_submit_next(), Submit::Idle);
        assert!(sink.is_idle());
        assert!(sink.usb_mut().accepted.is_empty());
    }

    #[test]
    fn one_in_flight() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, mut sink) = split(&mut pipeline, 3);
        engine.start().unwrap();
        capture_one(&mut engine).unwrap();
        capture_one(&mut engine).unwrap();
        assert_eq!(engine.on_interrupt().harvested, 2);

        let Submit::Submitted(first) = sink.try_submit_next() else {
            panic!("nothing submitted");
        };
        assert!(!sink.is_idle());
        assert_eq!(sink.try_submit_next(), Submit::InFlight);
        assert_eq!(sink.usb_mut().accepted.len(), 1);
        assert_eq!(sink.usb_mut().accepted[0].2, 64);

        assert_eq!(
            sink.complete(first, TransferStatus::Complete),
            Resume::Hold
        );
        // The second buffer follows on completion.
        assert_eq!(sink.usb_mut().accepted.len(), 2);
        assert!(sink.in_flight().is_some());
        assert_eq!(sink.statistics().submitted, 2);
        assert_conserved(&engine, &sink);
    }

    #[test]
    fn busy_keeps_order() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, mut sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        let captured = capture_one(&mut engine).unwrap();
        engine.on_interrupt();

        sink.usb_mut().busy = true;
        assert_eq!(sink.try_submit_next(), Submit::Busy);
        assert_eq!(sink.ready_len(), 1);
        assert_eq!(sink.census().queued_for_submission, 1);

        sink.usb_mut().busy = false;
        assert_eq!(sink.try_submit_next(), Submit::Submitted(captured));
    }

    #[test]
    fn aborted_holds() {
        let mut pipeline: Pipeline<2, 64> = Pipeline::new();
        let (mut engine, mut sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        capture_one(&mut engine).unwrap();
        engine.on_interrupt();
        capture_one(&mut engine).unwrap();
        assert!(engine.on_interrupt().overrun);

        let Submit::Submitted(handle) = sink.try_submit_next() else {
            panic!("nothing submitted");
        };
        assert_eq!(
            sink.complete(handle, TransferStatus::Aborted),
            Resume::Hold
        );
        assert_eq!(sink.statistics().usb_errors, 1);
        assert_eq!(sink.census().free, 1);
        assert_conserved(&engine, &sink);
    }

    #[test]
    fn resume_after_overrun() {
        let mut pipeline: Pipeline<2, 64> = Pipeline::new();
        let (mut engine, mut sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        capture_one(&mut engine).unwrap();
        engine.on_interrupt();
        capture_one(&mut engine).unwrap();
        assert!(engine.on_interrupt().overrun);

        let Submit::Submitted(handle) = sink.try_submit_next() else {
            panic!("nothing submitted");
        };
        assert_eq!(
            sink.complete(handle, TransferStatus::Complete),
            Resume::Start
        );
        engine.start().unwrap();
        assert!(engine.is_running());

        sink.set_restart_policy(RestartPolicy::Manual);
        engine.stop();
        let handle = sink.in_flight().unwrap();
        assert_eq!(
            sink.complete(handle, TransferStatus::Complete),
            Resume::Hold
        );
    }

    #[test]
    fn stop_is_not_undone() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, mut sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        capture_one(&mut engine).unwrap();
        engine.on_interrupt();
        engine.stop();

        let Submit::Submitted(handle) = sink.try_submit_next() else {
            panic!("nothing submitted");
        };
        assert_eq!(
            sink.complete(handle, TransferStatus::Complete),
            Resume::Hold
        );
    }

    #[test]
    #[should_panic(expected = "not in flight")]
    fn stray_completion() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, mut sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        let handle = engine.pending().next().unwrap();
        let _ = sink.complete(handle, TransferStatus::Complete);
    }
}
