use heapless::spsc::{Consumer, Producer, Queue};
use serde::Serialize;

use crate::buffer::Slot;
use crate::hal::{BulkIn, CapturePeripheral, DmaChannel};
use crate::{
    BufferHandle, BufferState, CaptureEngine, Config, Error, RunState,
    SubmissionSink, MAX_BUFFERS, MAX_BUFFER_SIZE,
};

// A heapless queue of depth `D` holds `D - 1` elements.
pub(crate) const QUEUE_DEPTH: usize = MAX_BUFFERS + 1;

/// Buffer counts per state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Census {
    pub free: usize,
    pub queued_for_capture: usize,
    pub owned_by_hardware: usize,
    pub capture_done: usize,
    pub queued_for_submission: usize,
    pub owned_by_usb_hardware: usize,
}

impl Census {
    fn take<const SIZE: usize>(slots: &[Slot<SIZE>]) -> Self {
        let mut census = Self::default();
        for slot in slots {
            *census.get_mut(slot.state()) += 1;
        }
        census
    }

    fn get_mut(&mut self, state: BufferState) -> &mut usize {
        match state {
            BufferState::Free => &mut self.free,
            BufferState::QueuedForCapture => &mut self.queued_for_capture,
            BufferState::OwnedByHardware => &mut self.owned_by_hardware,
            BufferState::CaptureDone => &mut self.capture_done,
            BufferState::QueuedForSubmission => {
                &mut self.queued_for_submission
            }
            BufferState::OwnedByUsbHardware => &mut self.owned_by_usb_hardware,
        }
    }

    pub fn get(&self, state: BufferState) -> usize {
        match state {
            BufferState::Free => self.free,
            BufferState::QueuedForCapture => self.queued_for_capture,
            BufferState::OwnedByHardware => self.owned_by_hardware,
            BufferState::CaptureDone => self.capture_done,
            BufferState::QueuedForSubmission => self.queued_for_submission,
            BufferState::OwnedByUsbHardware => self.owned_by_usb_hardware,
        }
    }
}

/// The capture buffer arena and its queues.
///
/// This is meant to live in a `static` for the lifetime of the program. All access goes through
/// the two capabilities returned by [Pipeline::split].
pub struct Pipeline<const N: usize, const SIZE: usize> {
    slots: [Slot<SIZE>; N],
    free: Queue<BufferHandle, QUEUE_DEPTH>,
    ready: Queue<BufferHandle, QUEUE_DEPTH>,
    run: RunState,
}

impl<const N: usize, const SIZE: usize> Default for Pipeline<N, SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const SIZE: usize> Pipeline<N, SIZE> {
    const VALID: () = assert!(
        N > 0
            && N <= MAX_BUFFERS
            && SIZE > 0
            && SIZE <= MAX_BUFFER_SIZE
            && SIZE % 8 == 0
    );

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        Self {
            slots: [const { Slot::new() }; N],
            free: Queue::new(),
            ready: Queue::new(),
            run: RunState::new(),
        }
    }

    /// Initialize the pool and hand out the capture and submission sides.
    ///
    /// All buffers are marked free and all counters are cleared.
    pub fn split<C, D, U>(
        &mut self,
        config: Config,
        mut capture: C,
        dma: D,
        usb: U,
    ) -> Result<
        (CaptureEngine<'_, C, D, N, SIZE>, SubmissionSink<'_, U, N, SIZE>),
        Error,
    >
    where
        C: CapturePeripheral,
        D: DmaChannel,
        U: BulkIn,
    {
        config.validate(N, SIZE)?;
        capture.configure(&config.capture);

        let Self {
            slots,
            free,
            ready,
            run,
        } = self;

        *free = Queue::new();
        *ready = Queue::new();
        run.reset();
        for slot in slots.iter() {
            slot.reset();
        }

        let (mut free_producer, free_consumer) = free.split();
        let (ready_producer, ready_consumer) = ready.split();
        for index in 0..N {
            // Note(unwrap): The free queue has room for every buffer.
            free_producer.enqueue(BufferHandle::new(index)).unwrap();
        }

        let slots: &[Slot<SIZE>; N] = slots;
        let run: &RunState = run;

        let engine = CaptureEngine::new(
            CapturePool {
                slots,
                free: free_consumer,
                ready: ready_producer,
            },
            run,
            config,
            capture,
            dma,
        );
        let sink = SubmissionSink::new(
            SubmitPool {
                slots,
                ready: ready_consumer,
                free: free_producer,
            },
            run,
            usb,
        );
        Ok((engine, sink))
    }
}

/// Capture side view of the pool: takes free buffers, produces ready buffers.
pub struct CapturePool<'a, const N: usize, const SIZE: usize> {
    slots: &'a [Slot<SIZE>; N],
    free: Consumer<'a, BufferHandle, QUEUE_DEPTH>,
    ready: Producer<'a, BufferHandle, QUEUE_DEPTH>,
}

impl<'a, const N: usize, const SIZE: usize> CapturePool<'a, N, SIZE> {
    /// Take a free buffer for capture.
    ///
    /// Returns `None` if the pool is exhausted.
    pub fn acquire_free(&mut self) -> Option<BufferHandle> {
        let handle = self.free.dequeue()?;
        self.slot(handle).transition(
            handle,
            BufferState::Free,
            BufferState::QueuedForCapture,
        );
        Some(handle)
    }

    /// Queue a finished buffer for submission.
    pub(crate) fn publish(&mut self, handle: BufferHandle) {
        self.slot(handle).transition(
            handle,
            BufferState::CaptureDone,
            BufferState::QueuedForSubmission,
        );
        // Note(unwrap): Every buffer is in at most one queue and the queue holds all of them.
        self.ready.enqueue(handle).unwrap();
    }

    pub(crate) fn slot(&self, handle: BufferHandle) -> &'a Slot<SIZE> {
        &self.slots[handle.index()]
    }

    pub fn state(&self, handle: BufferHandle) -> BufferState {
        self.slot(handle).state()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn census(&self) -> Census {
        Census::take(&self.slots[..])
    }
}

/// Submission side view of the pool: consumes ready buffers, returns free buffers.
pub struct SubmitPool<'a, const N: usize, const SIZE: usize> {
    slots: &'a [Slot<SIZE>; N],
    ready: Consumer<'a, BufferHandle, QUEUE_DEPTH>,
    free: Producer<'a, BufferHandle, QUEUE_DEPTH>,
}

impl<'a, const N: usize, const SIZE: usize> SubmitPool<'a, N, SIZE> {
    pub(crate) fn peek_ready(&self) -> Option<BufferHandle> {
        self.ready.peek().copied()
    }

    pub(crate) fn take_ready(&mut self) -> Option<BufferHandle> {
        self.ready.dequeue()
    }

    /// Return a buffer from the USB hardware to the free pool.
    pub fn release(&mut self, handle: BufferHandle) {
        self.slot(handle).transition(
            handle,
            BufferState::OwnedByUsbHardware,
            BufferState::Free,
        );
        // Note(unwrap): Every buffer is in at most one queue and the queue holds all of them.
        self.free.enqueue(handle).unwrap();
    }

    pub(crate) fn slot(&self, handle: BufferHandle) -> &'a Slot<SIZE> {
        &self.slots[handle.index()]
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn census(&self) -> Census {
        Census::take(&self.slots[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        assert_conserved, config, split, MockCapture, MockDma, MockUsb,
    };

    #[test]
    fn split_frees_all() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        assert_eq!(engine.census().free, 4);
        assert_eq!(engine.free_len(), 4);
        assert_conserved(&engine, &sink);

        let pool = engine.pool_mut();
        let handles: Vec<_> =
            core::iter::from_fn(|| pool.acquire_free()).collect();
        assert_eq!(handles.len(), 4);
        assert!(pool.acquire_free().is_none());
        assert_eq!(pool.free_len(), 0);
        assert_eq!(pool.census().queued_for_capture, 4);
    }

    #[test]
    fn split_rejects_chain_length() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let result = pipeline.split(
            config(5),
            MockCapture::default(),
            MockDma::default(),
            MockUsb::default(),
        );
        assert_eq!(result.err(), Some(Error::ChainLength(5, 4)));
    }

    #[test]
    fn resplit_resets() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        {
            let (mut engine, _) = split(&mut pipeline, 2);
            engine.start().unwrap();
        }
        let (engine, _) = split(&mut pipeline, 2);
        assert_eq!(engine.census().free, 4);
        assert!(!engine.is_running());
    }
}
