use arbitrary_int::u6;
use core::sync::atomic::{fence, Ordering};

use crate::chain::PendingChain;
use crate::descriptor::{AddressMode, Descriptor, TransferMode};
use crate::hal::{
    CaptureConfig, CapturePeripheral, DmaChannel, FlowControl, Status,
};
use crate::{
    BufferHandle, BufferState, CapturePool, Census, Error, RunState,
    Statistics,
};

/// Capture configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Config {
    /// Number of buffers kept linked into the descriptor list.
    pub chain_length: usize,
    pub capture: CaptureConfig,
    /// Bytes moved per DMA request. Must match the peripheral FIFO threshold.
    pub request_len: u8,
    /// DMA request line of the capture peripheral.
    pub trigger: u6,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain_length: 8,
            capture: CaptureConfig::default(),
            request_len: 32,
            trigger: u6::new(22),
        }
    }
}

impl Config {
    /// Check the configuration against a pool of `buffers` buffers of `size` bytes.
    pub fn validate(&self, buffers: usize, size: usize) -> Result<(), Error> {
        if !(1..=buffers).contains(&self.chain_length) {
            return Err(Error::ChainLength(self.chain_length, buffers));
        }
        let len = self.request_len as usize;
        if !(1..=128).contains(&len)
            || size % len != 0
            || len % self.capture.width.bytes() != 0
        {
            return Err(Error::RequestLength(len, size));
        }
        Ok(())
    }

    fn transfer_mode(&self) -> TransferMode {
        TransferMode {
            width: self.capture.width,
            request_len: self.request_len,
            trigger: self.trigger,
        }
    }
}

/// Outcome of one DMA interrupt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    /// Buffers handed to the submission side.
    pub harvested: usize,
    /// Buffers linked into the list.
    pub refilled: usize,
    /// The list ran dry and capture stopped.
    pub overrun: bool,
    /// The DMA channel reported a transfer error and capture stopped.
    pub error: bool,
}

/// The capture side of the pipeline.
///
/// Owns the capture peripheral, the DMA channel and the list of buffers queued for capture. This
/// is driven from the DMA interrupt and from task context while capture is stopped.
pub struct CaptureEngine<'a, C, D, const N: usize, const SIZE: usize> {
    pool: CapturePool<'a, N, SIZE>,
    chain: PendingChain<N>,
    run: &'a RunState,
    config: Config,
    mode: TransferMode,
    capture: C,
    dma: D,
    sequence: u32,
}

impl<'a, C, D, const N: usize, const SIZE: usize>
    CaptureEngine<'a, C, D, N, SIZE>
where
    C: CapturePeripheral,
    D: DmaChannel,
{
    pub(crate) fn new(
        pool: CapturePool<'a, N, SIZE>,
        run: &'a RunState,
        config: Config,
        capture: C,
        dma: D,
    ) -> Self {
        Self {
            pool,
            chain: PendingChain::new(),
            run,
            mode: config.transfer_mode(),
            config,
            capture,
            dma,
            sequence: 0,
        }
    }

    /// Top up the descriptor list to the configured chain length.
    ///
    /// Does less work if the pool runs out of free buffers.
    ///
    /// # Returns
    /// The number of buffers linked.
    pub fn refill(&mut self) -> usize {
        let fifo = self.capture.fifo_address();
        let mut added = 0;

        while self.chain.len() < self.config.chain_length {
            let Some(handle) = self.pool.acquire_free() else {
                self.run.count_starved();
                break;
            };

            let slot = self.pool.slot(handle);
            slot.set_sequence(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            let node = slot.descriptor();
            node.populate(fifo, slot.dma_address(), SIZE, &self.mode);

            // The node has to be complete in memory before the link makes it reachable.
            fence(Ordering::Release);

            let tail = self.chain.back().map(|tail| self.pool.slot(tail));
            let reachable = self.run.is_active()
                && tail.is_some_and(|t| {
                    t.state() == BufferState::OwnedByHardware
                });
            critical_section::with(|_| {
                if let Some(tail) = tail {
                    tail.descriptor().link(node);
                    if reachable {
                        self.dma.append(node);
                    }
                }
            });

            self.chain.push_back(handle);
            if reachable {
                slot.transition(
                    handle,
                    BufferState::QueuedForCapture,
                    BufferState::OwnedByHardware,
                );
            }
            added += 1;
        }

        added
    }

    /// Start capturing.
    ///
    /// # Returns
    /// [Error::Busy] if capture is running, [Error::NoBuffers] if no buffer could be queued.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.run.is_active() {
            return Err(Error::Busy);
        }

        self.refill();
        let head = self.chain.front().ok_or(Error::NoBuffers)?;

        // Nodes queued while stopped become reachable with the head.
        for handle in self.chain.iter() {
            let slot = self.pool.slot(handle);
            if slot.state() == BufferState::QueuedForCapture {
                slot.transition(
                    handle,
                    BufferState::QueuedForCapture,
                    BufferState::OwnedByHardware,
                );
            }
        }

        self.dma.disable();
        self.dma.status();
        self.dma.set_descriptor(self.pool.slot(head).descriptor());
        self.dma.set_source_address(self.capture.fifo_address());
        self.dma
            .set_transfer_mode(AddressMode::Fixed, AddressMode::Increment);
        self.dma.set_flow_control(FlowControl::Peripheral {
            request: self.config.trigger,
        });
        self.dma.listen(Status::all());

        self.run.set_halted(false);
        self.run.set_active(true);
        self.dma.enable();
        self.capture.enable_receiver();

        log::info!("Capture started, {} buffers queued", self.chain.len());
        Ok(())
    }

    /// Stop capturing. Buffers that were already filled are handed on for submission.
    ///
    /// A partially filled buffer stays at the head of the list and is captured again from its
    /// start on the next [CaptureEngine::start()].
    pub fn stop(&mut self) {
        let was_active = critical_section::with(|_| {
            let active = self.run.is_active();
            self.run.set_active(false);
            self.run.set_halted(true);
            active
        });

        self.capture.disable_receiver();
        self.dma.disable();
        self.dma.status();
        self.harvest();

        if was_active {
            log::info!("Capture stopped");
        }
    }

    /// Service the DMA interrupt.
    pub fn on_interrupt(&mut self) -> Completion {
        self.run.count_interrupt();
        let status = self.dma.status();
        let mut completion = Completion::default();

        // Both flags may be latched by the same interrupt. Each is accounted.
        if status.chain_exhausted() && self.run.is_active() {
            self.run.count_overrun();
            completion.overrun = true;
        }

        if status.transfer_error() {
            self.run.count_dma_error();
            completion.error = true;
            log::error!("Capture DMA transfer error");
        }

        if completion.overrun || completion.error {
            critical_section::with(|_| self.run.set_active(false));
            self.capture.disable_receiver();
        }

        if !status.is_empty() {
            completion.harvested = self.harvest();
        }

        if completion.overrun {
            log::warn!(
                "Capture overrun, {} buffers free",
                self.pool.free_len()
            );
        }

        if status.buffer_complete() && self.run.is_active() {
            completion.refilled = self.refill();
        }

        completion
    }

    /// Hand buffers the channel has moved past to the submission side, in order.
    ///
    /// The channel position decides: a buffer is finished once the channel points at its end or
    /// into a buffer queued after it. Nothing is harvested while the position matches no queued
    /// buffer.
    fn harvest(&mut self) -> usize {
        let position = self.dma.destination_address();
        let mut finished = 0;
        for (index, handle) in self.chain.iter().enumerate() {
            let node = self.pool.slot(handle).descriptor();
            if self.pool.state(handle) != BufferState::OwnedByHardware {
                break;
            }
            let (start, end) = (node.registers().cdar, node.end_address());
            if (start..end).contains(&position) {
                finished = index;
                break;
            }
            if end == position {
                finished = index + 1;
                break;
            }
        }

        for _ in 0..finished {
            // Note(unwrap): `finished` never exceeds the list length.
            let handle = self.chain.pop_front().unwrap();
            let slot = self.pool.slot(handle);
            slot.set_valid(SIZE);
            slot.transition(
                handle,
                BufferState::OwnedByHardware,
                BufferState::CaptureDone,
            );
            self.pool.publish(handle);
        }
        self.run.count_completed(finished as u32);
        finished
    }

    /// Apply a new configuration. Only possible while capture is stopped.
    pub fn reconfigure(&mut self, config: Config) -> Result<(), Error> {
        if self.run.is_active() {
            return Err(Error::Busy);
        }
        config.validate(N, SIZE)?;

        self.capture.configure(&config.capture);
        self.mode = config.transfer_mode();
        self.config = config;

        let fifo = self.capture.fifo_address();
        let mut previous: Option<&Descriptor> = None;
        for handle in self.chain.iter() {
            let slot = self.pool.slot(handle);
            let node = slot.descriptor();
            node.populate(fifo, slot.dma_address(), SIZE, &self.mode);
            if let Some(previous) = previous {
                previous.link(node);
            }
            previous = Some(node);
        }
        Ok(())
    }

    /// Apply a new configuration, pausing capture while it is running.
    ///
    /// Capture is resumed afterwards. If `config` is rejected it resumes with the previous
    /// configuration and the rejection is returned.
    pub fn apply(&mut self, config: Config) -> Result<(), Error> {
        let running = self.run.is_active();
        if running {
            self.stop();
        }
        let result = self.reconfigure(config);
        if running {
            self.start()?;
        }
        result
    }

    pub fn is_running(&self) -> bool {
        self.run.is_active()
    }

    pub fn statistics(&self) -> Statistics {
        self.run.statistics()
    }

    pub fn census(&self) -> Census {
        self.pool.census()
    }

    /// Buffers in the free queue.
    pub fn free_len(&self) -> usize {
        self.pool.free_len()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Buffers queued for capture, in capture order.
    pub fn pending(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.chain.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.chain.len()
    }

    pub fn descriptor(&self, handle: BufferHandle) -> &'a Descriptor {
        self.pool.slot(handle).descriptor()
    }

    pub fn pool_mut(&mut self) -> &mut CapturePool<'a, N, SIZE> {
        &mut self.pool
    }

    pub fn capture_mut(&mut self) -> &mut C {
        &mut self.capture
    }

    pub fn dma_mut(&mut self) -> &mut D {
        &mut self.dma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_conserved, capture_one, config, split};
    use crate::Pipeline;

    #[test]
    fn double_start() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        let census = engine.census();
        let pending = engine.pending_len();
        assert_eq!(engine.start(), Err(Error::Busy));
        assert_eq!(engine.census(), census);
        assert_eq!(engine.pending_len(), pending);
        assert!(engine.is_running());
    }

    #[test]
    fn start_arms_head() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 3);
        engine.start().unwrap();

        let head = engine.pending().next().unwrap();
        let address = engine.descriptor(head).address();
        let dma = engine.dma_mut();
        assert!(dma.enabled);
        assert_eq!(dma.head, Some(address));
        assert_eq!(
            dma.mode,
            Some((AddressMode::Fixed, AddressMode::Increment))
        );
        assert_eq!(dma.listening, Status::all());
        assert!(engine.capture_mut().receiving);
        assert_eq!(engine.census().owned_by_hardware, 3);

        // Links follow capture order and the tail terminates the list.
        let handles: Vec<_> = engine.pending().collect();
        for pair in handles.windows(2) {
            assert_eq!(
                engine.descriptor(pair[0]).next_address(),
                engine.descriptor(pair[1]).address()
            );
        }
        assert_eq!(engine.descriptor(handles[2]).next_address(), 0);
    }

    #[test]
    fn no_buffers() {
        let mut pipeline: Pipeline<2, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        let pool = engine.pool_mut();
        while pool.acquire_free().is_some() {}
        assert_eq!(engine.start(), Err(Error::NoBuffers));
        assert!(!engine.is_running());
        assert!(!engine.dma_mut().enabled);
    }

    #[test]
    fn refill_exhausted_pool() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        let pool = engine.pool_mut();
        let taken: Vec<_> =
            core::iter::from_fn(|| pool.acquire_free()).collect();
        assert_eq!(taken.len(), 4);

        assert_eq!(engine.refill(), 0);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(engine.census().queued_for_capture, 4);
        assert_eq!(engine.statistics().starved, 1);
    }

    #[test]
    fn refill_idempotent() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        assert_eq!(engine.refill(), 2);
        let census = engine.census();
        assert_eq!(engine.refill(), 0);
        assert_eq!(engine.pending_len(), 2);
        assert_eq!(engine.census(), census);
        assert_eq!(engine.statistics().starved, 0);
        assert_conserved(&engine, &sink);
    }

    #[test]
    fn appends_while_running() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        assert_eq!(engine.dma_mut().appended, 0);

        capture_one(&mut engine).unwrap();
        let completion = engine.on_interrupt();
        assert_eq!(completion.harvested, 1);
        assert_eq!(completion.refilled, 1);
        assert_eq!(engine.dma_mut().appended, 1);
        assert_eq!(engine.census().owned_by_hardware, 2);
        assert_conserved(&engine, &sink);

        // The channel picked up the new tail.
        let tail = engine.pending().last().unwrap();
        let address = engine.descriptor(tail).address();
        assert_eq!(engine.dma_mut().link, address);
    }

    #[test]
    fn filling_buffer_is_kept() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.start().unwrap();

        // The first block is done and the channel is part way into the second.
        capture_one(&mut engine).unwrap();
        engine.dma_mut().position += 32;
        assert_eq!(engine.on_interrupt().harvested, 1);

        let filling = engine.pending().next().unwrap();
        assert_eq!(
            engine.pool_mut().state(filling),
            BufferState::OwnedByHardware
        );

        // Another block interrupt without progress to the end of the buffer.
        engine
            .dma_mut()
            .raise(Status::new_with_raw_value(0).with_buffer_complete(true));
        assert_eq!(engine.on_interrupt().harvested, 0);
        assert_eq!(engine.pending().next(), Some(filling));
        assert_eq!(engine.statistics().completed, 1);
        assert_conserved(&engine, &sink);
    }

    #[test]
    fn lost_append_is_not_harvested() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.start().unwrap();

        capture_one(&mut engine).unwrap();
        engine.dma_mut().ignore_append = true;
        assert_eq!(engine.on_interrupt().refilled, 1);
        let late = engine.pending().last().unwrap();

        // The channel ends the list before it sees the new tail.
        capture_one(&mut engine).unwrap();
        let completion = engine.on_interrupt();
        assert!(completion.overrun);
        assert_eq!(completion.harvested, 1);
        assert_eq!(engine.pending().collect::<Vec<_>>(), [late]);
        assert_eq!(engine.census().queued_for_submission, 2);
        assert_conserved(&engine, &sink);

        // Restarting resumes at the node that was never run.
        engine.dma_mut().ignore_append = false;
        engine.start().unwrap();
        let address = engine.descriptor(late).address();
        assert_eq!(engine.dma_mut().head, Some(address));
    }

    #[test]
    fn overrun() {
        let mut pipeline: Pipeline<2, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.start().unwrap();

        // Nothing is returned by USB: the list runs dry.
        capture_one(&mut engine).unwrap();
        engine.on_interrupt();
        capture_one(&mut engine).unwrap();
        let completion = engine.on_interrupt();
        assert!(completion.overrun);
        assert_eq!(completion.harvested, 1);
        assert!(!engine.is_running());
        assert!(!engine.capture_mut().receiving);
        assert_eq!(engine.statistics().overruns, 1);
        assert_eq!(engine.statistics().completed, 2);
        assert_eq!(engine.census().queued_for_submission, 2);
        assert_conserved(&engine, &sink);

        assert_eq!(engine.on_interrupt(), Completion::default());
        assert_eq!(engine.statistics().overruns, 1);
    }

    #[test]
    fn dma_error_stops() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        engine
            .dma_mut()
            .raise(Status::new_with_raw_value(0).with_transfer_error(true));
        let completion = engine.on_interrupt();
        assert!(completion.error);
        assert!(!completion.overrun);
        assert!(!engine.is_running());
        assert_eq!(engine.statistics().dma_errors, 1);
        assert_eq!(engine.statistics().overruns, 0);

        // The chain is intact and can be restarted.
        engine.start().unwrap();
        assert_eq!(engine.pending_len(), 2);
    }

    #[test]
    fn error_with_exhausted_list() {
        let mut pipeline: Pipeline<2, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        capture_one(&mut engine).unwrap();
        engine.on_interrupt();

        // The last block ends and the channel reports an error in the same interrupt.
        capture_one(&mut engine).unwrap();
        engine
            .dma_mut()
            .raise(Status::new_with_raw_value(0).with_transfer_error(true));
        let completion = engine.on_interrupt();
        assert!(completion.error);
        assert!(completion.overrun);
        assert_eq!(completion.harvested, 1);
        assert!(!engine.is_running());
        assert!(!engine.capture_mut().receiving);
        assert_eq!(engine.statistics().dma_errors, 1);
        assert_eq!(engine.statistics().overruns, 1);
        assert_conserved(&engine, &sink);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.stop();
        engine.start().unwrap();
        capture_one(&mut engine).unwrap();
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(!engine.dma_mut().enabled);
        assert!(!engine.capture_mut().receiving);
        // The finished buffer was not lost.
        assert_eq!(engine.census().queued_for_submission, 1);
        assert_eq!(engine.pending_len(), 1);
        assert_conserved(&engine, &sink);

        engine.start().unwrap();
        assert_eq!(engine.pending_len(), 2);
        assert_eq!(engine.census().owned_by_hardware, 2);
    }

    #[test]
    fn stop_keeps_partial_buffer() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        let head = engine.pending().next().unwrap();

        engine.dma_mut().position += 32;
        engine.stop();
        assert_eq!(engine.census().queued_for_submission, 0);
        assert_eq!(engine.pending().next(), Some(head));
        assert_conserved(&engine, &sink);

        // The buffer is captured again from its start.
        engine.start().unwrap();
        let start = engine.descriptor(head).registers().cdar;
        assert_eq!(engine.dma_mut().position, start);
    }

    #[test]
    fn reconfigure() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        engine.start().unwrap();
        assert_eq!(engine.reconfigure(config(3)), Err(Error::Busy));
        engine.stop();

        let mut bad = config(2);
        bad.request_len = 48;
        assert_eq!(
            engine.reconfigure(bad),
            Err(Error::RequestLength(48, 64))
        );

        engine.reconfigure(config(4)).unwrap();
        assert_eq!(engine.capture_mut().configured, Some(config(4).capture));
        engine.start().unwrap();
        assert_eq!(engine.pending_len(), 4);
    }

    #[test]
    fn rejected_config_keeps_running() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        engine.start().unwrap();

        for chain_length in [0, 40] {
            assert_eq!(
                engine.apply(config(chain_length)),
                Err(Error::ChainLength(chain_length, 4))
            );
            assert!(engine.is_running());
            assert!(engine.capture_mut().receiving);
            assert_eq!(engine.config(), &config(2));
        }

        engine.apply(config(3)).unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.pending_len(), 3);
    }

    #[test]
    fn apply_while_stopped() {
        let mut pipeline: Pipeline<4, 64> = Pipeline::new();
        let (mut engine, _sink) = split(&mut pipeline, 2);
        engine.apply(config(3)).unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.config().chain_length, 3);
    }
}
