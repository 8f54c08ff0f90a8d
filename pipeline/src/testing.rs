//! Simulated drivers for host tests
use arbitrary_int::u6;

use crate::descriptor::{AddressMode, Descriptor};
use crate::hal::{
    BulkIn, Busy, CaptureConfig, CapturePeripheral, DmaChannel, FlowControl,
    Status,
};
use crate::{
    BufferHandle, CaptureEngine, Config, Pipeline, SubmissionSink, Transfer,
};

pub const FIFO_ADDRESS: u32 = 0x5200_5020;

pub fn config(chain_length: usize) -> Config {
    Config {
        chain_length,
        request_len: 32,
        trigger: u6::new(22),
        ..Default::default()
    }
}

/// Split `pipeline` over simulated drivers.
pub fn split<const N: usize, const SIZE: usize>(
    pipeline: &mut Pipeline<N, SIZE>,
    chain_length: usize,
) -> (
    CaptureEngine<'_, MockCapture, MockDma, N, SIZE>,
    SubmissionSink<'_, MockUsb, N, SIZE>,
) {
    pipeline
        .split(
            config(chain_length),
            MockCapture::default(),
            MockDma::default(),
            MockUsb::default(),
        )
        .unwrap()
}

#[derive(Debug, Default)]
pub struct MockCapture {
    pub configured: Option<CaptureConfig>,
    pub receiving: bool,
}

impl CapturePeripheral for MockCapture {
    fn configure(&mut self, config: &CaptureConfig) {
        self.configured = Some(*config);
    }

    fn fifo_address(&self) -> u32 {
        FIFO_ADDRESS
    }

    fn enable_receiver(&mut self) {
        self.receiving = true;
    }

    fn disable_receiver(&mut self) {
        self.receiving = false;
    }
}

/// A channel walking the list one block at a time.
///
/// Like the MDMA it latches the link of a node when loading it and tracks its write position
/// across the list.
#[derive(Debug)]
pub struct MockDma {
    pub enabled: bool,
    pub pending: Status,
    pub listening: Status,
    pub head: Option<u32>,
    pub source: Option<u32>,
    pub mode: Option<(AddressMode, AddressMode)>,
    pub flow: Option<FlowControl>,
    pub appended: usize,
    /// The bus address written next.
    pub position: u32,
    /// Link address latched from the active node.
    pub link: u32,
    /// Lose appends, as if the channel latched the end of the list just before.
    pub ignore_append: bool,
}

impl Default for MockDma {
    fn default() -> Self {
        Self {
            enabled: false,
            pending: Status::new_with_raw_value(0),
            listening: Status::new_with_raw_value(0),
            head: None,
            source: None,
            mode: None,
            flow: None,
            appended: 0,
            position: 0,
            link: 0,
            ignore_append: false,
        }
    }
}

impl MockDma {
    /// Latch interrupt flags as the controller would.
    pub fn raise(&mut self, status: Status) {
        self.pending = Status::new_with_raw_value(
            self.pending.raw_value() | status.raw_value(),
        );
    }
}

impl DmaChannel for MockDma {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn status(&mut self) -> Status {
        core::mem::replace(&mut self.pending, Status::new_with_raw_value(0))
    }

    fn set_descriptor(&mut self, head: &Descriptor) {
        let registers = head.registers();
        self.head = Some(head.address());
        self.position = registers.cdar;
        self.link = registers.clar;
    }

    fn set_source_address(&mut self, address: u32) {
        self.source = Some(address);
    }

    fn set_transfer_mode(
        &mut self,
        source: AddressMode,
        destination: AddressMode,
    ) {
        self.mode = Some((source, destination));
    }

    fn set_flow_control(&mut self, flow: FlowControl) {
        self.flow = Some(flow);
    }

    fn listen(&mut self, mask: Status) {
        self.listening = mask;
    }

    fn destination_address(&self) -> u32 {
        self.position
    }

    fn append(&mut self, node: &Descriptor) {
        self.appended += 1;
        if self.enabled && self.link == 0 && !self.ignore_append {
            self.link = node.address();
        }
    }
}

/// Records accepted transfers as `(handle, sequence, len)`.
#[derive(Debug, Default)]
pub struct MockUsb {
    pub accepted: Vec<(BufferHandle, u32, usize)>,
    pub busy: bool,
}

impl BulkIn for MockUsb {
    fn write(&mut self, transfer: Transfer) -> Result<(), Busy> {
        if self.busy {
            return Err(Busy);
        }
        self.accepted
            .push((transfer.handle, transfer.sequence, transfer.len()));
        Ok(())
    }
}

/// Let the channel finish the block it is writing.
///
/// Moves the write position to the next node through the latched link, or past the end of the
/// block and disables the channel at the end of the list. Latches the interrupt flags. Returns
/// `None` if the channel is not running.
pub fn capture_one<const N: usize, const SIZE: usize>(
    engine: &mut CaptureEngine<'_, MockCapture, MockDma, N, SIZE>,
) -> Option<BufferHandle> {
    if !engine.dma_mut().enabled {
        return None;
    }
    let (position, link) = (engine.dma_mut().position, engine.dma_mut().link);

    let handle = engine.pending().find(|&handle| {
        let node = engine.descriptor(handle);
        (node.registers().cdar..node.end_address()).contains(&position)
    })?;
    let end = engine.descriptor(handle).end_address();
    let next = engine
        .pending()
        .find(|&handle| engine.descriptor(handle).address() == link)
        .map(|handle| engine.descriptor(handle).registers());

    let dma = engine.dma_mut();
    let mut status = Status::new_with_raw_value(0).with_buffer_complete(true);
    match next {
        Some(node) => {
            dma.position = node.cdar;
            dma.link = node.clar;
        }
        None => {
            dma.position = end;
            dma.link = 0;
            dma.enabled = false;
            status = status.with_chain_exhausted(true);
        }
    }
    dma.raise(status);
    Some(handle)
}

/// Check that every buffer is in exactly one place.
///
/// The free queue, the capture list, the ready queue and the transfer in flight together hold all
/// `N` buffers, and the state tags agree with where each buffer is.
pub fn assert_conserved<const N: usize, const SIZE: usize>(
    engine: &CaptureEngine<'_, MockCapture, MockDma, N, SIZE>,
    sink: &SubmissionSink<'_, MockUsb, N, SIZE>,
) {
    let census = engine.census();
    let in_flight = usize::from(sink.in_flight().is_some());
    assert_eq!(
        engine.free_len()
            + engine.pending_len()
            + sink.ready_len()
            + in_flight,
        N
    );
    assert_eq!(census.free, engine.free_len());
    assert_eq!(
        census.queued_for_capture + census.owned_by_hardware,
        engine.pending_len()
    );
    assert_eq!(census.capture_done, 0);
    assert_eq!(census.queued_for_submission, sink.ready_len());
    assert_eq!(census.owned_by_usb_hardware, in_flight);
}
