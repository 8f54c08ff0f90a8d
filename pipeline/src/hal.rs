//! Driver contracts consumed by the pipeline
use arbitrary_int::u6;
use bitbybit::bitfield;
use serde::{Deserialize, Serialize};

use crate::descriptor::{AddressMode, Descriptor, SampleWidth};
use crate::Transfer;

/// DMA channel interrupt status, in the layout of the MDMA CISR/CIFCR registers.
#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq)]
pub struct Status {
    /// The channel hit a bus or descriptor error and was disabled.
    #[bit(0, rw)]
    pub transfer_error: bool,
    /// The last node of the list was finished.
    #[bit(1, rw)]
    pub chain_exhausted: bool,
    /// A node finished its block.
    #[bit(3, rw)]
    pub buffer_complete: bool,
}

impl Status {
    pub fn all() -> Self {
        Self::new_with_raw_value(0)
            .with_transfer_error(true)
            .with_chain_exhausted(true)
            .with_buffer_complete(true)
    }

    pub fn is_empty(&self) -> bool {
        self.raw_value() == 0
    }
}

/// Sample clock of the capture front end.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockSource {
    /// Clock derived from the peripheral kernel clock.
    Internal,
    /// Clock supplied by the front end.
    External,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub clock: ClockSource,
    /// Kernel clock divider for [ClockSource::Internal].
    pub divider: u8,
    pub width: SampleWidth,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            clock: ClockSource::Internal,
            divider: 2,
            width: SampleWidth::Word,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FlowControl {
    /// Transfers are paced by the given hardware request line.
    Peripheral { request: u6 },
    /// Transfers are started by software.
    Software,
}

/// The sample source.
pub trait CapturePeripheral {
    fn configure(&mut self, config: &CaptureConfig);

    /// The bus address of the receive FIFO.
    fn fifo_address(&self) -> u32;

    fn enable_receiver(&mut self);

    fn disable_receiver(&mut self);
}

/// A linked-list capable DMA channel.
pub trait DmaChannel {
    fn enable(&mut self);

    /// Disable the channel and wait until it is idle.
    fn disable(&mut self);

    /// Read and clear the pending interrupt flags.
    fn status(&mut self) -> Status;

    /// Load `head` as the first node of the list.
    fn set_descriptor(&mut self, head: &Descriptor);

    fn set_source_address(&mut self, address: u32);

    fn set_transfer_mode(
        &mut self,
        source: AddressMode,
        destination: AddressMode,
    );

    fn set_flow_control(&mut self, flow: FlowControl);

    /// Enable the interrupts in `mask`.
    fn listen(&mut self, mask: Status);

    /// The bus address the channel writes next.
    ///
    /// Inside a block this points into the buffer being filled. After the last block of the list it
    /// points one past the end of that buffer.
    fn destination_address(&self) -> u32;

    /// A node was linked to the tail of the running list.
    ///
    /// Channels that latch the link of the active node need to pick up `node` here.
    fn append(&mut self, _node: &Descriptor) {}
}

/// The USB stack could not accept a transfer right now.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Bulk endpoint busy")]
pub struct Busy;

/// The USB bulk-IN path.
pub trait BulkIn {
    /// Queue `transfer` for the host.
    ///
    /// Every accepted transfer must be reported back to
    /// [crate::SubmissionSink::complete()] exactly once.
    fn write(&mut self, transfer: Transfer) -> Result<(), Busy>;
}
