//! Sample capture buffer pipeline
//!
//! # Design
//! Samples from the capture peripheral are moved into RAM by a DMA controller walking a linked
//! list of descriptors. Every descriptor targets one fixed-size capture buffer out of a static
//! arena of `N` buffers. The DMA engine raises an interrupt at the end of every block. The
//! interrupt handler harvests the buffers the channel has moved past in capture order, appends
//! fresh buffers to the tail of the chain and hands the harvested buffers to the USB bulk-IN
//! path. When the USB transfer of a buffer completes, the buffer returns to the free
//! pool.
//!
//! ```text
//! Free -> QueuedForCapture -> OwnedByHardware -> CaptureDone
//!      -> QueuedForSubmission -> OwnedByUsbHardware -> Free
//! ```
//!
//! ## Ownership
//! The [Pipeline] is the single context object holding the arena, the queues and the
//! [RunState]. [Pipeline::split] hands out two capabilities:
//!
//! * [CaptureEngine]: owned by the DMA interrupt. It owns the descriptor chain, takes buffers from
//!   the free queue and produces into the ready queue.
//! * [SubmissionSink]: owned by the USB context. It consumes the ready queue and returns buffers to
//!   the free queue.
//!
//! The free and ready queues are single-producer single-consumer queues. Each end is owned by
//! exactly one of the capabilities, so queue mutation never needs a lock. Buffer state tags are
//! changed with checked transitions: a transition from an unexpected state is an ownership
//! violation and panics.
//!
//! ## Overruns
//! If the chain runs dry before it is refilled, the DMA engine signals that the chain is exhausted.
//! Capture then stops and the overrun is counted. It is restarted by an explicit
//! [CaptureEngine::start()], either from the main loop or once the USB side has drained (see
//! [RestartPolicy]).
#![cfg_attr(not(any(test, feature = "testing")), no_std)]

mod buffer;
mod chain;
pub mod descriptor;
mod engine;
pub mod hal;
mod pool;
mod stats;
mod submit;

pub use buffer::{BufferHandle, BufferState};
pub use engine::{CaptureEngine, Completion, Config};
pub use pool::{CapturePool, Census, Pipeline, SubmitPool};
pub use stats::{RunState, Statistics};
pub use submit::{
    RestartPolicy, Resume, Submit, SubmissionSink, Transfer, TransferStatus,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// The maximum number of capture buffers in a pipeline.
pub const MAX_BUFFERS: usize = 32;

/// The maximum size of a capture buffer in bytes, limited by the descriptor block length.
pub const MAX_BUFFER_SIZE: usize = 1 << 16;

/// Errors reported by the capture pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Capture is already running.
    #[error("Capture already running")]
    Busy,
    /// No buffer could be queued for capture.
    #[error("No free capture buffers")]
    NoBuffers,
    /// The requested chain length does not fit the pool.
    #[error("Chain length {0} outside of 1..={1}")]
    ChainLength(usize, usize),
    /// The DMA request length does not divide the buffer size.
    #[error("Request length {0} does not divide buffer size {1}")]
    RequestLength(usize, usize),
}
