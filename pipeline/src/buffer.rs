use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::descriptor::Descriptor;

/// Index of a capture buffer within the pipeline arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(u8);

impl BufferHandle {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index as u8)
    }

    /// The arena index of the buffer.
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "buffer {}", self.0)
    }
}

/// The owner-tagged state of a capture buffer.
///
/// Exactly one component may access a buffer in a given state.
#[repr(u8)]
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive,
)]
pub enum BufferState {
    /// In the free queue.
    Free = 0,
    /// Acquired by the capture side and linked into the chain, not yet visible to hardware.
    QueuedForCapture = 1,
    /// Reachable by the DMA engine.
    OwnedByHardware = 2,
    /// Filled by the DMA engine and harvested by the completion handler.
    CaptureDone = 3,
    /// In the ready queue, waiting for the USB bulk-IN path.
    QueuedForSubmission = 4,
    /// Being transferred by the USB hardware.
    OwnedByUsbHardware = 5,
}

#[repr(C, align(32))]
struct DataRegion<const SIZE: usize>([u8; SIZE]);

/// One capture buffer: descriptor, bookkeeping and sample storage.
pub(crate) struct Slot<const SIZE: usize> {
    descriptor: Descriptor,
    state: AtomicU8,
    sequence: AtomicU32,
    valid: AtomicU32,
    data: UnsafeCell<DataRegion<SIZE>>,
}

// Note(unsafe): The sample data is only accessed by the component owning the buffer according to
// its state tag, which is changed exclusively through atomic, checked transitions. All other
// fields are atomics.
unsafe impl<const SIZE: usize> Sync for Slot<SIZE> {}

impl<const SIZE: usize> Slot<SIZE> {
    pub const fn new() -> Self {
        Self {
            descriptor: Descriptor::new(),
            state: AtomicU8::new(BufferState::Free as u8),
            sequence: AtomicU32::new(0),
            valid: AtomicU32::new(0),
            data: UnsafeCell::new(DataRegion([0; SIZE])),
        }
    }

    pub fn state(&self) -> BufferState {
        let raw = self.state.load(Ordering::Acquire);
        BufferState::try_from(raw)
            .unwrap_or_else(|e| panic!("Corrupt buffer state {}", e.number))
    }

    /// Move the buffer from `from` to `to`.
    ///
    /// # Panics
    /// If the buffer is not in state `from`, another component owns it. This is an ownership
    /// violation and not recoverable.
    pub fn transition(
        &self,
        handle: BufferHandle,
        from: BufferState,
        to: BufferState,
    ) {
        if let Err(found) = self.state.compare_exchange(
            from.into(),
            to.into(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "Ownership violation on {handle}: {from:?} -> {to:?} but found {:?}",
                BufferState::try_from(found)
            );
        }
    }

    /// Unconditionally mark the buffer free. Only used while no capability exists.
    pub fn reset(&self) {
        self.state.store(BufferState::Free.into(), Ordering::Release);
        self.valid.store(0, Ordering::Relaxed);
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    pub fn set_sequence(&self, sequence: u32) {
        self.sequence.store(sequence, Ordering::Relaxed);
    }

    pub fn valid(&self) -> usize {
        self.valid.load(Ordering::Relaxed) as usize
    }

    pub fn set_valid(&self, len: usize) {
        self.valid.store(len as u32, Ordering::Relaxed);
    }

    pub fn data_ptr(&self) -> *mut u8 {
        self.data.get().cast()
    }

    /// The bus address of the sample storage.
    pub fn dma_address(&self) -> u32 {
        self.data_ptr() as usize as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_follows_owner() {
        let slot: Slot<64> = Slot::new();
        let h = BufferHandle::new(0);
        slot.transition(h, BufferState::Free, BufferState::QueuedForCapture);
        slot.transition(
            h,
            BufferState::QueuedForCapture,
            BufferState::OwnedByHardware,
        );
        assert_eq!(slot.state(), BufferState::OwnedByHardware);
    }

    #[test]
    #[should_panic(expected = "Ownership violation")]
    fn foreign_transition_panics() {
        let slot: Slot<64> = Slot::new();
        let h = BufferHandle::new(3);
        slot.transition(h, BufferState::Free, BufferState::QueuedForCapture);
        // The USB side must never see a buffer still queued for capture.
        slot.transition(
            h,
            BufferState::OwnedByUsbHardware,
            BufferState::Free,
        );
    }

    #[test]
    fn data_is_aligned() {
        let slot: Slot<1024> = Slot::new();
        assert_eq!(slot.data_ptr() as usize % 32, 0);
    }
}
