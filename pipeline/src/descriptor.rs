//! MDMA linked-list descriptors
//!
//! A [Descriptor] is one node of the linked list walked by the STM32H7 MDMA controller. Its ten
//! words are the register image the controller loads when it follows a link.
//!
//! Nodes carry no completion stamp. In buffer trigger mode the mask write would happen after every
//! request, long before the block is full. Finished nodes are found from the destination address
//! of the channel instead, see [crate::CaptureEngine].
use core::sync::atomic::{AtomicU32, Ordering};

use arbitrary_int::{u12, u17, u2, u3, u6, u7};
use bitbybit::{bitenum, bitfield};
use serde::{Deserialize, Serialize};

#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq)]
pub enum AddressMode {
    Fixed = 0,
    _Reserved = 1,
    Increment = 2,
    Decrement = 3,
}

/// Size of a single sample transfer on the bus.
#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum SampleWidth {
    Byte = 0,
    HalfWord = 1,
    Word = 2,
    DoubleWord = 3,
}

impl SampleWidth {
    pub fn bytes(&self) -> usize {
        match self {
            Self::Byte => 1,
            Self::HalfWord => 2,
            Self::Word => 4,
            Self::DoubleWord => 8,
        }
    }
}

/// Amount of data moved per hardware request.
#[bitenum(u2, exhaustive = true)]
#[derive(Debug, PartialEq)]
pub enum TriggerMode {
    Buffer = 0,
    Block = 1,
    RepeatedBlock = 2,
    LinkedListItem = 3,
}

#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq)]
pub struct Ctcr {
    #[bits(0..=1, rw)]
    pub sinc: AddressMode,
    #[bits(2..=3, rw)]
    pub dinc: AddressMode,
    #[bits(4..=5, rw)]
    pub ssize: SampleWidth,
    #[bits(6..=7, rw)]
    pub dsize: SampleWidth,
    #[bits(8..=9, rw)]
    pub sincos: SampleWidth,
    #[bits(10..=11, rw)]
    pub dincos: SampleWidth,
    #[bits(12..=14, rw)]
    pub sburst: u3,
    #[bits(15..=17, rw)]
    pub dburst: u3,
    #[bits(18..=24, rw)]
    pub tlen: u7,
    #[bit(25, rw)]
    pub pke: bool,
    #[bits(26..=27, rw)]
    pub pam: u2,
    #[bits(28..=29, rw)]
    pub trgm: TriggerMode,
    #[bit(30, rw)]
    pub swrm: bool,
    #[bit(31, rw)]
    pub bwm: bool,
}

#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq)]
pub struct Cbndtr {
    #[bits(0..=16, rw)]
    pub bndt: u17,
    #[bit(18, rw)]
    pub brsum: bool,
    #[bit(19, rw)]
    pub brdum: bool,
    #[bits(20..=31, rw)]
    pub brc: u12,
}

#[bitfield(u32, default = 0)]
#[derive(Debug, PartialEq)]
pub struct Ctbr {
    #[bits(0..=5, rw)]
    pub tsel: u6,
    #[bit(16, rw)]
    pub sbus: bool,
    #[bit(17, rw)]
    pub dbus: bool,
}

/// How samples move from the peripheral FIFO into a buffer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TransferMode {
    /// Width of each FIFO read and memory write.
    pub width: SampleWidth,
    /// Bytes moved per peripheral request (1..=128), matching the FIFO threshold.
    pub request_len: u8,
    /// Hardware request line of the capture peripheral.
    pub trigger: u6,
}

impl TransferMode {
    /// Transfer control for a peripheral-to-memory block transfer.
    ///
    /// Every request moves `request_len` bytes. The block ends after the buffer is full.
    pub fn control(&self) -> Ctcr {
        Ctcr::new_with_raw_value(0)
            .with_sinc(AddressMode::Fixed)
            .with_dinc(AddressMode::Increment)
            .with_ssize(self.width)
            .with_dsize(self.width)
            .with_sincos(self.width)
            .with_dincos(self.width)
            .with_tlen(u7::new(self.request_len.saturating_sub(1)))
            .with_trgm(TriggerMode::Buffer)
    }

    pub fn trigger(&self) -> Ctbr {
        Ctbr::new_with_raw_value(0).with_tsel(self.trigger)
    }
}

/// Register image of a node as loaded into a channel.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Registers {
    pub ctcr: Ctcr,
    pub cbndtr: Cbndtr,
    pub csar: u32,
    pub cdar: u32,
    pub cbrur: u32,
    pub clar: u32,
    pub ctbr: Ctbr,
    pub cmar: u32,
    pub cmdr: u32,
}

/// One MDMA linked-list node.
///
/// All words are atomics: the controller reads the node while software may patch its link.
#[repr(C, align(8))]
pub struct Descriptor {
    ctcr: AtomicU32,
    cbndtr: AtomicU32,
    csar: AtomicU32,
    cdar: AtomicU32,
    cbrur: AtomicU32,
    clar: AtomicU32,
    ctbr: AtomicU32,
    _reserved: AtomicU32,
    cmar: AtomicU32,
    cmdr: AtomicU32,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Descriptor {
    pub const fn new() -> Self {
        Self {
            ctcr: AtomicU32::new(0),
            cbndtr: AtomicU32::new(0),
            csar: AtomicU32::new(0),
            cdar: AtomicU32::new(0),
            cbrur: AtomicU32::new(0),
            clar: AtomicU32::new(0),
            ctbr: AtomicU32::new(0),
            _reserved: AtomicU32::new(0),
            cmar: AtomicU32::new(0),
            cmdr: AtomicU32::new(0),
        }
    }

    /// The bus address of the node as stored in a link register.
    pub fn address(&self) -> u32 {
        self as *const Self as usize as u32
    }

    /// Describe a transfer of `len` bytes from `source` to `destination`.
    ///
    /// The node is left terminated and without a mask write.
    pub fn populate(
        &self,
        source: u32,
        destination: u32,
        len: usize,
        mode: &TransferMode,
    ) {
        let cbndtr =
            Cbndtr::new_with_raw_value(0).with_bndt(u17::new(len as u32));
        self.ctcr
            .store(mode.control().raw_value(), Ordering::Relaxed);
        self.cbndtr.store(cbndtr.raw_value(), Ordering::Relaxed);
        self.csar.store(source, Ordering::Relaxed);
        self.cdar.store(destination, Ordering::Relaxed);
        self.cbrur.store(0, Ordering::Relaxed);
        self.clar.store(0, Ordering::Relaxed);
        self.ctbr
            .store(mode.trigger().raw_value(), Ordering::Relaxed);
        self.cmar.store(0, Ordering::Relaxed);
        self.cmdr.store(0, Ordering::Relaxed);
    }

    /// Point this node at `next`.
    pub fn link(&self, next: &Descriptor) {
        self.clar.store(next.address(), Ordering::Release);
    }

    pub fn next_address(&self) -> u32 {
        self.clar.load(Ordering::Acquire)
    }

    /// The bus address one past the last byte the node writes.
    pub fn end_address(&self) -> u32 {
        let cbndtr =
            Cbndtr::new_with_raw_value(self.cbndtr.load(Ordering::Relaxed));
        self.cdar.load(Ordering::Relaxed) + cbndtr.bndt().value()
    }

    pub fn registers(&self) -> Registers {
        Registers {
            ctcr: Ctcr::new_with_raw_value(self.ctcr.load(Ordering::Relaxed)),
            cbndtr: Cbndtr::new_with_raw_value(
                self.cbndtr.load(Ordering::Relaxed),
            ),
            csar: self.csar.load(Ordering::Relaxed),
            cdar: self.cdar.load(Ordering::Relaxed),
            cbrur: self.cbrur.load(Ordering::Relaxed),
            clar: self.clar.load(Ordering::Acquire),
            ctbr: Ctbr::new_with_raw_value(self.ctbr.load(Ordering::Relaxed)),
            cmar: self.cmar.load(Ordering::Relaxed),
            cmdr: self.cmdr.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode() -> TransferMode {
        TransferMode {
            width: SampleWidth::Word,
            request_len: 16,
            trigger: u6::new(22),
        }
    }

    #[test]
    fn control_word() {
        let ctcr = mode().control();
        assert_eq!(ctcr.sinc(), AddressMode::Fixed);
        assert_eq!(ctcr.dinc(), AddressMode::Increment);
        assert_eq!(ctcr.tlen(), u7::new(15));
        assert_eq!(ctcr.trgm(), TriggerMode::Buffer);
        assert_eq!(
            ctcr.raw_value(),
            (15 << 18) | (0b10 << 10) | (0b10 << 8)
                | (0b10 << 6) | (0b10 << 4) | (0b10 << 2)
        );
        assert_eq!(mode().trigger().raw_value(), 22);
    }

    #[test]
    fn populate() {
        let d = Descriptor::new();
        let other = Descriptor::new();
        d.link(&other);
        d.populate(0x9000_0000, 0x2400_0000, 4096, &mode());
        let r = d.registers();
        assert_eq!(r.csar, 0x9000_0000);
        assert_eq!(r.cdar, 0x2400_0000);
        assert_eq!(r.cbndtr.bndt(), u17::new(4096));
        assert_eq!(d.end_address(), 0x2400_1000);
        // Repopulating terminates the list.
        assert_eq!(r.clar, 0);
    }

    #[test]
    fn no_mask_write() {
        // A mask write in buffer trigger mode fires per request, not per block.
        let d = Descriptor::new();
        d.populate(0x9000_0000, 0x2400_0000, 4096, &mode());
        let r = d.registers();
        assert_eq!(r.cmar, 0);
        assert_eq!(r.cmdr, 0);
        assert_eq!(r.ctcr.trgm(), TriggerMode::Buffer);
    }

    #[test]
    fn link() {
        let a = Descriptor::new();
        let b = Descriptor::new();
        a.link(&b);
        assert_eq!(a.next_address(), b.address());
        assert_eq!(a.registers().clar, b.address());
    }

    #[test]
    fn widths() {
        assert_eq!(SampleWidth::HalfWord.bytes(), 2);
        assert_eq!(
            SampleWidth::new_with_raw_value(u2::new(3)),
            SampleWidth::DoubleWord
        );
    }
}
