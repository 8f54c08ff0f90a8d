//! MDMA linked-list channel
//!
//! # Design
//! The MDMA loads a node of the descriptor list into the channel registers and runs its block. If
//! the link address of the node is set, the next node is loaded. Otherwise the channel transfer
//! completes and the channel disables itself. The destination address register tracks the write
//! position across the whole list.
//!
//! The channel registers from CTCR onwards have the same layout as a list node.
use arbitrary_int::u2;
use bitbybit::bitfield;
use iq_pipeline::descriptor::{AddressMode, Ctbr, Ctcr, Descriptor};
use iq_pipeline::hal::{DmaChannel, FlowControl, Status};

use super::hal::{self, rcc::ResetEnable};

/// Channel register offsets relative to the channel base.
mod offset {
    pub const CISR: usize = 0x00;
    pub const CIFCR: usize = 0x04;
    pub const CESR: usize = 0x08;
    pub const CCR: usize = 0x0C;
    pub const CTCR: usize = 0x10;
    pub const CBNDTR: usize = 0x14;
    pub const CSAR: usize = 0x18;
    pub const CDAR: usize = 0x1C;
    pub const CBRUR: usize = 0x20;
    pub const CLAR: usize = 0x24;
    pub const CTBR: usize = 0x28;
    pub const CMAR: usize = 0x30;
    pub const CMDR: usize = 0x34;
}

/// Channel control register.
#[bitfield(u32, default = 0)]
#[derive(Debug)]
pub struct Ccr {
    #[bit(0, rw)]
    pub en: bool,
    #[bit(1, rw)]
    pub teie: bool,
    #[bit(2, rw)]
    pub ctcie: bool,
    #[bit(3, rw)]
    pub brtie: bool,
    #[bit(4, rw)]
    pub btie: bool,
    #[bit(5, rw)]
    pub tcie: bool,
    #[bits(6..=7, rw)]
    pub pl: u2,
    #[bit(16, rw)]
    pub swrq: bool,
}

/// Status flags reported to the pipeline: TEIF, CTCIF and BTIF.
const STATUS_MASK: u32 = 0b1011;

/// One MDMA channel.
pub struct Mdma<const CH: usize> {
    _mdma: hal::stm32::MDMA,
    base: usize,
}

impl<const CH: usize> Mdma<CH> {
    const VALID: () = assert!(CH < 16);

    /// Enable the MDMA and take channel `CH`.
    pub fn new(mdma: hal::stm32::MDMA, rec: hal::rcc::rec::Mdma) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::VALID;
        rec.enable().reset();

        let base = hal::stm32::MDMA::ptr() as usize + 0x40 + 0x40 * CH;
        let mut channel = Self { _mdma: mdma, base };
        channel.write(
            offset::CCR,
            Ccr::new_with_raw_value(0).with_pl(u2::new(0b11)).raw_value(),
        );
        channel
    }

    fn read(&self, offset: usize) -> u32 {
        // Note(unsafe): `base + offset` is a register of the owned channel.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&mut self, offset: usize, value: u32) {
        // Note(unsafe): `base + offset` is a register of the owned channel.
        unsafe {
            core::ptr::write_volatile((self.base + offset) as *mut u32, value)
        }
    }

    fn ccr(&self) -> Ccr {
        Ccr::new_with_raw_value(self.read(offset::CCR))
    }

    fn ctcr(&self) -> Ctcr {
        Ctcr::new_with_raw_value(self.read(offset::CTCR))
    }
}

impl<const CH: usize> DmaChannel for Mdma<CH> {
    fn enable(&mut self) {
        let ccr = self.ccr().with_en(true);
        self.write(offset::CCR, ccr.raw_value());
    }

    fn disable(&mut self) {
        let ccr = self.ccr().with_en(false);
        self.write(offset::CCR, ccr.raw_value());
        // The channel finishes the current buffer transfer first.
        while self.ccr().en() {}
    }

    fn status(&mut self) -> Status {
        let flags = self.read(offset::CISR) & STATUS_MASK;
        self.write(offset::CIFCR, flags);
        let status = Status::new_with_raw_value(flags);
        if status.transfer_error() {
            log::error!("MDMA error status {:#x}", self.read(offset::CESR));
        }
        status
    }

    fn set_descriptor(&mut self, head: &Descriptor) {
        let node = head.registers();
        self.write(offset::CTCR, node.ctcr.raw_value());
        self.write(offset::CBNDTR, node.cbndtr.raw_value());
        self.write(offset::CSAR, node.csar);
        self.write(offset::CDAR, node.cdar);
        self.write(offset::CBRUR, node.cbrur);
        self.write(offset::CLAR, node.clar);
        self.write(offset::CTBR, node.ctbr.raw_value());
        self.write(offset::CMAR, node.cmar);
        self.write(offset::CMDR, node.cmdr);
    }

    fn set_source_address(&mut self, address: u32) {
        self.write(offset::CSAR, address);
    }

    fn set_transfer_mode(
        &mut self,
        source: AddressMode,
        destination: AddressMode,
    ) {
        let ctcr = self.ctcr().with_sinc(source).with_dinc(destination);
        self.write(offset::CTCR, ctcr.raw_value());
    }

    fn set_flow_control(&mut self, flow: FlowControl) {
        let ctcr = match flow {
            FlowControl::Peripheral { request } => {
                let ctbr = Ctbr::new_with_raw_value(self.read(offset::CTBR))
                    .with_tsel(request);
                self.write(offset::CTBR, ctbr.raw_value());
                self.ctcr().with_swrm(false)
            }
            FlowControl::Software => self.ctcr().with_swrm(true),
        };
        self.write(offset::CTCR, ctcr.raw_value());
    }

    fn listen(&mut self, mask: Status) {
        let ccr = self
            .ccr()
            .with_teie(mask.transfer_error())
            .with_ctcie(mask.chain_exhausted())
            .with_btie(mask.buffer_complete());
        self.write(offset::CCR, ccr.raw_value());
    }

    fn destination_address(&self) -> u32 {
        self.read(offset::CDAR)
    }

    fn append(&mut self, node: &Descriptor) {
        // The link of the active node is latched at load. If the channel runs the former tail,
        // continue the list from the channel registers.
        if self.ccr().en() && self.read(offset::CLAR) == 0 {
            self.write(offset::CLAR, node.address());
        }
    }
}
