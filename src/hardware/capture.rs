//! Quad-SPI sample port
//!
//! # Design
//! The front end presents samples on the four data lines of QUADSPI bank 2. The port runs an
//! indirect read with neither instruction nor address phase: sampling starts as soon as the
//! communication configuration is written and continues until the data length is exhausted.
//! The data length is set to its maximum, and the transfer complete interrupt restarts the read.
//!
//! Samples are clocked into the 32 byte FIFO. Every time the FIFO holds at least the configured
//! threshold, the FIFO threshold flag raises an MDMA request that moves exactly one threshold worth
//! of data into the current capture buffer. A full FIFO stalls the port clock until the MDMA
//! catches up.
use super::hal::{self, stm32::QUADSPI, xspi::Qspi};
use iq_pipeline::hal::{CaptureConfig, CapturePeripheral, ClockSource};

/// Indirect read mode.
const FMODE_INDIRECT_READ: u8 = 0b01;

/// Data phase on four lines.
const DMODE_QUAD: u8 = 0b11;

/// Flash size field for the full 4 GiB address range.
const FSIZE_MAX: u8 = 31;

pub struct SamplePort {
    _qspi: Qspi<QUADSPI>,
    receiving: bool,
}

impl SamplePort {
    /// Take over the QUADSPI for sample capture.
    ///
    /// # Args
    /// * `qspi` - The QUADSPI driver with bank 2 pins and kernel clock configured.
    /// * `request_len` - The number of bytes moved per MDMA request.
    pub fn new(qspi: Qspi<QUADSPI>, request_len: u8) -> Self {
        assert!((1..=32).contains(&request_len));
        let regs = Self::regs();

        regs.cr.modify(|_, w| w.en().clear_bit());

        // Note(unsafe): The peripheral is owned by `qspi` and disabled. All field values are in
        // range.
        unsafe {
            regs.dcr.modify(|_, w| w.fsize().bits(FSIZE_MAX));
            regs.cr.modify(|_, w| {
                w.fthres()
                    .bits(request_len - 1)
                    .dmaen()
                    .set_bit()
                    .tcie()
                    .set_bit()
            });
        }

        Self {
            _qspi: qspi,
            receiving: false,
        }
    }

    fn regs() -> &'static hal::stm32::quadspi::RegisterBlock {
        // Note(unsafe): The register block is owned through `_qspi`. All accesses happen through
        // `&mut self` or are reads of the static data register address.
        unsafe { &*QUADSPI::ptr() }
    }

    fn begin_read(&mut self) {
        let regs = Self::regs();
        regs.fcr.write(|w| w.ctcf().set_bit().ctef().set_bit());

        // Note(unsafe): Writing CCR starts the transfer, as no address phase is configured.
        unsafe {
            regs.dlr.write(|w| w.dl().bits(0xFFFF_FFFF));
            regs.ccr.write(|w| {
                w.fmode()
                    .bits(FMODE_INDIRECT_READ)
                    .dmode()
                    .bits(DMODE_QUAD)
                    .imode()
                    .bits(0)
                    .admode()
                    .bits(0)
                    .abmode()
                    .bits(0)
            });
        }
    }

    /// Handle the QUADSPI interrupt.
    ///
    /// A completed read is restarted while the receiver is enabled.
    pub fn on_interrupt(&mut self) {
        let regs = Self::regs();
        if regs.sr.read().tcf().bit_is_set() {
            regs.fcr.write(|w| w.ctcf().set_bit());
            if self.receiving {
                self.begin_read();
            }
        }
    }
}

impl CapturePeripheral for SamplePort {
    fn configure(&mut self, config: &CaptureConfig) {
        let prescaler = match config.clock {
            ClockSource::Internal => config.divider.max(1) - 1,
            // The front end paces the samples. Read as fast as possible and let the FIFO stall
            // the port.
            ClockSource::External => 0,
        };

        // Note(unsafe): The prescaler is only changed while the port is idle.
        Self::regs()
            .cr
            .modify(|_, w| unsafe { w.prescaler().bits(prescaler) });

        log::info!(
            "Sample port: {:?} clock, prescaler {}, {:?} reads",
            config.clock,
            prescaler,
            config.width
        );
    }

    fn fifo_address(&self) -> u32 {
        &Self::regs().dr as *const _ as usize as u32
    }

    fn enable_receiver(&mut self) {
        self.receiving = true;
        Self::regs().cr.modify(|_, w| w.en().set_bit());
        self.begin_read();
    }

    fn disable_receiver(&mut self) {
        self.receiving = false;
        let regs = Self::regs();

        // Aborting ends the read and flushes the FIFO.
        regs.cr.modify(|_, w| w.abort().set_bit());
        while regs.cr.read().abort().bit_is_set() {}

        regs.cr.modify(|_, w| w.en().clear_bit());
        regs.fcr.write(|w| w.ctcf().set_bit().ctef().set_bit());
    }
}
