//! Module for all hardware-specific setup of the streamer
pub use stm32h7xx_hal as hal;

pub mod capture;
pub mod design_parameters;
pub mod mdma;
mod metadata;
pub mod platform;
pub mod setup;
pub mod stream_class;

use design_parameters::{BUFFER_COUNT, BUFFER_SIZE, MDMA_CHANNEL};

pub type UsbBus = hal::usb_hs::UsbBus<hal::usb_hs::USB2>;

pub type UsbDevice = usb_device::device::UsbDevice<'static, UsbBus>;

pub type SerialPort = usbd_serial::SerialPort<
    'static,
    UsbBus,
    &'static mut [u8],
    &'static mut [u8],
>;

pub type Console = crate::console::Console<'static, SerialPort>;

pub type StreamClass = stream_class::StreamClass<'static, UsbBus>;

pub type Mdma = mdma::Mdma<MDMA_CHANNEL>;

pub type Pipeline = iq_pipeline::Pipeline<BUFFER_COUNT, BUFFER_SIZE>;

pub type CaptureEngine = iq_pipeline::CaptureEngine<
    'static,
    capture::SamplePort,
    Mdma,
    BUFFER_COUNT,
    BUFFER_SIZE,
>;

pub type SubmissionSink = iq_pipeline::SubmissionSink<
    'static,
    StreamClass,
    BUFFER_COUNT,
    BUFFER_SIZE,
>;

rtic_monotonics::systick_monotonic!(Systick, 1_000);

#[inline(never)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::{
        fmt::Write,
        sync::atomic::{AtomicBool, Ordering},
    };
    use cortex_m::asm;
    use rtt_target::{ChannelMode, UpChannel};

    cortex_m::interrupt::disable();

    // Recursion protection
    static PANICKED: AtomicBool = AtomicBool::new(false);
    while PANICKED.load(Ordering::Relaxed) {
        asm::bkpt();
    }
    PANICKED.store(true, Ordering::Relaxed);

    // Analogous to panic-rtt-target
    if let Some(mut channel) = unsafe { UpChannel::conjure(0) } {
        channel.set_mode(ChannelMode::BlockIfFull);
        writeln!(channel, "{}", info).ok();
    }

    // Keep the message for the metadata report after the reset.
    panic_persist::report_panic_info(info);

    cortex_m::peripheral::SCB::sys_reset();
}

#[cortex_m_rt::exception]
unsafe fn HardFault(ef: &cortex_m_rt::ExceptionFrame) -> ! {
    panic!("HardFault at {:#?}", ef);
}

#[cortex_m_rt::exception]
unsafe fn DefaultHandler(irqn: i16) {
    panic!("Unhandled exception (IRQn = {})", irqn);
}
