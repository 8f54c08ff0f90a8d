//! Streamer hardware configuration
//!
//! This file contains all of the hardware-specific configuration of the streamer.
use core::sync::atomic::{AtomicBool, Ordering};
use stm32h7xx_hal::{gpio::Speed, prelude::*, xspi::XspiExt};

use super::{
    capture::SamplePort, design_parameters, platform, Mdma, SerialPort,
    StreamClass, Systick, UsbBus, UsbDevice,
};
use crate::metadata::ApplicationMetadata;

/// The available hardware interfaces of the streamer.
pub struct StreamerDevices {
    pub sample_port: SamplePort,
    pub mdma: Mdma,
    pub usb: UsbDevice,
    pub stream: StreamClass,
    pub usb_serial: SerialPort,
    pub metadata: &'static ApplicationMetadata,
}

/// Set up RTT logging.
fn setup_logging() {
    // Set up RTT channel to use for `rprintln!()` as "best effort".
    // This removes a critical section around the logging and thus allows
    // high-prio tasks to always interrupt at low latency.
    // If a high-priority task preempts while we are logging something,
    // and if we then also want to log from within that task, the message is lost.
    let channels = rtt_target::rtt_init_default!();
    // Note(unsafe): The closure we pass does not establish a critical section
    // as demanded but it does ensure synchronization and implements a lock.
    unsafe {
        rtt_target::set_print_channel_cs(
            channels.up.0,
            &((|arg, f| {
                static LOCKED: AtomicBool = AtomicBool::new(false);
                if LOCKED.compare_exchange_weak(
                    false,
                    true,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) == Ok(false)
                {
                    f(arg);
                    LOCKED.store(false, Ordering::Release);
                }
            }) as rtt_target::CriticalSectionFunc),
        );
    }

    static LOGGER: rtt_logger::RTTLogger =
        rtt_logger::RTTLogger::new(log::LevelFilter::Info);
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .unwrap();
    log::info!("Starting");
}

/// Configure the streamer hardware for operation.
///
/// # Args
/// * `core` - The cortex-m peripherals.
/// * `device` - The microcontroller peripherals to be configured.
///
/// # Returns
/// The streamer hardware interfaces in a disabled state.
pub fn setup(
    mut core: stm32h7xx_hal::stm32::CorePeripherals,
    device: stm32h7xx_hal::stm32::Peripherals,
) -> StreamerDevices {
    // Enable debug during WFE/WFI-induced sleep
    device.DBGMCU.cr.modify(|_, w| w.dbgsleep_d1().set_bit());

    setup_logging();

    // Check for a reboot to DFU before doing any system configuration.
    if platform::take_boot_request() == platform::BootRequest::Dfu {
        platform::execute_system_bootloader();
    }

    let pwr = device.PWR.constrain();
    let vos = pwr.freeze();

    // Clear reset flags.
    device.RCC.rsr.write(|w| w.rmvf().set_bit());

    // The sample port kernel clock is the AHB clock.
    device.RCC.d1ccipr.modify(|_, w| w.qspisel().rcc_hclk3());

    let rcc = device.RCC.constrain();
    let mut ccdr = rcc
        .use_hse(8.MHz())
        .sysclk(design_parameters::SYSCLK.convert())
        .hclk(design_parameters::HCLK.convert())
        .freeze(vos, &device.SYSCFG);

    // Set up USB clocks.
    ccdr.clocks.hsi48_ck().unwrap();
    ccdr.peripheral
        .kernel_usb_clk_mux(stm32h7xx_hal::rcc::rec::UsbClkSel::Hsi48);

    Systick::start(core.SYST, ccdr.clocks.sysclk().to_Hz());

    // The data cache stays disabled: capture buffers are written by the MDMA.
    core.SCB.enable_icache();

    let gpioa = device.GPIOA.split(ccdr.peripheral.GPIOA);
    let gpiob = device.GPIOB.split(ccdr.peripheral.GPIOB);
    let gpioc = device.GPIOC.split(ccdr.peripheral.GPIOC);
    let gpioe = device.GPIOE.split(ccdr.peripheral.GPIOE);

    let metadata = ApplicationMetadata::new();
    log::info!("Panic info: {}", metadata.panic_info);

    let sample_port = {
        // Instantiate the QUADSPI bank 2 pins and peripheral interface.
        let pins = {
            let _ncs = gpioc.pc11.into_alternate::<9>().speed(Speed::VeryHigh);

            let clk = gpiob.pb2.into_alternate().speed(Speed::VeryHigh);
            let io0 = gpioe.pe7.into_alternate().speed(Speed::VeryHigh);
            let io1 = gpioe.pe8.into_alternate().speed(Speed::VeryHigh);
            let io2 = gpioe.pe9.into_alternate().speed(Speed::VeryHigh);
            let io3 = gpioe.pe10.into_alternate().speed(Speed::VeryHigh);

            (clk, io0, io1, io2, io3)
        };

        let qspi = device.QUADSPI.bank2(
            pins,
            design_parameters::SAMPLE_PORT_FREQUENCY.convert(),
            &ccdr.clocks,
            ccdr.peripheral.QSPI,
        );

        SamplePort::new(qspi, design_parameters::REQUEST_LEN)
    };

    let mdma = Mdma::new(device.MDMA, ccdr.peripheral.MDMA);

    let (usb, stream, usb_serial) = {
        let _usb_id = gpioa.pa10.into_alternate::<10>();
        let usb_n = gpioa.pa11.into_alternate();
        let usb_p = gpioa.pa12.into_alternate();
        let usb = stm32h7xx_hal::usb_hs::USB2::new(
            device.OTG2_HS_GLOBAL,
            device.OTG2_HS_DEVICE,
            device.OTG2_HS_PWRCLK,
            usb_n,
            usb_p,
            ccdr.peripheral.USB2OTG,
            &ccdr.clocks,
        );

        let endpoint_memory =
            cortex_m::singleton!(: [u32; 1024] = [0; 1024]).unwrap();
        let usb_bus = cortex_m::singleton!(: usb_device::bus::UsbBusAllocator<UsbBus> =
            stm32h7xx_hal::usb_hs::UsbBus::new(usb, &mut endpoint_memory[..]))
        .unwrap();

        // The stream interface comes first so that it is interface 0.
        let stream =
            StreamClass::new(usb_bus, design_parameters::USB_PACKET_SIZE);

        let read_store = cortex_m::singleton!(: [u8; 128] = [0; 128]).unwrap();
        let write_store =
            cortex_m::singleton!(: [u8; 1024] = [0; 1024]).unwrap();
        let serial = usbd_serial::SerialPort::new_with_store(
            usb_bus,
            &mut read_store[..],
            &mut write_store[..],
        );

        let usb_device = usb_device::device::UsbDeviceBuilder::new(
            usb_bus,
            usb_device::device::UsbVidPid(0x1209, 0x392F),
        )
        .strings(&[usb_device::device::StringDescriptors::default()
            .manufacturer("iqstream")
            .product("IQ sample streamer")
            .serial_number(metadata.firmware_version)])
        .unwrap()
        .composite_with_iads()
        .build();

        (usb_device, stream, serial)
    };

    log::info!("setup() complete");

    StreamerDevices {
        sample_port,
        mdma,
        usb,
        stream,
        usb_serial,
        metadata,
    }
}
