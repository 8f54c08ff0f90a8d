#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

//! # IQ sample streamer
//!
//! Samples from the front end arrive on the four data lines of the QUADSPI. The MDMA moves them
//! into a ring of capture buffers by walking a linked list of descriptors. Every filled buffer is
//! sent to the host as one bulk-IN transfer on a vendor specific USB interface.
//!
//! ## Tasks
//! * `MDMA` (priority 3): harvests filled buffers, links free ones and signals the USB task.
//! * `QUADSPI` (priority 3): restarts the port read at the end of its data length.
//! * `OTG_FS` (priority 2): polls the USB device, submits ready buffers and recycles completed
//!   ones. Capture stopped by an overrun is restarted here once a buffer has drained.
//! * `console` (priority 1): the USB serial terminal.
//! * `telemetry` (priority 1): periodic counters and rates on the log.
//!
//! ## Host control
//! Capture is started and stopped either from the terminal (`start`, `stop`) or with vendor
//! requests to the stream interface (see [iqstream::hardware::stream_class::Request]).

use iqstream::settings::Settings;

#[cfg(not(target_os = "none"))]
fn main() {
    let settings = Settings::default();
    match serde_json_core::to_string::<_, 256>(&settings) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("Failed to serialize settings: {e:?}"),
    }
}

#[cfg(target_os = "none")]
#[cfg_attr(target_os = "none", rtic::app(device = iqstream::hardware::hal::stm32, peripherals = true, dispatchers=[DCMI, JPEG]))]
mod app {
    use fugit::ExtU32 as _;
    use rtic_monotonics::Monotonic;
    use usb_device::device::UsbDeviceState;

    use iq_pipeline::{Config, Resume};
    use iqstream::{
        console::{PlatformCommand, Session, Snapshot},
        hardware::{
            self,
            design_parameters::{
                BUFFER_COUNT, BUFFER_SIZE, QUADSPI_FIFO_TRIGGER, REQUEST_LEN,
            },
            hal,
            platform::{self, BootRequest},
            stream_class::Request,
            CaptureEngine, Console, Pipeline, SubmissionSink, Systick,
            UsbDevice,
        },
        settings::Limits,
        telemetry::TelemetryBuffer,
    };

    use super::*;

    #[shared]
    struct Shared {
        usb: UsbDevice,
        engine: CaptureEngine,
        sink: SubmissionSink,
        console: Console,
        session: Session,
    }

    #[local]
    struct Local {
        base: Config,
        telemetry: TelemetryBuffer,
    }

    #[init(local = [
        pipeline: Pipeline = Pipeline::new(),
        line_buf: [u8; 128] = [0; 128],
    ])]
    fn init(c: init::Context) -> (Shared, Local) {
        // Configure the microcontroller
        let devices = hardware::setup::setup(c.core, c.device);

        let settings = Settings::default();
        let base = Config {
            request_len: REQUEST_LEN,
            trigger: QUADSPI_FIFO_TRIGGER,
            ..Default::default()
        };

        let (mut engine, mut sink) = c
            .local
            .pipeline
            .split(
                settings.pipeline(&base),
                devices.sample_port,
                devices.mdma,
                devices.stream,
            )
            .unwrap();
        sink.set_restart_policy(settings.restart);

        if settings.autostart {
            if let Err(e) = engine.start() {
                log::error!("Failed to start capture: {e}");
            }
        }

        let limits = Limits {
            base,
            buffers: BUFFER_COUNT,
            buffer_size: BUFFER_SIZE,
        };
        let mut session =
            Session::new(settings, limits, Some(devices.metadata));
        let console =
            Console::new(devices.usb_serial, c.local.line_buf, &mut session);

        let shared = Shared {
            usb: devices.usb,
            engine,
            sink,
            console,
            session,
        };

        let local = Local {
            base,
            telemetry: TelemetryBuffer::default(),
        };

        console::spawn().unwrap();
        telemetry::spawn().unwrap();

        (shared, local)
    }

    #[task(binds = MDMA, priority = 3, shared = [engine])]
    fn capture(mut c: capture::Context) {
        let completion = c.shared.engine.lock(|engine| engine.on_interrupt());
        if completion.harvested > 0 {
            rtic::pend(hal::stm32::Interrupt::OTG_FS);
        }
    }

    #[task(binds = QUADSPI, priority = 3, shared = [engine])]
    fn sample_port(mut c: sample_port::Context) {
        c.shared
            .engine
            .lock(|engine| engine.capture_mut().on_interrupt());
    }

    #[task(binds = OTG_FS, priority = 2, shared = [usb, sink, console, engine])]
    fn usb(mut c: usb::Context) {
        let (resume, request) = (
            &mut c.shared.usb,
            &mut c.shared.sink,
            &mut c.shared.console,
        )
            .lock(|usb, sink, console| {
                usb.poll(&mut [sink.usb_mut(), console.interface_mut()]);

                let resume = sink
                    .usb_mut()
                    .take_completion()
                    .map(|(handle, status)| sink.complete(handle, status));
                let request = sink.usb_mut().take_request();

                if usb.state() == UsbDeviceState::Configured {
                    sink.try_submit_next();
                }
                (resume, request)
            });

        c.shared.engine.lock(|engine| {
            if resume == Some(Resume::Start) {
                if let Err(e) = engine.start() {
                    log::warn!("Failed to resume capture: {e}");
                }
            }

            match request {
                Some(Request::Start) => {
                    if let Err(e) = engine.start() {
                        log::warn!("Failed to start capture: {e}");
                    }
                }
                Some(Request::Stop) => engine.stop(),
                None => {}
            }
        });
    }

    #[task(
        priority = 1,
        shared = [engine, sink, console, session],
        local = [base]
    )]
    async fn console(mut c: console::Context) -> ! {
        loop {
            let snapshot = c.shared.engine.lock(|engine| Snapshot {
                statistics: engine.statistics(),
                buffers: engine.census(),
            });

            let (requests, settings) =
                (&mut c.shared.console, &mut c.shared.session).lock(
                    |console, session| {
                        session.snapshot = snapshot;
                        if let Err(e) = console.poll(session) {
                            log::warn!("Terminal error: {e:?}");
                        }
                        (session.take_requests(), session.settings.clone())
                    },
                );

            c.shared
                .sink
                .lock(|sink| sink.set_restart_policy(settings.restart));

            if let Some(command) = requests.platform {
                match command {
                    PlatformCommand::Reboot => {
                        platform::reboot(BootRequest::Application)
                    }
                    PlatformCommand::Dfu => platform::reboot(BootRequest::Dfu),
                }
            }

            let base = *c.local.base;
            c.shared.engine.lock(|engine| {
                if requests.reconfigure {
                    if let Err(e) = engine.apply(settings.pipeline(&base)) {
                        log::error!("Failed to reconfigure capture: {e}");
                    }
                }

                if requests.stop {
                    engine.stop();
                }

                if requests.start {
                    if let Err(e) = engine.start() {
                        log::warn!("Failed to start capture: {e}");
                    }
                }
            });

            // Schedule to run this task every 10 milliseconds.
            Systick::delay(10.millis()).await;
        }
    }

    #[task(priority = 1, shared = [engine, session], local = [telemetry])]
    async fn telemetry(mut c: telemetry::Context) -> ! {
        loop {
            let period = c
                .shared
                .session
                .lock(|session| session.settings.telemetry_period)
                .max(1);
            Systick::delay((period as u32).secs()).await;

            let (statistics, buffers) = c
                .shared
                .engine
                .lock(|engine| (engine.statistics(), engine.census()));
            c.local
                .telemetry
                .finalize(statistics, buffers, BUFFER_SIZE, period)
                .publish();
        }
    }

    #[idle(shared = [usb])]
    fn idle(mut c: idle::Context) -> ! {
        loop {
            // We can't sleep if USB is not in suspend.
            if c.shared
                .usb
                .lock(|usb| usb.state() == UsbDeviceState::Suspend)
            {
                cortex_m::asm::wfi();
            }
        }
    }
}
