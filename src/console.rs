//! USB terminal
//!
//! # Description
//! A line based command interface on the CDC-ACM serial port:
//!
//! ```text
//! > help
//! AVAILABLE ITEMS:
//!   start
//!   stop
//!   stats
//!   list
//!   get <item>
//!   set <item> <value>
//!   platform <cmd>
//!   help [ <command> ]
//!
//! > set /chain_length 4
//! Updated /chain_length
//! ```
//!
//! Settings are addressed by their [miniconf] path and values are JSON encoded.
//!
//! Commands do not touch the pipeline directly. They record [Requests] in the [Session] that the
//! application applies after [Console::poll()].
use core::fmt::Write;
use embedded_io::ErrorType;
use iq_pipeline::{Census, Statistics};
use miniconf::{JsonCoreSlash, TreeKey};

use crate::metadata::ApplicationMetadata;
use crate::settings::{Limits, Settings};

/// The user interface, for example a USB CDC-ACM serial port.
pub trait Interface:
    embedded_io::Read
    + embedded_io::ReadReady
    + embedded_io::Write
    + embedded_io::WriteReady
{
}

impl<T> Interface for T where
    T: embedded_io::Read
        + embedded_io::ReadReady
        + embedded_io::Write
        + embedded_io::WriteReady
{
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PlatformCommand {
    Reboot,
    Dfu,
}

/// Actions requested on the terminal.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Requests {
    pub start: bool,
    pub stop: bool,
    /// Capture settings changed.
    pub reconfigure: bool,
    pub platform: Option<PlatformCommand>,
}

/// Pipeline state as shown on the terminal.
#[derive(Copy, Clone, Debug, Default)]
pub struct Snapshot {
    pub statistics: Statistics,
    pub buffers: Census,
}

/// Terminal state owned by the application.
pub struct Session {
    pub settings: Settings,
    pub snapshot: Snapshot,
    pub metadata: Option<&'static ApplicationMetadata>,
    limits: Limits,
    requests: Requests,
}

impl Session {
    pub fn new(
        settings: Settings,
        limits: Limits,
        metadata: Option<&'static ApplicationMetadata>,
    ) -> Self {
        Self {
            settings,
            snapshot: Snapshot::default(),
            metadata,
            limits,
            requests: Requests::default(),
        }
    }

    /// Collect the pending requests.
    pub fn take_requests(&mut self) -> Requests {
        core::mem::take(&mut self.requests)
    }
}

pub struct Terminal<I> {
    interface: I,
}

impl<I: Interface> Terminal<I> {
    fn handle_start(
        _menu: &menu::Menu<Self, Session>,
        _item: &menu::Item<Self, Session>,
        _args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        session.requests.start = true;
        session.requests.stop = false;
        writeln!(terminal, "Starting capture").ok();
    }

    fn handle_stop(
        _menu: &menu::Menu<Self, Session>,
        _item: &menu::Item<Self, Session>,
        _args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        session.requests.stop = true;
        session.requests.start = false;
        writeln!(terminal, "Stopping capture").ok();
    }

    fn handle_stats(
        _menu: &menu::Menu<Self, Session>,
        _item: &menu::Item<Self, Session>,
        _args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        let Snapshot {
            statistics: s,
            buffers: b,
        } = session.snapshot;
        let rows = [
            ("Completed", s.completed),
            ("Interrupts", s.interrupts),
            ("Overruns", s.overruns),
            ("Submitted", s.submitted),
            ("USB errors", s.usb_errors),
            ("DMA errors", s.dma_errors),
            ("Starved", s.starved),
        ];
        writeln!(
            terminal,
            "{:<20}: {}",
            "Capture",
            if s.active { "running" } else { "stopped" }
        )
        .ok();
        for (name, value) in rows {
            writeln!(terminal, "{name:<20}: {value}").ok();
        }
        writeln!(
            terminal,
            "{:<20}: free {} / capture {}+{} / done {} / ready {} / usb {}",
            "Buffers",
            b.free,
            b.queued_for_capture,
            b.owned_by_hardware,
            b.capture_done,
            b.queued_for_submission,
            b.owned_by_usb_hardware,
        )
        .ok();
    }

    fn handle_list(
        _menu: &menu::Menu<Self, Session>,
        _item: &menu::Item<Self, Session>,
        _args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        let defaults = Settings::default();
        let mut buffer = [0u8; 64];

        for path in Settings::iter_paths::<heapless::String<32>>("/") {
            let path = match path {
                Ok(path) => path,
                Err(e) => {
                    writeln!(terminal, "Failed to get path: {e}").ok();
                    continue;
                }
            };

            match session.settings.get_json(&path, &mut buffer) {
                Ok(len) => write!(terminal, "{path}: {}", json(&buffer[..len])),
                Err(e) => {
                    writeln!(terminal, "Failed to read {path}: {e}").ok();
                    continue;
                }
            }
            .ok();

            match defaults.get_json(&path, &mut buffer) {
                Ok(len) => {
                    writeln!(terminal, " [default: {}]", json(&buffer[..len]))
                }
                Err(e) => {
                    writeln!(terminal, " [default serialization error: {e}]")
                }
            }
            .ok();
        }
    }

    fn handle_get(
        _menu: &menu::Menu<Self, Session>,
        item: &menu::Item<Self, Session>,
        args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        let key = menu::argument_finder(item, args, "item").unwrap().unwrap();
        let mut buffer = [0u8; 64];
        match session.settings.get_json(key, &mut buffer) {
            Ok(len) => writeln!(terminal, "{key}: {}", json(&buffer[..len])),
            Err(e) => writeln!(terminal, "Failed to read {key}: {e}"),
        }
        .ok();
    }

    fn handle_set(
        _menu: &menu::Menu<Self, Session>,
        item: &menu::Item<Self, Session>,
        args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        let key = menu::argument_finder(item, args, "item").unwrap().unwrap();
        let value =
            menu::argument_finder(item, args, "value").unwrap().unwrap();

        let limits = session.limits;
        match session.settings.update(key, value, &limits) {
            Ok(reconfigure) => {
                session.requests.reconfigure |= reconfigure;
                writeln!(terminal, "Updated {key}")
            }
            Err(e) => writeln!(terminal, "Failed to update {key}: {e}"),
        }
        .ok();
    }

    fn handle_platform(
        _menu: &menu::Menu<Self, Session>,
        item: &menu::Item<Self, Session>,
        args: &[&str],
        terminal: &mut Self,
        session: &mut Session,
    ) {
        let cmd = menu::argument_finder(item, args, "cmd").unwrap().unwrap();
        match cmd {
            "reboot" => {
                session.requests.platform = Some(PlatformCommand::Reboot)
            }
            "dfu" => {
                session.requests.platform = Some(PlatformCommand::Dfu);
                writeln!(terminal, "Rebooting to DFU").ok();
            }
            "service" => {
                match session.metadata {
                    Some(metadata) => writeln!(terminal, "{metadata}"),
                    None => writeln!(terminal, "Service data not available"),
                }
                .ok();
            }
            _ => {
                writeln!(terminal, "Invalid platform command: `{cmd}`").ok();
            }
        }
    }

    fn menu<'a>() -> menu::Menu<'a, Self, Session> {
        menu::Menu {
            label: "iqstream",
            items: &[
                &menu::Item {
                    command: "start",
                    help: Some("Start sample capture"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_start,
                        parameters: &[],
                    },
                },
                &menu::Item {
                    command: "stop",
                    help: Some("Stop sample capture"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_stop,
                        parameters: &[],
                    },
                },
                &menu::Item {
                    command: "stats",
                    help: Some("Show pipeline counters and buffer states"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_stats,
                        parameters: &[],
                    },
                },
                &menu::Item {
                    command: "list",
                    help: Some("List all settings and their current values"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_list,
                        parameters: &[],
                    },
                },
                &menu::Item {
                    command: "get",
                    help: Some("Read a setting"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_get,
                        parameters: &[menu::Parameter::Mandatory {
                            parameter_name: "item",
                            help: Some("The path of the setting"),
                        }],
                    },
                },
                &menu::Item {
                    command: "set",
                    help: Some("Update a setting"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_set,
                        parameters: &[
                            menu::Parameter::Mandatory {
                                parameter_name: "item",
                                help: Some("The path of the setting"),
                            },
                            menu::Parameter::Mandatory {
                                parameter_name: "value",
                                help: Some(
                                    "The value to be written, JSON-encoded",
                                ),
                            },
                        ],
                    },
                },
                &menu::Item {
                    command: "platform",
                    help: Some("Platform specific commands"),
                    item_type: menu::ItemType::Callback {
                        function: Self::handle_platform,
                        parameters: &[menu::Parameter::Mandatory {
                            parameter_name: "cmd",
                            help: Some(
                                "The name of the command (e.g. `reboot`, `service`, `dfu`).",
                            ),
                        }],
                    },
                },
            ],
            entry: None,
            exit: None,
        }
    }
}

fn json(buffer: &[u8]) -> &str {
    core::str::from_utf8(buffer).unwrap_or("<invalid>")
}

impl<I: Interface> core::fmt::Write for Terminal<I> {
    /// Write data to the serial terminal.
    ///
    /// # Note
    /// Output is dropped while the interface cannot take it.
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        if let Ok(true) = self.interface.write_ready() {
            self.interface.write_all(s.as_bytes()).ok();
        }
        Ok(())
    }
}

impl<I: Interface> ErrorType for Terminal<I> {
    type Error = I::Error;
}

impl<I: Interface> embedded_io::Write for Terminal<I> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if let Ok(true) = self.interface.write_ready() {
            self.interface.write(buf).ok();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.interface.flush()
    }
}

/// The command line runner.
pub struct Console<'a, I: Interface>(
    menu::Runner<'a, Terminal<I>, Session, [u8]>,
);

impl<'a, I: Interface> Console<'a, I> {
    /// Constructor
    ///
    /// # Args
    /// * `interface` - The user interface.
    /// * `line_buf` - A buffer for the input line. It should be at least as long as the longest
    ///   user input.
    /// * `session` - The terminal state.
    pub fn new(
        interface: I,
        line_buf: &'a mut [u8],
        session: &mut Session,
    ) -> Self {
        Self(menu::Runner::new(
            Terminal::menu(),
            line_buf,
            Terminal { interface },
            session,
        ))
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.0.interface.interface
    }

    /// Must be called periodically to process user input.
    pub fn poll(&mut self, session: &mut Session) -> Result<(), I::Error> {
        while self.interface_mut().read_ready()? {
            let mut buffer = [0u8; 64];
            let count = self.interface_mut().read(&mut buffer)?;
            if count == 0 {
                break;
            }
            for &value in &buffer[..count] {
                self.0.input_byte(value, session);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_io::{Read, ReadReady, WriteReady};

    #[derive(Default)]
    struct Loopback {
        input: Vec<u8>,
        output: Vec<u8>,
    }

    impl ErrorType for Loopback {
        type Error = Infallible;
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
            let n = buf.len().min(self.input.len());
            buf[..n].copy_from_slice(&self.input[..n]);
            self.input.drain(..n);
            Ok(n)
        }
    }

    impl ReadReady for Loopback {
        fn read_ready(&mut self) -> Result<bool, Infallible> {
            Ok(!self.input.is_empty())
        }
    }

    impl embedded_io::Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    impl WriteReady for Loopback {
        fn write_ready(&mut self) -> Result<bool, Infallible> {
            Ok(true)
        }
    }

    fn session() -> Session {
        let limits = Limits {
            base: iq_pipeline::Config::default(),
            buffers: 16,
            buffer_size: 4096,
        };
        Session::new(Settings::default(), limits, None)
    }

    fn run(line: &str, session: &mut Session) -> String {
        let mut buf = [0u8; 64];
        let mut console = Console::new(Loopback::default(), &mut buf, session);
        console.interface_mut().output.clear();
        console.interface_mut().input.extend_from_slice(line.as_bytes());
        console.interface_mut().input.push(b'\r');
        console.poll(session).unwrap();
        String::from_utf8(core::mem::take(&mut console.interface_mut().output))
            .unwrap()
    }

    #[test]
    fn start_stop() {
        let mut session = session();
        run("start", &mut session);
        let requests = session.take_requests();
        assert!(requests.start);
        assert!(!requests.stop);
        assert_eq!(session.take_requests(), Requests::default());

        run("stop", &mut session);
        assert!(session.take_requests().stop);
    }

    #[test]
    fn set_requests_reconfigure() {
        let mut session = session();
        let output = run("set /chain_length 4", &mut session);
        assert!(output.contains("Updated /chain_length"));
        assert_eq!(session.settings.chain_length, 4);
        assert!(session.take_requests().reconfigure);

        run("set /restart \"Manual\"", &mut session);
        assert!(!session.take_requests().reconfigure);

        let output = run("set /gain 3", &mut session);
        assert!(output.contains("Failed to update /gain"));
    }

    #[test]
    fn rejected_chain_length() {
        let mut session = session();
        for value in ["0", "40"] {
            let line = format!("set /chain_length {value}");
            let output = run(&line, &mut session);
            assert!(output.contains("Failed to update /chain_length"));
            assert_eq!(session.settings, Settings::default());
            assert_eq!(session.take_requests(), Requests::default());
        }
    }

    #[test]
    fn get_and_list() {
        let mut session = session();
        let output = run("get /telemetry_period", &mut session);
        assert!(output.contains("/telemetry_period: 10"));

        run("set /divider 4", &mut session);
        let output = run("list", &mut session);
        assert!(output.contains("/divider: 4 [default: 2]"));
        assert!(output.contains("/width: \"Word\" [default: \"Word\"]"));
    }

    #[test]
    fn stats() {
        let mut session = session();
        session.snapshot.statistics.overruns = 3;
        session.snapshot.buffers.free = 16;
        let output = run("stats", &mut session);
        assert!(output.contains("Overruns            : 3"));
        assert!(output.contains("free 16"));
    }

    #[test]
    fn platform() {
        let mut session = session();
        run("platform dfu", &mut session);
        assert_eq!(
            session.take_requests().platform,
            Some(PlatformCommand::Dfu)
        );
        let output = run("platform service", &mut session);
        assert!(output.contains("Service data not available"));
    }
}
