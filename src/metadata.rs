use core::fmt;
use serde::Serialize;

#[derive(Serialize)]
pub struct ApplicationMetadata {
    pub firmware_version: &'static str,
    pub rust_version: &'static str,
    pub profile: &'static str,
    pub git_dirty: bool,
    pub features: &'static str,
    pub panic_info: &'static str,
    pub buffers: usize,
    pub buffer_size: usize,
}

impl fmt::Display for ApplicationMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<20}: {} [{}]{}",
            "Version",
            self.firmware_version,
            self.profile,
            if self.git_dirty { " dirty" } else { "" }
        )?;
        writeln!(f, "{:<20}: {}", "Rustc Version", self.rust_version)?;
        writeln!(f, "{:<20}: {}", "Features", self.features)?;
        writeln!(
            f,
            "{:<20}: {} x {} bytes",
            "Buffers", self.buffers, self.buffer_size
        )?;
        write!(f, "{:<20}: {}", "Panic Info", self.panic_info)
    }
}
