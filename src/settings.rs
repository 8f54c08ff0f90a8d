//! Run-time settings
//!
//! Settings form a [miniconf::Tree] and are addressed by path, e.g. `/chain_length`. Values are
//! JSON encoded: `set /width "HalfWord"` or `set /chain_length 4`.
//!
//! An update is only applied if the resulting settings still describe a valid capture
//! configuration for the buffer pool, see [Limits].
use iq_pipeline::descriptor::SampleWidth;
use iq_pipeline::hal::{CaptureConfig, ClockSource};
use iq_pipeline::{Config, RestartPolicy};
use miniconf::{JsonCoreSlash, Tree};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid setting: {0}")]
    Update(miniconf::Error<serde_json_core::de::Error>),
    #[error("Capture divider must be at least 1")]
    Divider,
    #[error(transparent)]
    Pipeline(#[from] iq_pipeline::Error),
}

/// What the settings are checked against: the fixed part of the capture configuration and the
/// dimensions of the buffer pool.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Limits {
    pub base: Config,
    pub buffers: usize,
    pub buffer_size: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Tree)]
pub struct Settings {
    /// Sample clock of the front end.
    #[tree(with=miniconf::leaf)]
    pub clock: ClockSource,
    /// Kernel clock divider of the sample port.
    pub divider: u8,
    /// Width of each sample port read.
    #[tree(with=miniconf::leaf)]
    pub width: SampleWidth,
    /// Number of buffers kept queued for capture.
    pub chain_length: usize,
    /// When capture resumes after an overrun.
    #[tree(with=miniconf::leaf)]
    pub restart: RestartPolicy,
    /// Telemetry period in seconds.
    pub telemetry_period: u16,
    /// Start capture at boot.
    pub autostart: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            clock: capture.clock,
            divider: capture.divider,
            width: capture.width,
            chain_length: 8,
            restart: RestartPolicy::default(),
            telemetry_period: 10,
            autostart: true,
        }
    }
}

impl Settings {
    /// The pipeline configuration with these settings applied on top of `base`.
    pub fn pipeline(&self, base: &Config) -> Config {
        Config {
            chain_length: self.chain_length,
            capture: CaptureConfig {
                clock: self.clock,
                divider: self.divider,
                width: self.width,
            },
            ..*base
        }
    }

    /// Check that the settings can be applied to the pipeline.
    pub fn validate(&self, limits: &Limits) -> Result<(), SettingsError> {
        if self.divider == 0 {
            return Err(SettingsError::Divider);
        }
        self.pipeline(&limits.base)
            .validate(limits.buffers, limits.buffer_size)?;
        Ok(())
    }

    /// Update the setting at `path` from its JSON representation.
    ///
    /// The settings are left unchanged if the value does not parse or the result does not
    /// validate against `limits`.
    ///
    /// # Returns
    /// True if the change affects the capture path and requires reconfiguration.
    pub fn update(
        &mut self,
        path: &str,
        value: &str,
        limits: &Limits,
    ) -> Result<bool, SettingsError> {
        let mut updated = self.clone();
        updated
            .set_json(path, value.as_bytes())
            .map_err(SettingsError::Update)?;
        updated.validate(limits)?;

        let reconfigure =
            updated.pipeline(&limits.base) != self.pipeline(&limits.base);
        *self = updated;
        Ok(reconfigure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miniconf::TreeKey;

    const LIMITS: Limits = Limits {
        base: Config {
            chain_length: 8,
            capture: CaptureConfig {
                clock: ClockSource::Internal,
                divider: 2,
                width: SampleWidth::Word,
            },
            request_len: 32,
            trigger: arbitrary_int::u6::new(22),
        },
        buffers: 16,
        buffer_size: 4096,
    };

    #[test]
    fn default_pipeline() {
        let config = Settings::default().pipeline(&LIMITS.base);
        assert_eq!(config.chain_length, 8);
        assert_eq!(config.capture, CaptureConfig::default());
        assert_eq!(config.request_len, LIMITS.base.request_len);
        Settings::default().validate(&LIMITS).unwrap();
    }

    #[test]
    fn update_by_path() {
        let mut s = Settings::default();
        assert!(s.update("/width", "\"HalfWord\"", &LIMITS).unwrap());
        assert_eq!(s.width, SampleWidth::HalfWord);
        assert!(s.update("/clock", "\"External\"", &LIMITS).unwrap());
        assert_eq!(s.clock, ClockSource::External);
        assert!(s.update("/chain_length", "4", &LIMITS).unwrap());
        assert_eq!(s.chain_length, 4);
        assert!(!s.update("/restart", "\"Manual\"", &LIMITS).unwrap());
        assert_eq!(s.restart, RestartPolicy::Manual);
        assert!(!s.update("/autostart", "false", &LIMITS).unwrap());
        assert!(!s.autostart);
        // Writing the current value changes nothing on the capture path.
        assert!(!s.update("/chain_length", "4", &LIMITS).unwrap());
    }

    #[test]
    fn invalid_updates_roll_back() {
        let mut s = Settings::default();
        assert!(matches!(
            s.update("/gain", "1", &LIMITS),
            Err(SettingsError::Update(_))
        ));
        assert!(matches!(
            s.update("/divider", "\"fast\"", &LIMITS),
            Err(SettingsError::Update(_))
        ));
        assert!(matches!(
            s.update("/divider", "0", &LIMITS),
            Err(SettingsError::Divider)
        ));
        assert!(matches!(
            s.update("/chain_length", "0", &LIMITS),
            Err(SettingsError::Pipeline(iq_pipeline::Error::ChainLength(
                0,
                16
            )))
        ));
        assert!(matches!(
            s.update("/chain_length", "40", &LIMITS),
            Err(SettingsError::Pipeline(iq_pipeline::Error::ChainLength(
                40,
                16
            )))
        ));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn paths() {
        let paths: Vec<heapless::String<32>> =
            Settings::iter_paths::<heapless::String<32>>("/")
                .map(Result::unwrap)
                .collect();
        assert_eq!(paths.len(), 7);
        assert!(paths.iter().any(|p| p == "/chain_length"));

        let mut buf = [0u8; 32];
        let len = Settings::default().get_json("/width", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"\"Word\"");
    }

    #[test]
    fn json() {
        let mut buf = [0u8; 256];
        let len = serde_json_core::to_slice(&Settings::default(), &mut buf)
            .unwrap();
        let (s, _): (Settings, _) =
            serde_json_core::from_slice(&buf[..len]).unwrap();
        assert_eq!(s, Settings::default());
    }
}
