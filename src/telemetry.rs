use iq_pipeline::{Census, Statistics};
use serde::Serialize;

/// Capacity of a serialized telemetry report.
pub const REPORT_SIZE: usize = 512;

/// Tracks counters between telemetry reports.
///
/// # Note
/// Counters are cumulative in the pipeline. Rates are computed from the difference to the previous
/// report when the report is generated, keeping the capture path free of any bookkeeping.
#[derive(Clone, Default)]
pub struct TelemetryBuffer {
    last: Statistics,
}

/// The telemetry structure is data that is ultimately reported as a JSON log record.
#[derive(Serialize)]
pub struct Telemetry {
    pub statistics: Statistics,

    /// Number of buffers per state.
    pub buffers: Census,

    /// Captured bytes per second over the last period.
    pub capture_rate: u32,

    /// Bytes per second handed to USB over the last period.
    pub submit_rate: u32,

    /// Overruns during the last period.
    pub new_overruns: u32,
}

impl TelemetryBuffer {
    /// Finalize a report and start a new period.
    ///
    /// # Args
    /// * `statistics` - The current pipeline counters.
    /// * `buffers` - The current buffer census.
    /// * `buffer_size` - The size of each capture buffer in bytes.
    /// * `period` - The time since the last report in seconds.
    pub fn finalize(
        &mut self,
        statistics: Statistics,
        buffers: Census,
        buffer_size: usize,
        period: u16,
    ) -> Telemetry {
        let last = core::mem::replace(&mut self.last, statistics);
        let rate = |now: u32, then: u32| {
            let bytes = now.wrapping_sub(then) as u64 * buffer_size as u64;
            (bytes / period.max(1) as u64).min(u32::MAX as u64) as u32
        };

        Telemetry {
            statistics,
            buffers,
            capture_rate: rate(statistics.completed, last.completed),
            submit_rate: rate(statistics.submitted, last.submitted),
            new_overruns: statistics.overruns.wrapping_sub(last.overruns),
        }
    }
}

impl Telemetry {
    /// Emit the report on the log.
    pub fn publish(&self) {
        match serde_json_core::to_string::<_, REPORT_SIZE>(self) {
            Ok(report) => log::info!("Telemetry: {report}"),
            Err(e) => log::warn!("Telemetry serialization failed: {e:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates() {
        let mut buffer = TelemetryBuffer::default();
        let stats = Statistics {
            completed: 100,
            submitted: 90,
            overruns: 1,
            ..Default::default()
        };
        let t = buffer.finalize(stats, Census::default(), 4096, 10);
        assert_eq!(t.capture_rate, 40960);
        assert_eq!(t.submit_rate, 36864);
        assert_eq!(t.new_overruns, 1);

        let stats = Statistics {
            completed: 110,
            submitted: 110,
            overruns: 1,
            ..stats
        };
        let t = buffer.finalize(stats, Census::default(), 4096, 0);
        assert_eq!(t.capture_rate, 40960);
        assert_eq!(t.submit_rate, 81920);
        assert_eq!(t.new_overruns, 0);
    }

    #[test]
    fn fits_report() {
        let t = TelemetryBuffer::default().finalize(
            Statistics {
                completed: u32::MAX,
                interrupts: u32::MAX,
                overruns: u32::MAX,
                submitted: u32::MAX,
                usb_errors: u32::MAX,
                dma_errors: u32::MAX,
                starved: u32::MAX,
                active: true,
            },
            Census::default(),
            1 << 16,
            1,
        );
        assert!(serde_json_core::to_string::<_, REPORT_SIZE>(&t).is_ok());
    }
}
