use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable constants of the playback and transcode loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Sleep between polls while paused or waiting for data.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Granularity of the sleep-until-due pacing wait.
    #[serde(with = "millis")]
    pub pacing_step: Duration,
    /// Back-off while the network throttle holds the feeder.
    #[serde(with = "millis")]
    pub net_wait: Duration,
    /// Idle wait of a pump iteration that made no progress.
    #[serde(with = "millis")]
    pub output_poll: Duration,
    /// Source frame rate at and above which 2:1 decimation kicks in.
    pub decimation_threshold: u32,
    /// Minimum change, in percentage points, between two clip progress events.
    pub progress_step: f32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(16),
            pacing_step: Duration::from_millis(2),
            net_wait: Duration::from_millis(100),
            output_poll: Duration::from_millis(2),
            decimation_threshold: 50,
            progress_step: 1.0,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() -> anyhow::Result<()> {
        let json = r#"{"poll_interval": 5, "decimation_threshold": 30}"#;
        let timing: Timing = serde_json::from_str(json)?;
        assert_eq!(timing.poll_interval, Duration::from_millis(5));
        assert_eq!(timing.decimation_threshold, 30);
        assert_eq!(timing.pacing_step, Duration::from_millis(2));
        assert_eq!(timing.progress_step, 1.0);
        Ok(())
    }
}
