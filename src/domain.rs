use serde::{Deserialize, Serialize};

/// scroll direction as reported to the browser and the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    #[default]
    None,
}

impl Direction {
    /// direction implied by a change in scroll position
    pub fn from_delta(delta_px: f64) -> Self {
        if delta_px > 0.0 {
            Direction::Down
        } else if delta_px < 0.0 {
            Direction::Up
        } else {
            Direction::None
        }
    }

    /// wire encoding used by the firmware: 1 = down, 0 = anything else
    pub fn as_bit(self) -> u8 {
        match self {
            Direction::Down => 1,
            Direction::Up | Direction::None => 0,
        }
    }
}

/// a raw scroll sample posted by the browser on each (throttled) scroll event
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollSample {
    /// scroll offset of the feed in pixels
    #[serde(alias = "positionPx")]
    pub scroll_position: f64,

    /// client clock in milliseconds; the server clock is used when absent
    #[serde(default, alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,

    /// video currently centered, when the client already knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_index: Option<i64>,

    /// height of one full-viewport video container
    #[serde(default, alias = "videoHeight", skip_serializing_if = "Option::is_none")]
    pub container_height: Option<f64>,

    /// total scrollable height of the feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_height: Option<f64>,
}

/// the single process-wide metrics record
///
/// replaced wholesale on every POST /api/scroll-metrics, read by the GET
/// endpoint, the dashboard and the relay.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrollMetrics {
    /// instantaneous speed in px/s
    pub current_speed: f64,
    /// simple moving average of recent instantaneous speeds in px/s
    pub average_speed: f64,
    /// running sum of absolute deltas since process start
    pub total_distance: f64,
    pub scroll_position: f64,
    pub direction: Direction,
    pub container_index: i64,
    pub total_containers: i64,
    /// time spent in the current container
    pub time_in_container_ms: i64,
    /// samples folded into this record since process start
    pub sample_count: u64,
}

/// motion command sent to the device, derived from a metrics snapshot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    /// servo angle 0..=180
    pub angle_deg: u8,
    /// 1 = down, 0 = up/none
    pub direction: u8,
    /// motor speed 0..=255
    pub speed_byte: u8,
    /// step interval for stepper-style firmware
    pub interval_ms: u32,
}

/// one entry of the video feed returned by GET /api
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoRecord {
    pub filename: String,
    pub url: String,
    pub channel: String,
    pub description: String,
    pub song: String,
    pub likes: u32,
    pub messages: u32,
    pub shares: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_sign_of_delta() {
        assert_eq!(Direction::from_delta(12.0), Direction::Down);
        assert_eq!(Direction::from_delta(-0.5), Direction::Up);
        assert_eq!(Direction::from_delta(0.0), Direction::None);
        assert_eq!(Direction::Down.as_bit(), 1);
        assert_eq!(Direction::None.as_bit(), 0);
    }

    #[test]
    fn sample_accepts_browser_aliases() {
        let sample: ScrollSample =
            serde_json::from_str(r#"{"positionPx": 640, "videoHeight": 800, "timestampMs": 5}"#)
                .unwrap();
        assert_eq!(sample.scroll_position, 640.0);
        assert_eq!(sample.container_height, Some(800.0));
        assert_eq!(sample.timestamp_ms, Some(5));
    }

    #[test]
    fn metrics_serialize_with_camel_case_names() {
        let json = serde_json::to_value(ScrollMetrics::default()).unwrap();
        assert_eq!(json["currentSpeed"], 0.0);
        assert_eq!(json["direction"], "none");
        assert_eq!(json["totalContainers"], 0);
    }
}
