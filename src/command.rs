//! ==============================================================================
//! command.rs - metrics -> device command transform and wire encoding
//! ==============================================================================
//!
//! purpose:
//!     turns a ScrollMetrics snapshot into the small motion command the
//!     firmware understands, and encodes it for the wire.
//!
//! wire formats:
//!     json (default): {"type":"scroll_data","angle":90,"direction":1,"speed":120,"interval":833}\n
//!     csv:            90,1\n
//!
//! ==============================================================================

use serde::Deserialize;
use serde_json::json;

use crate::domain::{DeviceCommand, ScrollMetrics};

/// scroll positions are scaled as if they were a 0..=255 byte
pub const POSITION_SCALE: f64 = 255.0;
pub const MAX_ANGLE: u8 = 180;

pub const MIN_INTERVAL_MS: u32 = 100;
pub const MAX_INTERVAL_MS: u32 = 10_000;
/// interval = INTERVAL_SCALE / average speed (px/s)
const INTERVAL_SCALE: f64 = 100_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Csv,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireFormat::Json => f.write_str("json"),
            WireFormat::Csv => f.write_str("csv"),
        }
    }
}

/// servo angle for a scroll position, clamped rather than wrapped
pub fn scroll_to_angle(position: f64) -> u8 {
    if !position.is_finite() {
        return 0;
    }
    (position * f64::from(MAX_ANGLE) / POSITION_SCALE)
        .round()
        .clamp(0.0, f64::from(MAX_ANGLE)) as u8
}

pub fn speed_to_byte(speed: f64) -> u8 {
    if !speed.is_finite() {
        return 0;
    }
    speed.round().clamp(0.0, 255.0) as u8
}

/// faster scrolling -> shorter step interval; idle -> slowest interval
pub fn speed_to_interval(average_speed: f64) -> u32 {
    if !average_speed.is_finite() || average_speed <= 0.0 {
        return MAX_INTERVAL_MS;
    }
    (INTERVAL_SCALE / average_speed)
        .round()
        .clamp(f64::from(MIN_INTERVAL_MS), f64::from(MAX_INTERVAL_MS)) as u32
}

impl DeviceCommand {
    pub fn from_metrics(metrics: &ScrollMetrics) -> Self {
        Self {
            angle_deg: scroll_to_angle(metrics.scroll_position),
            direction: metrics.direction.as_bit(),
            speed_byte: speed_to_byte(metrics.current_speed),
            interval_ms: speed_to_interval(metrics.average_speed),
        }
    }

    /// json message shared by the serial and websocket transports
    pub fn to_message(&self) -> serde_json::Value {
        json!({
            "type": "scroll_data",
            "angle": self.angle_deg,
            "direction": self.direction,
            "speed": self.speed_byte,
            "interval": self.interval_ms,
        })
    }

    /// newline-terminated line for a serial link
    pub fn encode(&self, format: WireFormat) -> String {
        match format {
            WireFormat::Json => format!("{}\n", self.to_message()),
            WireFormat::Csv => format!("{},{}\n", self.angle_deg, self.direction),
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;

    #[test]
    fn angle_scales_and_clamps() {
        assert_eq!(scroll_to_angle(0.0), 0);
        assert_eq!(scroll_to_angle(255.0), 180);
        assert_eq!(scroll_to_angle(127.0), 90); // 89.6 rounds up
        for p in 0..=255 {
            let expected = (f64::from(p) * 180.0 / 255.0).round() as u8;
            assert_eq!(scroll_to_angle(f64::from(p)), expected);
        }
        assert_eq!(scroll_to_angle(4000.0), 180);
        assert_eq!(scroll_to_angle(-30.0), 0);
        assert_eq!(scroll_to_angle(f64::NAN), 0);
    }

    #[test]
    fn interval_is_bounded() {
        assert_eq!(speed_to_interval(0.0), MAX_INTERVAL_MS);
        assert_eq!(speed_to_interval(1.0), MAX_INTERVAL_MS);
        assert_eq!(speed_to_interval(1000.0), 100);
        assert_eq!(speed_to_interval(120.0), 833);
        assert_eq!(speed_to_interval(f64::INFINITY), MAX_INTERVAL_MS);
    }

    #[test]
    fn command_from_metrics() {
        let metrics = ScrollMetrics {
            scroll_position: 255.0,
            current_speed: 900.0,
            average_speed: 500.0,
            direction: Direction::Down,
            ..Default::default()
        };
        let cmd = DeviceCommand::from_metrics(&metrics);
        assert_eq!(
            cmd,
            DeviceCommand {
                angle_deg: 180,
                direction: 1,
                speed_byte: 255,
                interval_ms: 200,
            }
        );
    }

    #[test]
    fn encodes_json_and_csv_lines() {
        let cmd = DeviceCommand {
            angle_deg: 90,
            direction: 0,
            speed_byte: 12,
            interval_ms: 833,
        };
        assert_eq!(cmd.encode(WireFormat::Csv), "90,0\n");

        let line = cmd.encode(WireFormat::Json);
        assert!(line.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["type"], "scroll_data");
        assert_eq!(parsed["angle"], 90);
        assert_eq!(parsed["interval"], 833);
    }
}
