// Message types shared by the controller, the runtime and the robot link

use serde::{Deserialize, Serialize};

/// Raw stick position from the remote controller, axes in [-1, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StickSample {
    pub x: f32,
    pub y: f32,
    /// Sender clock, seconds
    pub timestamp: f64,
}

/// Wheel command for the robot, each side in [-100, 100]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorCommand {
    pub left: i8,
    pub right: i8,
}

impl MotorCommand {
    pub const STOP: MotorCommand = MotorCommand { left: 0, right: 0 };
    pub const MAX: i8 = 100;

    /// Build a command, clamping both sides into [-100, 100]
    pub fn new(left: i32, right: i32) -> Self {
        let max = Self::MAX as i32;
        Self {
            left: left.clamp(-max, max) as i8,
            right: right.clamp(-max, max) as i8,
        }
    }

    pub fn is_stop(&self) -> bool {
        *self == Self::STOP
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingCommand {
    #[serde(alias = "start")]
    StartEpisode,
    #[serde(alias = "stop")]
    EndEpisode,
}

/// Controller -> runtime
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Stick {
        x: f32,
        y: f32,
        #[serde(default)]
        ts: f64,
    },
    Estop {
        #[serde(default)]
        reason: String,
    },
    Resume {},
    Recording {
        command: RecordingCommand,
    },
    Ping {
        #[serde(default)]
        ts: f64,
    },
    /// Echo of one of our pings
    Pong {
        ts: f64,
    },
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Snapshot of the runtime published to controllers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub link: &'static str,
    pub estop_reason: Option<String>,
    pub recording: bool,
    pub episode_index: Option<u64>,
    pub left: i8,
    pub right: i8,
    pub collision: bool,
    /// Wheel speeds the cube last reported, when speed feedback is on
    pub motor_speed: Option<[u8; 2]>,
    pub latency_ms: Option<f64>,
}

/// Runtime -> controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ping { ts: f64 },
    Pong { ts: f64 },
    Status(StatusReport),
    Notice { level: NoticeLevel, message: String },
}

impl OutboundMessage {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self::Notice {
            level,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Wall clock in seconds, used for wire timestamps
pub fn wall_clock() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stick() {
        let msg = InboundMessage::parse(r#"{"type":"stick","x":0.5,"y":-1.0,"ts":12.5}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Stick {
                x: 0.5,
                y: -1.0,
                ts: 12.5
            }
        );
    }

    #[test]
    fn test_parse_stick_without_timestamp() {
        let msg = InboundMessage::parse(r#"{"type":"stick","x":0.1,"y":0.2}"#).unwrap();
        assert!(matches!(msg, InboundMessage::Stick { ts, .. } if ts == 0.0));
    }

    #[test]
    fn test_parse_estop_and_resume() {
        let msg = InboundMessage::parse(r#"{"type":"estop","reason":"button"}"#).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Estop {
                reason: "button".to_string()
            }
        );

        let msg = InboundMessage::parse(r#"{"type":"estop"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Estop { reason: String::new() });

        let msg = InboundMessage::parse(r#"{"type":"resume"}"#).unwrap();
        assert_eq!(msg, InboundMessage::Resume {});
    }

    #[test]
    fn test_parse_recording_commands_and_aliases() {
        for (text, expected) in [
            ("start_episode", RecordingCommand::StartEpisode),
            ("end_episode", RecordingCommand::EndEpisode),
            ("start", RecordingCommand::StartEpisode),
            ("stop", RecordingCommand::EndEpisode),
        ] {
            let json = format!(r#"{{"type":"recording","command":"{}"}}"#, text);
            assert_eq!(
                InboundMessage::parse(&json).unwrap(),
                InboundMessage::Recording { command: expected }
            );
        }
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(InboundMessage::parse("not json").is_err());
        assert!(InboundMessage::parse(r#"{"type":"teleport"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"type":"stick","x":"fast"}"#).is_err());
        assert!(InboundMessage::parse(r#"{"type":"recording","command":"rewind"}"#).is_err());
    }

    #[test]
    fn test_outbound_encoding() {
        let json = OutboundMessage::Ping { ts: 1.5 }.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping","ts":1.5}"#);

        let status = OutboundMessage::Status(StatusReport {
            link: "estopped",
            estop_reason: Some("operator".to_string()),
            recording: false,
            episode_index: None,
            left: 0,
            right: 0,
            collision: false,
            motor_speed: Some([40, 38]),
            latency_ms: None,
        });
        let value: serde_json::Value = serde_json::from_str(&status.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["link"], "estopped");
        assert_eq!(value["estop_reason"], "operator");
        assert_eq!(value["motor_speed"], serde_json::json!([40, 38]));

        let notice = OutboundMessage::notice(NoticeLevel::Warning, "already recording");
        let value: serde_json::Value = serde_json::from_str(&notice.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "notice");
        assert_eq!(value["level"], "warning");
    }

    #[test]
    fn test_motor_command_clamps() {
        assert_eq!(MotorCommand::new(250, -250), MotorCommand { left: 100, right: -100 });
        assert!(MotorCommand::new(0, 0).is_stop());
    }
}
