//! Device signaling messages (JSON text frames / MQTT payloads).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::codec::AudioFormat;

pub const SERVER_HELLO_TEXT: &str = "欢迎使用小智服务器";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: Option<AudioFormat>,
        #[serde(default)]
        features: HashMap<String, bool>,
        #[serde(default)]
        version: Option<u32>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<ListenMode>,
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Iot {
        #[serde(default)]
        text: Option<String>,
        #[serde(flatten)]
        extra: serde_json::Map<String, Value>,
    },
    Mcp {
        payload: Value,
    },
    Goodbye {},
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Hello { .. } => "hello",
            ClientMessage::Listen { .. } => "listen",
            ClientMessage::Abort { .. } => "abort",
            ClientMessage::Iot { .. } => "iot",
            ClientMessage::Mcp { .. } => "mcp",
            ClientMessage::Goodbye {} => "goodbye",
        }
    }

    pub fn wants_mcp(&self) -> bool {
        matches!(self, ClientMessage::Hello { features, .. } if features.get("mcp").copied().unwrap_or(false))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

/// UDP channel parameters relayed to MQTT devices in `hello`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpParams {
    pub server: String,
    pub port: u16,
    pub key: String,
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        text: String,
        version: u32,
        transport: String,
        session_id: String,
        audio_params: AudioFormat,
        #[serde(skip_serializing_if = "Option::is_none")]
        udp: Option<UdpParams>,
    },
    Stt {
        text: String,
        session_id: String,
    },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
    },
    Iot {
        text: String,
        state: String,
        session_id: String,
    },
    Mcp {
        payload: Value,
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_hello() {
        let raw = r#"{"type":"hello","version":1,"transport":"websocket","features":{"mcp":true},
            "audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}}"#;
        let message = ClientMessage::parse(raw).unwrap();
        assert!(message.wants_mcp());
        match message {
            ClientMessage::Hello {
                transport, audio_params, ..
            } => {
                assert_eq!(transport.as_deref(), Some("websocket"));
                assert_eq!(audio_params, Some(AudioFormat::opus(16000, 1, 60)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_listen_and_control() {
        let listen = ClientMessage::parse(r#"{"type":"listen","state":"detect","text":"你好小智"}"#).unwrap();
        assert_eq!(
            listen,
            ClientMessage::Listen {
                state: ListenState::Detect,
                mode: None,
                text: Some("你好小智".into())
            }
        );
        assert_eq!(ClientMessage::parse(r#"{"type":"abort"}"#).unwrap().kind(), "abort");
        assert_eq!(
            ClientMessage::parse(r#"{"type":"goodbye","session_id":"x"}"#).unwrap().kind(),
            "goodbye"
        );
        assert!(ClientMessage::parse(r#"{"type":"dance"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_server_messages_wire_shape() {
        let tts = ServerMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some("你好".into()),
            session_id: "s1".into(),
        };
        assert_eq!(
            serde_json::to_value(&tts).unwrap(),
            json!({"type": "tts", "state": "sentence_start", "text": "你好", "session_id": "s1"})
        );

        let stop = ServerMessage::Tts {
            state: TtsState::Stop,
            text: None,
            session_id: "s1".into(),
        };
        assert_eq!(
            serde_json::to_value(&stop).unwrap(),
            json!({"type": "tts", "state": "stop", "session_id": "s1"})
        );

        let hello = ServerMessage::Hello {
            text: SERVER_HELLO_TEXT.into(),
            version: PROTOCOL_VERSION,
            transport: "udp".into(),
            session_id: "s1".into(),
            audio_params: AudioFormat::default(),
            udp: Some(UdpParams {
                server: "1.2.3.4".into(),
                port: 8990,
                key: "k".into(),
                nonce: "n".into(),
            }),
        };
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value["udp"]["port"], 8990);
        assert_eq!(value["audio_params"]["frame_duration"], 60);
    }
}
