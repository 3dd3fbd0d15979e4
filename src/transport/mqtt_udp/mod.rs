//! MQTT signaling with an AES-CTR encrypted UDP audio channel.

pub mod adapter;
pub mod conn;
pub mod udp;

pub use adapter::{MqttConfig, MqttScheme, MqttUdpAdapter, NewTransportHandler};
pub use conn::{KEY_AES, KEY_FULL_NONCE, MqttUdpTransport, SignalPublisher};
pub use udp::{UdpServer, UdpSession};
