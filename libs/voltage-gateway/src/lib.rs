//! Modbus RTU over an MQTT serial gateway
//!
//! The meter sits behind a hardware gateway that forwards hex-encoded RTU
//! frames from a command topic onto the serial bus, and publishes the register
//! bytes it read back on a data topic.
//!
//! ```text
//! voltage-gateway
//!     ├── frame          (RTU read frame + CRC16)
//!     ├── transport      (GatewayTransport: single-slot request/reply)
//!     ├── connection     (LinkSupervisor: broker lifecycle and backoff)
//!     ├── pubsub         (PubSubClient / LinkEvents seams, rumqttc impl)
//!     └── logger         (BusLogger injected into the above)
//! ```

pub mod connection;
pub mod error;
pub mod frame;
pub mod logger;
pub mod pubsub;
pub mod transport;

pub use connection::{
    ConnectionState, LinkState, LinkSupervisor, ReconnectPolicy, SupervisorConfig,
};
pub use error::{GatewayError, Result};
pub use frame::{build_read_frame, crc16, FC_READ_HOLDING_REGISTERS};
pub use logger::BusLogger;
pub use pubsub::{
    LinkEvent, LinkEvents, MessageHandler, MqttEventLoop, MqttPubSub, MqttSettings, PubSubClient,
};
pub use transport::{GatewayTransport, RegisterBus, TransportConfig};
