//! Serial Protocol Communication
//!
//! Implements the line-oriented text protocol spoken by the IR module.
//!
//! Commands go out as fixed ASCII literals; responses come back one per line
//! and are classified case-insensitively into typed events.

pub mod commands;
mod connection;
mod error;
pub mod lines;
mod listener;
mod observer;
pub mod response;
pub mod serial;
pub mod stream;

pub use commands::{Command, DeviceState};
pub use connection::{
    ConnectionState, DeviceSession, SessionConfig, Transport, TransportSignal,
};
pub use error::ProtocolError;
pub use lines::{Frame, LineAssembler};
pub use listener::CommandListener;
pub use observer::{ConnectionObservable, ConnectionSubscription};
pub use response::{parse, Event};
pub use serial::{
    clear_buffers, configure_port, list_ports, open_port, PortInfo, SerialConfig, SerialLink,
    SerialTransport,
};
pub use stream::{ByteChannel, Received};

/// Default baud rate of the IR module's USB serial bridge
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default serial read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;
