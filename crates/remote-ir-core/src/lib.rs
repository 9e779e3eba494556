//! # Remote IR Core Library
//!
//! Serial protocol layer for the remote-IR app's record/replay module.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A bounded blocking byte channel between the transport and the parser
//! - Command encoding and case-insensitive response parsing
//! - A device session with a single protocol listener and a connection
//!   state broadcast
//! - A `serialport` based transport for desktop hosts
//!
//! ## Example
//!
//! ```rust,ignore
//! use remote_ir_core::protocol::{DeviceSession, DeviceState, SerialConfig, SerialTransport};
//!
//! let session = DeviceSession::new(Default::default())?;
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! session.register_listener(tx);
//!
//! let _link = SerialTransport::connect(&session, &SerialConfig::new("/dev/ttyACM0"))?;
//! session.send_set_state(DeviceState::Record)?;
//!
//! if let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        Command, CommandListener, ConnectionObservable, ConnectionState, DeviceSession,
        DeviceState, Event, ProtocolError, SessionConfig, Transport, TransportSignal,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
