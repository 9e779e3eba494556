//! Protocol commands
//!
//! Defines the commands understood by the IR module and their wire encoding.

use serde::{Deserialize, Serialize};

const CMD_SET_STATE_IDLE: &str = "SET_STATE {STATE:IDL_STATE}";
const CMD_SET_STATE_BUTTON: &str = "SET_STATE {STATE:BUT_STATE}";
const CMD_SET_STATE_RECORD: &str = "SET_STATE {STATE:REC_STATE}";
const CMD_PING: &str = "PING {}";
const CMD_SEND_IR_PREFIX: &str = "SEND_IR ";

/// Operating mode of the IR module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Module does nothing until told otherwise
    Idle,
    /// Physical buttons on the module report presses
    Button,
    /// Module captures the next IR code it sees
    Record,
}

/// Commands sent to the IR module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Switch the module to another operating mode
    SetState(DeviceState),

    /// Liveness probe
    Ping,

    /// Transmit a previously recorded code.
    ///
    /// The payload is sent verbatim, e.g. `{codeLen:32,codeType:3,codeValue:16689239}`.
    /// It must not contain a line delimiter.
    SendIr(String),
}

impl Command {
    /// Encode the command into the bytes written to the transport
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::SetState(DeviceState::Idle) => CMD_SET_STATE_IDLE.as_bytes().to_vec(),
            Command::SetState(DeviceState::Button) => CMD_SET_STATE_BUTTON.as_bytes().to_vec(),
            Command::SetState(DeviceState::Record) => CMD_SET_STATE_RECORD.as_bytes().to_vec(),
            Command::Ping => CMD_PING.as_bytes().to_vec(),
            Command::SendIr(payload) => {
                let mut bytes = Vec::with_capacity(CMD_SEND_IR_PREFIX.len() + payload.len());
                bytes.extend_from_slice(CMD_SEND_IR_PREFIX.as_bytes());
                bytes.extend_from_slice(payload.as_bytes());
                bytes
            }
        }
    }

    /// Short name used in log output
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetState(_) => "SET_STATE",
            Command::Ping => "PING",
            Command::SendIr(_) => "SEND_IR",
        }
    }
}
