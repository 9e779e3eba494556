//! Response parsing
//!
//! Classifies one line of module output into an [`Event`].
//!
//! Matching is case-insensitive and runs against a single lower-cased copy of
//! the line. Payloads are cut from the original line at fixed character
//! offsets, so each offset below is tied to the length of its keyword.

use serde::{Deserialize, Serialize};

/// A typed response from the IR module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A physical button on the module was pressed
    ButtonPressed {
        /// Button number (single digit)
        button_id: u8,
    },
    /// An IR code was captured while in record mode
    RecordedCode {
        /// Code description, e.g. `{codeLen:32,codeType:3,codeValue:16689239}`
        payload: String,
    },
    /// Reply to `PING {}`
    PingResponse {
        /// Ping body, starting at the opening brace
        payload: String,
    },
    /// Acknowledgement of `SET_STATE`
    StateSetSuccess {
        /// State body, starting at the opening brace
        state_label: String,
    },
    /// Acknowledgement of `SEND_IR`
    SendSuccess {
        /// Echo of the transmitted code
        payload: String,
    },
    /// The module reported an error
    DeviceError {
        /// Full line as received
        raw_message: String,
    },
    /// Line did not match any known response
    Unrecognized {
        /// Full line as received
        raw_message: String,
    },
}

impl Event {
    /// Short name used in log output
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ButtonPressed { .. } => "button_pressed",
            Event::RecordedCode { .. } => "recorded_code",
            Event::PingResponse { .. } => "ping_response",
            Event::StateSetSuccess { .. } => "state_set_success",
            Event::SendSuccess { .. } => "send_success",
            Event::DeviceError { .. } => "device_error",
            Event::Unrecognized { .. } => "unrecognized",
        }
    }
}

type Extractor = fn(&str) -> Option<Event>;

/// Keywords in priority order. Error wins over everything else.
const RESPONSE_PATTERNS: &[(&str, Extractor)] = &[
    ("error", device_error),
    ("recorded {", recorded_code),
    ("ping {current_state:", ping_response),
    ("btn_pressed {", button_pressed),
    ("set_state {succ:", state_set_success),
    ("sent ", send_success),
];

/// Characters from `offset` to the end of the original line
fn tail(line: &str, offset: usize) -> String {
    line.chars().skip(offset).collect()
}

fn device_error(line: &str) -> Option<Event> {
    Some(Event::DeviceError {
        raw_message: line.to_string(),
    })
}

fn recorded_code(line: &str) -> Option<Event> {
    Some(Event::RecordedCode {
        payload: tail(line, 9),
    })
}

fn ping_response(line: &str) -> Option<Event> {
    Some(Event::PingResponse {
        payload: tail(line, 5),
    })
}

fn button_pressed(line: &str) -> Option<Event> {
    let digit = line.chars().nth(13)?.to_digit(10)?;
    Some(Event::ButtonPressed {
        button_id: digit as u8,
    })
}

fn state_set_success(line: &str) -> Option<Event> {
    Some(Event::StateSetSuccess {
        state_label: tail(line, 10),
    })
}

fn send_success(line: &str) -> Option<Event> {
    Some(Event::SendSuccess {
        payload: tail(line, 5),
    })
}

/// Classify one complete response line
///
/// A line whose keyword matches but whose payload cannot be extracted (a
/// button event without a digit at its expected position) is reported as
/// [`Event::Unrecognized`].
pub fn parse(line: &str) -> Event {
    let folded = line.to_lowercase();

    RESPONSE_PATTERNS
        .iter()
        .find(|(keyword, _)| folded.contains(keyword))
        .and_then(|(_, extract)| extract(line))
        .unwrap_or_else(|| Event::Unrecognized {
            raw_message: line.to_string(),
        })
}
