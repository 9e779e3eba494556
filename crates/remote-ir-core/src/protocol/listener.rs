//! Protocol event listener
//!
//! Only one listener is active on a session at a time: whichever screen
//! currently drives the module owns the slot.

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::response::Event;

/// Receiver of parsed module responses.
///
/// All callbacks run on the session's dispatch loop, one at a time and in
/// the order the lines arrived. Every method defaults to a no-op.
pub trait CommandListener: Send {
    /// A physical button on the module was pressed
    fn button_pressed(&mut self, _button_id: u8) {}

    /// An IR code was captured
    fn recorded_code(&mut self, _payload: &str) {}

    /// The module answered a ping
    fn ping_response(&mut self, _payload: &str) {}

    /// The module switched state
    fn state_set_success(&mut self, _state_label: &str) {}

    /// The module transmitted an IR code
    fn send_success(&mut self, _payload: &str) {}

    /// The module reported an error
    fn device_error(&mut self, _raw_message: &str) {}
}

/// Forward `event` to the matching callback of `listener`
pub(crate) fn dispatch(listener: &mut dyn CommandListener, event: &Event) {
    match event {
        Event::ButtonPressed { button_id } => listener.button_pressed(*button_id),
        Event::RecordedCode { payload } => listener.recorded_code(payload),
        Event::PingResponse { payload } => listener.ping_response(payload),
        Event::StateSetSuccess { state_label } => listener.state_set_success(state_label),
        Event::SendSuccess { payload } => listener.send_success(payload),
        Event::DeviceError { raw_message } => listener.device_error(raw_message),
        Event::Unrecognized { raw_message } => {
            warn!(line = %raw_message, "Received unknown response from module");
        }
    }
}

/// Forwards every event into a channel, for consumers that prefer awaiting
/// events over implementing callbacks.
impl CommandListener for UnboundedSender<Event> {
    fn button_pressed(&mut self, button_id: u8) {
        forward(self, Event::ButtonPressed { button_id });
    }

    fn recorded_code(&mut self, payload: &str) {
        forward(
            self,
            Event::RecordedCode {
                payload: payload.to_string(),
            },
        );
    }

    fn ping_response(&mut self, payload: &str) {
        forward(
            self,
            Event::PingResponse {
                payload: payload.to_string(),
            },
        );
    }

    fn state_set_success(&mut self, state_label: &str) {
        forward(
            self,
            Event::StateSetSuccess {
                state_label: state_label.to_string(),
            },
        );
    }

    fn send_success(&mut self, payload: &str) {
        forward(
            self,
            Event::SendSuccess {
                payload: payload.to_string(),
            },
        );
    }

    fn device_error(&mut self, raw_message: &str) {
        forward(
            self,
            Event::DeviceError {
                raw_message: raw_message.to_string(),
            },
        );
    }
}

fn forward(tx: &UnboundedSender<Event>, event: Event) {
    if tx.send(event).is_err() {
        debug!("Listener channel receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::response::parse;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl CommandListener for Recorder {
        fn button_pressed(&mut self, button_id: u8) {
            self.calls.push(format!("button:{button_id}"));
        }

        fn device_error(&mut self, raw_message: &str) {
            self.calls.push(format!("error:{raw_message}"));
        }
    }

    #[test]
    fn test_dispatch_to_callbacks() {
        let mut recorder = Recorder::default();
        dispatch(&mut recorder, &parse("BTN_PRESSED {3}"));
        dispatch(&mut recorder, &parse("ERROR bad state"));
        dispatch(&mut recorder, &parse("SENT {ignored by recorder}"));
        dispatch(&mut recorder, &parse("nonsense"));

        assert_eq!(recorder.calls, vec!["button:3", "error:ERROR bad state"]);
    }

    #[test]
    fn test_channel_listener_forwards_events() {
        let (mut tx, mut rx) = mpsc::unbounded_channel::<Event>();
        dispatch(&mut tx, &parse("RECORDED {1010}"));
        dispatch(&mut tx, &parse("nonsense"));

        assert_eq!(
            rx.try_recv().ok(),
            Some(Event::RecordedCode {
                payload: "{1010}".to_string()
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
