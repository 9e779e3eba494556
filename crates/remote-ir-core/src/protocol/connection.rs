//! Device session management
//!
//! Owns the conversation with the IR module: the bound transport, the
//! connection state and the single protocol listener.
//!
//! Three execution contexts meet here:
//! - the transport, which calls [`DeviceSession::on_chunk_received`] and
//!   [`DeviceSession::on_transport_event`] from its own thread;
//! - a line reader thread per bound transport, blocking on the [`ByteChannel`];
//! - the dispatch loop, a Tokio task that alone owns the listener slot and
//!   applies connection transitions, so listener callbacks never overlap.
//!
//! While a transport is bound, signals and listener changes are queued as
//! marks in its byte channel and travel through the line reader, so the
//! dispatch loop sees them after every line received before them. At most
//! [`SessionConfig::dispatch_capacity`] lines wait for the dispatch loop;
//! beyond that the reader stops draining the channel and
//! [`DeviceSession::on_chunk_received`] blocks.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use super::{
    commands::{Command, DeviceState},
    lines::{Frame, LineAssembler, DEFAULT_DELIMITER, DEFAULT_MAX_LINE_LEN},
    listener::{dispatch, CommandListener},
    observer::{ConnectionObservable, ConnectionSubscription, DEFAULT_OBSERVER_BUFFER},
    response::{parse, Event},
    stream::{ByteChannel, DEFAULT_CHANNEL_CAPACITY},
    ProtocolError,
};

/// Default number of parsed lines allowed to wait for the dispatch loop
pub const DEFAULT_DISPATCH_CAPACITY: usize = 64;

/// Write side of the link to the IR module
pub trait Transport: Send + Sync {
    /// Write one encoded command
    fn write(&self, bytes: &[u8]) -> io::Result<()>;
}

/// Connection signal raised by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportSignal {
    /// Access to the device was granted; the link is usable
    PermissionGranted,
    /// The user or OS refused access to the device
    PermissionNotGranted,
    /// No device is attached
    NoDevice,
    /// The device went away
    Disconnected,
    /// The attached device is not a supported module
    NotSupported,
}

impl TransportSignal {
    /// Whether this signal leaves the device connected
    pub fn is_granted(&self) -> bool {
        matches!(self, TransportSignal::PermissionGranted)
    }
}

impl fmt::Display for TransportSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportSignal::PermissionGranted => "USB ready",
            TransportSignal::PermissionNotGranted => "USB permission not granted",
            TransportSignal::NoDevice => "No USB connected",
            TransportSignal::Disconnected => "USB disconnected",
            TransportSignal::NotSupported => "USB device not supported",
        };
        f.write_str(text)
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No usable device
    Disconnected,
    /// Device present and permission granted
    Connected,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes buffered between the transport and the line reader
    pub channel_capacity: usize,
    /// Longest response line accepted, in bytes
    pub max_line_len: usize,
    /// Byte terminating each response line
    pub delimiter: u8,
    /// Connection notifications kept for slow observers
    pub observer_buffer: usize,
    /// Lines allowed to wait for the dispatch loop before the reader stalls
    pub dispatch_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            delimiter: DEFAULT_DELIMITER,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
        }
    }
}

enum SessionMessage {
    /// A response line; the permit is released once it has been dispatched
    Line(String, OwnedSemaphorePermit),
    Signal(TransportSignal),
    SetListener(Option<Box<dyn CommandListener>>),
    HasListener(oneshot::Sender<bool>),
}

type PendingMessages = Arc<Mutex<VecDeque<SessionMessage>>>;

fn lock_pending(
    pending: &Mutex<VecDeque<SessionMessage>>,
) -> MutexGuard<'_, VecDeque<SessionMessage>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the dispatch loop
struct SessionState {
    connected: AtomicBool,
    observable: ConnectionObservable,
}

/// A bound transport plus the channel and reader feeding its responses
struct Link {
    transport: Arc<dyn Transport>,
    channel: Arc<ByteChannel>,
    /// Messages waiting for their mark to come out of `channel`
    pending: PendingMessages,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Queue `message` behind every byte pushed so far. Hands it back if the
    /// channel is already closed.
    fn post(&self, message: SessionMessage) -> Result<(), SessionMessage> {
        let mut pending = lock_pending(&self.pending);
        if !self.channel.mark() {
            return Err(message);
        }
        pending.push_back(message);
        Ok(())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.channel.close();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("Line reader thread panicked");
            }
        }
    }
}

struct Inner {
    config: SessionConfig,
    state: Arc<SessionState>,
    link: Mutex<Option<Link>>,
    write_lock: Mutex<()>,
    tx: mpsc::UnboundedSender<SessionMessage>,
    /// Bounds the lines in flight between the readers and the dispatch loop
    in_flight: Arc<Semaphore>,
    runtime: Handle,
}

impl Inner {
    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `message` to the dispatch loop behind everything already received.
    ///
    /// `link` is the held link slot, which keeps posts from different threads
    /// in one order.
    fn post(&self, link: &Option<Link>, message: SessionMessage) {
        let message = match link {
            Some(link) => match link.post(message) {
                Ok(()) => return,
                Err(message) => message,
            },
            None => message,
        };
        if self.tx.send(message).is_err() {
            error!("Dispatch loop has stopped, message dropped");
        }
    }
}

/// Handle to the single logical session with the IR module
///
/// Cloning is cheap; every clone talks to the same session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl DeviceSession {
    /// Create a disconnected session with no listener and start its
    /// dispatch loop on the current Tokio runtime.
    ///
    /// Fails with [`ProtocolError::NoRuntime`] outside of a runtime; use
    /// [`with_runtime`](Self::with_runtime) from plain threads.
    pub fn new(config: SessionConfig) -> Result<Self, ProtocolError> {
        let runtime = Handle::try_current().map_err(|_| ProtocolError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a session whose dispatch loop runs on `runtime`
    pub fn with_runtime(config: SessionConfig, runtime: Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(SessionState {
            connected: AtomicBool::new(false),
            observable: ConnectionObservable::new(config.observer_buffer),
        });
        let in_flight = Arc::new(Semaphore::new(config.dispatch_capacity.max(1)));

        runtime.spawn(run_dispatch(rx, state.clone()));

        Self {
            inner: Arc::new(Inner {
                config,
                state,
                link: Mutex::new(None),
                write_lock: Mutex::new(()),
                tx,
                in_flight,
                runtime,
            }),
        }
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Attach a transport, replacing any previous one.
    ///
    /// Each binding gets a fresh byte channel and line reader. The previous
    /// channel is closed and its reader finishes forwarding what it already
    /// holds before the new transport takes over.
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) -> Result<(), ProtocolError> {
        let config = &self.inner.config;
        let channel = Arc::new(ByteChannel::new(config.channel_capacity));
        let pending = PendingMessages::default();
        let reader = spawn_line_reader(
            channel.clone(),
            pending.clone(),
            self.inner.tx.clone(),
            self.inner.in_flight.clone(),
            self.inner.runtime.clone(),
            LineAssembler::new(config.delimiter, config.max_line_len),
        )?;

        let mut slot = self.inner.link();
        // Joins the old reader; posts wait on the slot until it is done
        slot.take();
        *slot = Some(Link {
            transport,
            channel,
            pending,
            reader: Some(reader),
        });

        info!("Transport bound");
        Ok(())
    }

    /// Detach the current transport, if any
    pub fn unbind_transport(&self) {
        let mut slot = self.inner.link();
        if slot.take().is_some() {
            info!("Transport unbound");
        }
    }

    /// Whether a transport is currently bound
    pub fn has_transport(&self) -> bool {
        self.inner.link().is_some()
    }

    /// Feed bytes received from the transport.
    ///
    /// Blocks while the byte channel is full, so call it from the
    /// transport's thread. Bytes arriving with no transport bound are
    /// dropped.
    pub fn on_chunk_received(&self, bytes: &[u8]) {
        let channel = self.inner.link().as_ref().map(|link| link.channel.clone());
        match channel {
            Some(channel) => {
                channel.push(bytes);
            }
            None => debug!(len = bytes.len(), "No transport bound, dropping chunk"),
        }
    }

    /// Report a transport connection signal.
    ///
    /// [`is_connected`](Self::is_connected) reflects the signal as soon as
    /// this returns. Anything but [`TransportSignal::PermissionGranted`]
    /// clears the listener once every line received before the signal has
    /// been dispatched. Observers are notified every time, even when the
    /// state did not change.
    pub fn on_transport_event(&self, signal: TransportSignal) {
        let link = self.inner.link();
        self.inner
            .state
            .connected
            .store(signal.is_granted(), Ordering::SeqCst);
        self.inner.post(&link, SessionMessage::Signal(signal));
    }

    /// Whether the device is connected and ready
    pub fn is_connected(&self) -> bool {
        self.inner.state.connected.load(Ordering::SeqCst)
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Make `listener` the only receiver of protocol events.
    ///
    /// Lines received before this call still go to the previous listener.
    pub fn register_listener<L>(&self, listener: L)
    where
        L: CommandListener + 'static,
    {
        self.post(SessionMessage::SetListener(Some(Box::new(listener))));
    }

    /// Remove the current listener
    pub fn clear_listener(&self) {
        self.post(SessionMessage::SetListener(None));
    }

    /// Whether a listener is registered, as seen by the dispatch loop after
    /// every message queued before this call
    pub async fn has_listener(&self) -> Result<bool, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.post(SessionMessage::HasListener(reply));
        rx.await.map_err(|_| ProtocolError::SessionClosed)
    }

    /// Connection state broadcast
    pub fn observable(&self) -> &ConnectionObservable {
        &self.inner.state.observable
    }

    /// Follow connection transitions
    pub fn subscribe(&self) -> ConnectionSubscription {
        self.inner.state.observable.subscribe()
    }

    /// Switch the module to `target`
    pub fn send_set_state(&self, target: DeviceState) -> Result<(), ProtocolError> {
        self.send(&Command::SetState(target))
    }

    /// Probe the module
    pub fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&Command::Ping)
    }

    /// Transmit a recorded IR code, e.g. `{codeLen:32,codeType:3,codeValue:16689239}`
    pub fn send_ir(&self, payload: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Command::SendIr(payload.into()))
    }

    /// Encode and write `command`.
    ///
    /// Without a bound transport nothing is written or queued and
    /// [`ProtocolError::NotConnected`] is returned.
    pub fn send(&self, command: &Command) -> Result<(), ProtocolError> {
        let transport = self
            .inner
            .link()
            .as_ref()
            .map(|link| link.transport.clone());

        let Some(transport) = transport else {
            warn!(command = command.name(), "No transport bound, command dropped");
            return Err(ProtocolError::NotConnected);
        };

        let bytes = command.encode();
        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        transport.write(&bytes).map_err(|e| {
            error!(command = command.name(), "Write to module failed: {e}");
            ProtocolError::from(e)
        })?;

        debug!(data = %String::from_utf8_lossy(&bytes), "Serial to module");
        Ok(())
    }

    fn post(&self, message: SessionMessage) {
        let link = self.inner.link();
        self.inner.post(&link, message);
    }
}

fn spawn_line_reader(
    channel: Arc<ByteChannel>,
    pending: PendingMessages,
    tx: mpsc::UnboundedSender<SessionMessage>,
    in_flight: Arc<Semaphore>,
    runtime: Handle,
    mut lines: LineAssembler,
) -> Result<JoinHandle<()>, ProtocolError> {
    let handle = thread::Builder::new()
        .name("remote-ir-lines".to_string())
        .spawn(move || {
            while let Some(frame) = lines.read_frame(&channel) {
                let message = match frame {
                    Frame::Line(line) => {
                        // Waits while the dispatch loop is behind
                        let Ok(permit) = runtime.block_on(in_flight.clone().acquire_owned())
                        else {
                            break;
                        };
                        SessionMessage::Line(line, permit)
                    }
                    Frame::Mark => match lock_pending(&pending).pop_front() {
                        Some(message) => message,
                        None => continue,
                    },
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            debug!("Line reader exiting");
        })?;
    Ok(handle)
}

async fn run_dispatch(
    mut rx: mpsc::UnboundedReceiver<SessionMessage>,
    state: Arc<SessionState>,
) {
    let mut listener: Option<Box<dyn CommandListener>> = None;

    while let Some(message) = rx.recv().await {
        match message {
            SessionMessage::Line(line, _permit) => {
                debug!(line = %line, "Serial from module");
                let event = parse(&line);
                match listener.as_deref_mut() {
                    Some(listener) => dispatch(listener, &event),
                    None if matches!(event, Event::Unrecognized { .. }) => {
                        warn!(line = %line, "Received unknown response from module");
                    }
                    None => debug!(kind = event.kind(), "No command listener, response dropped"),
                }
            }
            SessionMessage::Signal(signal) => {
                let connected = signal.is_granted();
                info!(%signal, connected, "Transport signal");

                if !connected && listener.take().is_some() {
                    debug!("Command listener cleared on disconnect");
                }
                state.observable.notify(connected);
            }
            SessionMessage::SetListener(new_listener) => {
                debug!(
                    registered = new_listener.is_some(),
                    "Command listener replaced"
                );
                listener = new_listener;
            }
            SessionMessage::HasListener(reply) => {
                let _ = reply.send(listener.is_some());
            }
        }
    }

    debug!("Dispatch loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        written: Mutex<Vec<Vec<u8>>>,
        fail_on_write: AtomicBool,
    }

    impl Transport for MockTransport {
        fn write(&self, bytes: &[u8]) -> io::Result<()> {
            if self.fail_on_write.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            self.written.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.max_line_len, 512);
        assert_eq!(config.delimiter, b'\n');
        assert_eq!(config.observer_buffer, 16);
        assert_eq!(config.dispatch_capacity, 64);
    }

    #[test]
    fn test_session_config_from_partial_json() {
        let config: SessionConfig = serde_json::from_str(r#"{"channel_capacity": 64}"#).unwrap();
        assert_eq!(
            config,
            SessionConfig {
                channel_capacity: 64,
                ..SessionConfig::default()
            }
        );
    }

    #[test]
    fn test_only_permission_granted_connects() {
        assert!(TransportSignal::PermissionGranted.is_granted());
        for signal in [
            TransportSignal::PermissionNotGranted,
            TransportSignal::NoDevice,
            TransportSignal::Disconnected,
            TransportSignal::NotSupported,
        ] {
            assert!(!signal.is_granted());
        }
        assert_eq!(TransportSignal::Disconnected.to_string(), "USB disconnected");
    }

    #[tokio::test]
    async fn test_send_without_transport() {
        let session = DeviceSession::new(SessionConfig::default()).unwrap();
        assert!(!session.has_transport());
        assert!(matches!(session.ping(), Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn test_commands_are_written_in_order() {
        let session = DeviceSession::new(SessionConfig::default()).unwrap();
        let transport = Arc::new(MockTransport::default());
        session.bind_transport(transport.clone()).unwrap();

        session.send_set_state(DeviceState::Record).unwrap();
        session.ping().unwrap();
        session.send_ir("{codeLen:32,codeType:3,codeValue:16689239}").unwrap();

        let written = transport.written.lock().unwrap().clone();
        assert_eq!(
            written,
            vec![
                b"SET_STATE {STATE:REC_STATE}".to_vec(),
                b"PING {}".to_vec(),
                b"SEND_IR {codeLen:32,codeType:3,codeValue:16689239}".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let session = DeviceSession::new(SessionConfig::default()).unwrap();
        let transport = Arc::new(MockTransport::default());
        transport.fail_on_write.store(true, Ordering::SeqCst);
        session.bind_transport(transport).unwrap();

        assert!(matches!(session.ping(), Err(ProtocolError::IoError(_))));
    }

    #[tokio::test]
    async fn test_unbind_drops_transport() {
        let session = DeviceSession::new(SessionConfig::default()).unwrap();
        session
            .bind_transport(Arc::new(MockTransport::default()))
            .unwrap();
        assert!(session.has_transport());

        session.unbind_transport();
        assert!(!session.has_transport());
        assert!(matches!(
            session.send_set_state(DeviceState::Idle),
            Err(ProtocolError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_initial_state() {
        let session = DeviceSession::new(SessionConfig::default()).unwrap();
        assert!(!session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(!session.has_listener().await.unwrap());
    }

    #[test]
    fn test_new_outside_runtime() {
        assert!(matches!(
            DeviceSession::new(SessionConfig::default()),
            Err(ProtocolError::NoRuntime)
        ));
    }

    #[test]
    fn test_with_runtime_from_plain_thread() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let session =
            DeviceSession::with_runtime(SessionConfig::default(), runtime.handle().clone());
        session
            .bind_transport(Arc::new(MockTransport::default()))
            .unwrap();

        session.register_listener(mpsc::unbounded_channel::<Event>().0);
        session.on_transport_event(TransportSignal::PermissionGranted);
        assert!(session.is_connected());
        assert!(runtime.block_on(session.has_listener()).unwrap());
    }

    #[tokio::test]
    async fn test_signal_updates_state_immediately() {
        let session = DeviceSession::new(SessionConfig::default()).unwrap();
        session.on_transport_event(TransportSignal::PermissionGranted);
        assert!(session.is_connected());
        assert_eq!(session.connection_state(), ConnectionState::Connected);

        session.on_transport_event(TransportSignal::NoDevice);
        assert!(!session.is_connected());
    }

    /// Listener that waits for a go-ahead before handling each button press
    struct GatedListener {
        release: std_mpsc::Receiver<()>,
        handled: Arc<AtomicUsize>,
    }

    impl CommandListener for GatedListener {
        fn button_pressed(&mut self, _button_id: u8) {
            let _ = self.release.recv();
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_listener_blocks_producer() {
        const LINES: usize = 20;

        let session = DeviceSession::new(SessionConfig {
            channel_capacity: 16,
            dispatch_capacity: 1,
            ..SessionConfig::default()
        })
        .unwrap();
        session
            .bind_transport(Arc::new(MockTransport::default()))
            .unwrap();

        let (release, gate) = std_mpsc::channel();
        let handled = Arc::new(AtomicUsize::new(0));
        session.register_listener(GatedListener {
            release: gate,
            handled: handled.clone(),
        });

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let session = session.clone();
            let done = done.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..LINES {
                    session.on_chunk_received(b"BTN_PRESSED {1}\n");
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(handled.load(Ordering::SeqCst), 0);

        for _ in 0..LINES {
            release.send(()).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handled.load(Ordering::SeqCst) < LINES {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}
