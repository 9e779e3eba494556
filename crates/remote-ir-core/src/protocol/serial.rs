//! Serial port handling
//!
//! Host-side transport for the IR module's USB serial bridge: port discovery,
//! port setup, and a reader thread that feeds received bytes into a
//! [`DeviceSession`].

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{
    DeviceSession, ProtocolError, Transport, TransportSignal, DEFAULT_BAUD_RATE,
    DEFAULT_READ_TIMEOUT_MS,
};

/// Size of each read from the port
const READ_CHUNK_SIZE: usize = 64;

/// Information about an available serial port
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => Self {
                name: info.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
                serial_number: usb_info.serial_number,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout in milliseconds; also bounds how long closing the link waits
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
        }
    }
}

impl SerialConfig {
    /// Default settings for `port_name`
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }
}

/// Sort key placing ttyACM* first, then ttyUSB*, then everything else,
/// with numeric suffix order inside each group
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortInfo::from(info);
                map.entry(p.name.clone()).or_insert(p);
            }
        }
        Err(e) => warn!("Serial port enumeration failed: {e}"),
    }

    // USB CDC bridges sometimes exist in /dev before udev reports them
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port with a short read timeout
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, ProtocolError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    let port = serialport::new(name, baud)
        .timeout(Duration::from_millis(DEFAULT_READ_TIMEOUT_MS))
        .open()?;
    Ok(port)
}

/// Configure a serial port for the IR module: 8N1, no flow control
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(serialport::DataBits::Eight)?;
    port.set_parity(serialport::Parity::None)?;
    port.set_stop_bits(serialport::StopBits::One)?;
    port.set_flow_control(serialport::FlowControl::None)?;

    // Arduino-style bridges reset when DTR drops
    if let Err(e) = port.write_data_terminal_ready(true) {
        debug!("Failed to set DTR high: {e} (continuing)");
    }
    if let Err(e) = port.write_request_to_send(true) {
        debug!("Failed to set RTS high: {e} (continuing)");
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}

/// Map a failed open to the transport signal the session should see
fn failure_signal(error: &ProtocolError) -> TransportSignal {
    match error {
        ProtocolError::PortNotFound(_) => TransportSignal::NoDevice,
        ProtocolError::PermissionDenied(_) => TransportSignal::PermissionNotGranted,
        _ => TransportSignal::NotSupported,
    }
}

/// Write half of an open serial port
pub struct SerialTransport {
    port: Mutex<Box<dyn SerialPort>>,
}

impl Transport for SerialTransport {
    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        port.write_all(bytes)
    }
}

impl SerialTransport {
    /// Open `config.port_name`, bind it to `session` and start reading.
    ///
    /// On success the session receives [`TransportSignal::PermissionGranted`];
    /// on failure it receives the matching disconnect signal and the error is
    /// returned.
    pub fn connect(
        session: &DeviceSession,
        config: &SerialConfig,
    ) -> Result<SerialLink, ProtocolError> {
        match Self::open_and_bind(session, config) {
            Ok(link) => {
                info!(port = %config.port_name, baud = config.baud_rate, "Serial link up");
                session.on_transport_event(TransportSignal::PermissionGranted);
                Ok(link)
            }
            Err(e) => {
                error!(port = %config.port_name, "Serial link failed: {e}");
                session.on_transport_event(failure_signal(&e));
                Err(e)
            }
        }
    }

    fn open_and_bind(
        session: &DeviceSession,
        config: &SerialConfig,
    ) -> Result<SerialLink, ProtocolError> {
        let mut port = open_port(&config.port_name, Some(config.baud_rate))?;
        configure_port(port.as_mut())?;
        port.set_timeout(Duration::from_millis(config.read_timeout_ms))?;
        clear_buffers(port.as_mut())?;

        let reader_port = port.try_clone()?;
        session.bind_transport(Arc::new(SerialTransport {
            port: Mutex::new(port),
        }))?;

        let stop = Arc::new(AtomicBool::new(false));
        let reader = match spawn_port_reader(reader_port, session.clone(), stop.clone()) {
            Ok(reader) => reader,
            Err(e) => {
                session.unbind_transport();
                return Err(e);
            }
        };

        Ok(SerialLink {
            session: session.clone(),
            port_name: config.port_name.clone(),
            stop,
            reader: Some(reader),
        })
    }
}

fn spawn_port_reader(
    mut port: Box<dyn SerialPort>,
    session: DeviceSession,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, ProtocolError> {
    let handle = thread::Builder::new()
        .name("remote-ir-serial".to_string())
        .spawn(move || {
            let mut buf = [0u8; READ_CHUNK_SIZE];
            while !stop.load(Ordering::SeqCst) {
                match port.read(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => session.on_chunk_received(&buf[..n]),
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue
                    }
                    Err(e) => {
                        error!("Serial read failed: {e}");
                        if !stop.swap(true, Ordering::SeqCst) {
                            session.unbind_transport();
                            session.on_transport_event(TransportSignal::Disconnected);
                        }
                        break;
                    }
                }
            }
            debug!("Serial reader exiting");
        })?;
    Ok(handle)
}

/// An open serial link; dropping it closes the port and disconnects the
/// session
pub struct SerialLink {
    session: DeviceSession,
    port_name: String,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Name of the open port
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Whether the reader is still running
    pub fn is_active(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    /// Close the link
    pub fn close(self) {}
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        let already_stopped = self.stop.swap(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("Serial reader thread panicked");
            }
        }
        if !already_stopped {
            self.session.unbind_transport();
            self.session
                .on_transport_event(TransportSignal::Disconnected);
            info!(port = %self.port_name, "Serial link closed");
        }
    }
}
