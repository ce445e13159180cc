//! Serial connection management
//!
//! Opens the slider board's port, runs the read loop that feeds the
//! [`LineDecoder`], and fans decoded events out to subscribers. On config
//! reload the slider state is reset and, if the port or baud rate changed,
//! the connection is re-established.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use super::{LineDecoder, SerialError, SliderMoveEvent};
use crate::config::{CanonicalConfig, ConfigHandle, ConnectionInfo};

/// Pause between closing and reopening the port on reconnect
const RECONNECT_DELAY: Duration = Duration::from_millis(50);

/// Longest line the read loop buffers; anything longer is dropped whole
pub const MAX_LINE_LENGTH: usize = 256;

/// Ordered list of slider-move listeners
///
/// Each listener gets a capacity-1 channel; publishing awaits every listener
/// in registration order, so a slow listener holds back the read loop.
#[derive(Clone, Default)]
pub struct SliderMoveConsumers {
    senders: Arc<Mutex<Vec<mpsc::Sender<SliderMoveEvent>>>>,
}

impl SliderMoveConsumers {
    pub fn subscribe(&self) -> mpsc::Receiver<SliderMoveEvent> {
        let (tx, rx) = mpsc::channel(1);
        self.senders.lock().push(tx);
        rx
    }

    pub async fn publish(&self, events: &[SliderMoveEvent]) {
        if events.is_empty() {
            return;
        }

        let senders: Vec<_> = self.senders.lock().clone();
        let mut closed = false;
        for event in events {
            for tx in &senders {
                if tx.send(*event).await.is_err() {
                    closed = true;
                }
            }
        }

        if closed {
            self.senders.lock().retain(|tx| !tx.is_closed());
        }
    }
}

struct ActiveConnection {
    info: ConnectionInfo,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The slider board's serial link
pub struct SerialConnection {
    config: ConfigHandle,
    decoder: Arc<Mutex<LineDecoder>>,
    consumers: SliderMoveConsumers,
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
}

impl SerialConnection {
    pub fn new(config: ConfigHandle) -> Self {
        debug!("Created serial connection instance");
        Self {
            config,
            decoder: Arc::new(Mutex::new(LineDecoder::new())),
            consumers: SliderMoveConsumers::default(),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a listener for decoded slider moves
    pub fn subscribe_slider_moves(&self) -> mpsc::Receiver<SliderMoveEvent> {
        self.consumers.subscribe()
    }

    /// Open the configured port and start the read loop
    pub async fn start(&self) -> Result<(), SerialError> {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|conn| !conn.task.is_finished()) {
            warn!("Connection already active, cannot start a new one");
            return Err(SerialError::AlreadyActive);
        }

        let info = self.config.current().connection.clone();
        debug!(
            "Opening serial connection on {} @ {} baud",
            info.com_port, info.baud_rate
        );

        let stream = open_port(&info)?;
        info!("🔌 Connected to {} @ {} baud", info.com_port, info.baud_rate);

        let (stop_tx, stop_rx) = watch::channel(false);
        let decoder = Arc::clone(&self.decoder);
        let config = self.config.clone();
        let consumers = self.consumers.clone();
        let port = info.com_port.clone();

        let task = tokio::spawn(async move {
            let reader = BufReader::new(stream);
            match read_loop(reader, &decoder, &config, &consumers, stop_rx).await {
                Ok(()) => debug!("Serial read loop for {} stopped", port),
                Err(e) => warn!("Serial connection on {} lost: {}", port, e),
            }
        });

        *active = Some(ActiveConnection {
            info,
            stop: stop_tx,
            task,
        });
        Ok(())
    }

    /// Close the port if open
    pub async fn stop(&self) {
        let Some(conn) = self.active.lock().await.take() else {
            debug!("No active connection to stop");
            return;
        };

        debug!("Closing serial connection on {}", conn.info.com_port);
        let _ = conn.stop.send(true);
        if let Err(e) = conn.task.await {
            warn!("Serial read loop ended abnormally: {}", e);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| !conn.task.is_finished())
    }

    /// Reset slider state and reconnect if the connection settings changed
    pub async fn on_config_reload(&self, config: &CanonicalConfig) {
        self.decoder.lock().reset();

        let needs_reconnect = self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| conn.info != config.connection);

        if !needs_reconnect {
            return;
        }

        info!("Detected change in connection parameters, attempting to renew connection");
        self.stop().await;
        tokio::time::sleep(RECONNECT_DELAY).await;

        match self.start().await {
            Ok(()) => debug!("Renewed connection successfully"),
            Err(e) => warn!("Failed to renew connection after parameter change: {}", e),
        }
    }

    /// Follow config reloads until shutdown
    pub fn spawn_reload_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut reloads = self.config.subscribe_to_changes();
        let connection = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    reload = reloads.recv() => match reload {
                        Some(config) => connection.on_config_reload(&config).await,
                        None => break,
                    },
                }
            }
            debug!("Serial config listener stopped");
        })
    }
}

/// Read lines until stopped, the device closes the stream, or a read fails
///
/// A line longer than [`MAX_LINE_LENGTH`] is skipped up to and including its
/// newline; none of its bytes reach the decoder.
pub async fn read_loop<R>(
    mut reader: R,
    decoder: &Mutex<LineDecoder>,
    config: &ConfigHandle,
    consumers: &SliderMoveConsumers,
    mut stop: watch::Receiver<bool>,
) -> Result<(), SerialError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(64);
    let mut discarding = false;

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LENGTH as u64);

        tokio::select! {
            biased;
            _ = stop.changed() => return Ok(()),
            read = limited.read_until(b'\n', &mut buf) => {
                if read? == 0 {
                    return Err(SerialError::Closed);
                }

                let complete = buf.last() == Some(&b'\n');
                if discarding || !complete {
                    if !discarding {
                        debug!("Dropping line longer than {} bytes", MAX_LINE_LENGTH);
                    }
                    discarding = !complete;
                } else {
                    let line = String::from_utf8_lossy(&buf);
                    let events = decoder.lock().process_line(&line, &config.current());
                    consumers.publish(&events).await;
                }
            }
        }
    }
}

fn open_port(info: &ConnectionInfo) -> Result<SerialStream, SerialError> {
    tokio_serial::new(info.com_port.as_str(), info.baud_rate)
        .data_bits(DataBits::Eight)
        .stop_bits(StopBits::One)
        .parity(Parity::None)
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| classify_open_error(&info.com_port, e))
}

fn classify_open_error(port: &str, e: tokio_serial::Error) -> SerialError {
    use std::io::ErrorKind as IoKind;
    use tokio_serial::ErrorKind;

    let port = port.to_string();
    let description = e.description.to_lowercase();

    match e.kind {
        ErrorKind::NoDevice | ErrorKind::Io(IoKind::NotFound) => SerialError::NotFound { port },
        ErrorKind::Io(IoKind::PermissionDenied) => SerialError::Busy { port },
        _ if description.contains("busy") || description.contains("access is denied") => {
            SerialError::Busy { port }
        }
        _ if description.contains("no such file") || description.contains("cannot find") => {
            SerialError::NotFound { port }
        }
        _ => SerialError::Open { port, source: e },
    }
}

/// Names of serial ports visible on this machine, with a short description
pub fn available_ports() -> Result<Vec<(String, String)>, SerialError> {
    let ports = tokio_serial::available_ports().map_err(SerialError::Enumerate)?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                tokio_serial::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                tokio_serial::SerialPortType::PciPort => "PCI".to_string(),
                tokio_serial::SerialPortType::Unknown => "Unknown".to_string(),
            };
            (port.port_name, description.trim().to_string())
        })
        .collect())
}
