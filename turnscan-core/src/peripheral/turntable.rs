use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    Peripheral, PeripheralInitParams, PeripheralKind, PeripheralLifecycle, PeripheralStatus,
    TurntablePeripheral,
};
use crate::config::PeripheralConfig;
use crate::error::{PipelineError, Result};
use crate::progress::ProgressMonitor;

/// Reply to `VERSION` identifying compatible turntable firmware.
pub const FIRMWARE_VERSION: &str = "ARTIVACT_TT_V2";

const SERIAL_DEVICE_PREFIXES: [&str; 2] = ["ttyACM", "ttyUSB"];
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented link to the turntable controller.
pub trait LineLink: Send {
    fn send_line(&mut self, line: &str) -> io::Result<()>;

    fn read_line(&mut self) -> io::Result<String>;
}

/// Opens a link to the controller on a serial device path.
pub type LinkConnector = Arc<dyn Fn(&Path) -> io::Result<Box<dyn LineLink>> + Send + Sync>;

/// Serial port opened as a device file.
///
/// The port is expected to be configured for raw mode (for example with
/// `stty -F /dev/ttyACM0 raw 115200`); USB CDC boards ignore the baud rate.
struct SerialDevice {
    reader: BufReader<File>,
    writer: File,
}

impl SerialDevice {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let writer = file.try_clone()?;
        Ok(Self {
            reader: BufReader::new(file),
            writer,
        })
    }
}

impl LineLink for SerialDevice {
    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "turntable closed the connection",
            ));
        }
        Ok(line.trim().to_string())
    }
}

/// Sends `command` and returns the controller's reply line.
fn exchange(link: &mut dyn LineLink, command: &str) -> io::Result<String> {
    link.send_line(command)?;
    link.read_line()
}

fn is_turntable(link: &mut dyn LineLink) -> io::Result<bool> {
    Ok(exchange(link, "VERSION")? == FIRMWARE_VERSION)
}

/// Turntable built around an Arduino running the turntable firmware.
///
/// The controller answers `VERSION` with [`FIRMWARE_VERSION`] and `MOVE <n>`
/// with `OK` once it turned by `1/n` of a revolution.
pub struct ArduinoTurntable {
    connector: LinkConnector,
    lifecycle: PeripheralLifecycle,
    link: Mutex<Option<Box<dyn LineLink>>>,
    response_timeout: Duration,
}

impl ArduinoTurntable {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(|path: &Path| {
            SerialDevice::open(path).map(|device| Box::new(device) as Box<dyn LineLink>)
        }))
    }

    pub fn with_connector(connector: LinkConnector) -> Self {
        Self {
            connector,
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ArduinoTurntable),
            link: Mutex::new(None),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Opens `port` and checks the firmware answers. Blocking.
    fn probe(connector: &LinkConnector, port: &Path) -> io::Result<Option<Box<dyn LineLink>>> {
        let mut link = connector(port)?;
        if is_turntable(link.as_mut())? {
            Ok(Some(link))
        } else {
            Ok(None)
        }
    }

    async fn connect(
        &self,
        candidates: Vec<PathBuf>,
    ) -> Result<Option<(PathBuf, Box<dyn LineLink>)>> {
        for port in candidates {
            let connector = Arc::clone(&self.connector);
            let probe_port = port.clone();
            let probe = spawn_blocking(move || Self::probe(&connector, &probe_port));
            match timeout(self.response_timeout, probe).await {
                Ok(Ok(Ok(Some(link)))) => return Ok(Some((port, link))),
                Ok(Ok(Ok(None))) => debug!(port = %port.display(), "not a turntable"),
                Ok(Ok(Err(err))) => {
                    debug!(port = %port.display(), error = %err, "port probe failed")
                }
                Ok(Err(join)) => return Err(PipelineError::Internal(join.to_string())),
                Err(_) => warn!(port = %port.display(), "port did not answer in time"),
            }
        }
        Ok(None)
    }
}

impl Default for ArduinoTurntable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArduinoTurntable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let connected = self.link.try_lock().map(|link| link.is_some()).ok();
        f.debug_struct("ArduinoTurntable")
            .field("state", &self.lifecycle.state())
            .field("connected", &connected)
            .finish()
    }
}

fn candidate_ports(config: &PeripheralConfig) -> Vec<PathBuf> {
    if let Some(port) = config.settings.get("port").filter(|p| !p.trim().is_empty()) {
        return vec![PathBuf::from(port.trim())];
    }

    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    let mut ports: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            SERIAL_DEVICE_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
        .map(|entry| entry.path())
        .collect();
    ports.sort();
    ports
}

#[async_trait]
impl Peripheral for ArduinoTurntable {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ArduinoTurntable
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        params: PeripheralInitParams,
    ) -> Result<()> {
        let mut link = self.link.lock().await;
        if self.lifecycle.begin() && link.take().is_some() {
            info!("closed turntable port left open by a previous run");
        }

        match self.connect(candidate_ports(&params.config)).await {
            Ok(Some((port, connected))) => {
                info!(port = %port.display(), "turntable connected");
                *link = Some(connected);
                Ok(())
            }
            Ok(None) => {
                warn!("no turntable detected, rotations will be skipped");
                Ok(())
            }
            Err(err) => {
                self.lifecycle.abort();
                Err(err)
            }
        }
    }

    async fn status(&self, config: &PeripheralConfig) -> PeripheralStatus {
        if self.lifecycle.is_initialized() {
            return PeripheralStatus::Available;
        }
        match self.connect(candidate_ports(config)).await {
            Ok(Some(_)) => PeripheralStatus::Available,
            _ => PeripheralStatus::Disconnected,
        }
    }

    async fn scan(&self) -> Vec<PeripheralConfig> {
        if self.lifecycle.is_initialized() {
            return Vec::new();
        }
        let probe = PeripheralConfig::fallback(self.kind());
        match self.connect(candidate_ports(&probe)).await {
            Ok(Some((port, _))) => vec![probe.with_setting("port", port.to_string_lossy())],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl TurntablePeripheral for ArduinoTurntable {
    async fn rotate(&self, divisions: u32) -> Result<()> {
        let mut guard = self.link.lock().await;
        let Some(mut link) = guard.take() else {
            warn!("turntable not connected, skipping rotation");
            return Ok(());
        };

        let command = format!("MOVE {}", divisions.max(1));
        let exchange_task = spawn_blocking(move || {
            let reply = exchange(link.as_mut(), &command);
            (link, reply)
        });

        let (link, reply) = timeout(self.response_timeout, exchange_task)
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: "turntable rotation".to_string(),
                detail: format!("no reply within {:?}", self.response_timeout),
            })?
            .map_err(|err| PipelineError::Internal(err.to_string()))?;
        *guard = Some(link);

        match reply {
            Ok(reply) if reply == "OK" => Ok(()),
            Ok(reply) => Err(PipelineError::peripheral(
                self.kind(),
                format!("unexpected reply to move command: '{reply}'"),
            )),
            Err(err) => Err(PipelineError::io("turntable move command failed", err)),
        }
    }

    async fn teardown(&self) -> Result<()> {
        self.link.lock().await.take();
        self.lifecycle.end();
        Ok(())
    }
}

/// Turntable without hardware. The operator turns the item by hand during
/// the inter-shot delay.
#[derive(Debug)]
pub struct ManualTurntable {
    lifecycle: PeripheralLifecycle,
}

impl ManualTurntable {
    pub fn new() -> Self {
        Self {
            lifecycle: PeripheralLifecycle::new(PeripheralKind::ManualTurntable),
        }
    }
}

impl Default for ManualTurntable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Peripheral for ManualTurntable {
    fn kind(&self) -> PeripheralKind {
        PeripheralKind::ManualTurntable
    }

    async fn initialize(
        &self,
        _monitor: Arc<ProgressMonitor>,
        _params: PeripheralInitParams,
    ) -> Result<()> {
        self.lifecycle.begin();
        Ok(())
    }

    async fn status(&self, _config: &PeripheralConfig) -> PeripheralStatus {
        PeripheralStatus::Available
    }
}

#[async_trait]
impl TurntablePeripheral for ManualTurntable {
    async fn rotate(&self, divisions: u32) -> Result<()> {
        info!(divisions, "turn the item manually");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.lifecycle.end();
        Ok(())
    }
}
