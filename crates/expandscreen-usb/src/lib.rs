//! expandscreen-usb — byte streams to a handheld over an ADB forward.
//!
//! ```text
//! host                                   handheld
//! ────                                   ────────
//! TcpStream ──► 127.0.0.1:<local> ──adb forward──► tcp:<remote> listener
//! ```
//!
//! Connect sequence: verify the device is attached and authorized, tear
//! down any stale forward, install the forward, then open a loopback TCP
//! stream with NoDelay and 256 KiB socket buffers. A supervisor task
//! reacts to link death with up to `max_reconnect_attempts` bounded
//! retries, surfacing status strings along the way.

pub mod adb;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use expandscreen_core::Shutdown;
use expandscreen_manager::{ConnectionFactory, DeviceConnection};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

pub use adb::{parse_devices_output, AdbDevice, AdbOutput, AdbRunner, ProcessAdbRunner};

const SOCKET_BUF_SIZE: u32 = 256 * 1024;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UsbConfig {
    pub adb_path: String,
    /// Device-side port the forward targets.
    pub remote_port: u16,
    pub command_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_owned(),
            remote_port: 15555,
            command_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(2000),
        }
    }
}

// ── UsbConnection ─────────────────────────────────────────────────────────────

/// One device's USB link. Produced by [`UsbConnectionFactory`]; the session
/// layer takes the established stream with [`UsbConnection::take_stream`].
pub struct UsbConnection {
    config: UsbConfig,
    runner: Arc<dyn AdbRunner>,
    device_id: String,
    local_port: u16,
    stream: Mutex<Option<TcpStream>>,
    status: watch::Sender<String>,
}

impl UsbConnection {
    pub fn new(
        config: UsbConfig,
        runner: Arc<dyn AdbRunner>,
        device_id: String,
        local_port: u16,
    ) -> Self {
        let (status, _) = watch::channel("Disconnected".to_owned());
        Self { config, runner, device_id, local_port, stream: Mutex::new(None), status }
    }

    /// Status strings: `Connected`, `Reconnecting (N/M)`, `Reconnected`,
    /// `Reconnection failed`.
    pub fn subscribe_status(&self) -> watch::Receiver<String> {
        self.status.subscribe()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    fn set_status(&self, status: impl Into<String>) {
        let _ = self.status.send(status.into());
    }

    async fn adb(&self, args: &[String]) -> Result<AdbOutput> {
        self.runner.run(&self.config.adb_path, args, self.config.command_timeout).await
    }

    /// Run the full connect sequence and return the loopback stream.
    pub async fn establish(&self) -> Result<TcpStream> {
        // 1. The device must be attached and authorized.
        let listing = self
            .adb(&["devices".to_owned(), "-l".to_owned()])
            .await
            .context("listing adb devices")?;
        if !listing.success {
            bail!("adb devices failed: {}", listing.stderr.trim());
        }
        let devices = parse_devices_output(&listing.stdout);
        let device = devices.iter().find(|d| d.serial == self.device_id);
        match device {
            None => bail!("device {} is not attached", self.device_id),
            Some(d) if !d.is_authorized() => {
                bail!("device {} is {}, not authorized", self.device_id, d.state)
            }
            Some(d) => {
                debug!("device {} present (model {:?})", d.serial, d.model);
            }
        }

        // 2. Tear down any stale forward; ignore failures.
        let _ = self
            .adb(&[
                "-s".to_owned(),
                self.device_id.clone(),
                "forward".to_owned(),
                "--remove".to_owned(),
                format!("tcp:{}", self.local_port),
            ])
            .await;

        // 3. Install the forward. This one is fatal on failure.
        let forward = self
            .adb(&[
                "-s".to_owned(),
                self.device_id.clone(),
                "forward".to_owned(),
                format!("tcp:{}", self.local_port),
                format!("tcp:{}", self.config.remote_port),
            ])
            .await
            .context("installing adb forward")?;
        if !forward.success {
            bail!("adb forward failed: {}", forward.stderr.trim());
        }

        // 4. Loopback TCP with low-latency options.
        let socket = TcpSocket::new_v4().context("creating socket")?;
        socket.set_send_buffer_size(SOCKET_BUF_SIZE).context("send buffer")?;
        socket.set_recv_buffer_size(SOCKET_BUF_SIZE).context("recv buffer")?;
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.local_port));
        let stream = socket
            .connect(addr)
            .await
            .with_context(|| format!("connecting to forwarded port {}", self.local_port))?;
        stream.set_nodelay(true).context("TCP_NODELAY")?;

        info!("USB link up for {} via 127.0.0.1:{}", self.device_id, self.local_port);
        self.set_status("Connected");
        Ok(stream)
    }

    /// The established stream, exactly once per successful connect.
    pub async fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().await.take()
    }

    /// Bounded retry ladder after link death. Returns the fresh stream or
    /// an error once the attempt budget is exhausted.
    pub async fn reconnect(&self) -> Result<TcpStream> {
        let max = self.config.max_reconnect_attempts;
        for attempt in 1..=max {
            self.set_status(format!("Reconnecting ({attempt}/{max})"));
            tokio::time::sleep(self.config.reconnect_delay).await;
            match self.establish().await {
                Ok(stream) => {
                    self.set_status("Reconnected");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("reconnect attempt {attempt}/{max} for {} failed: {e:#}", self.device_id);
                }
            }
        }
        self.set_status("Reconnection failed");
        bail!("device {} did not come back after {} attempts", self.device_id, max)
    }

    /// Spawn the link supervisor. Each `link_down` signal triggers the
    /// bounded reconnect ladder; fresh streams are handed to `reconnected`.
    /// The task ends on shutdown, when the signal source closes, or when a
    /// reconnect ladder is exhausted.
    pub fn spawn_supervisor(
        self: &Arc<Self>,
        mut link_down: mpsc::Receiver<()>,
        reconnected: mpsc::Sender<TcpStream>,
        mut shutdown: Shutdown,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    signal = link_down.recv() => {
                        if signal.is_none() {
                            return;
                        }
                    }
                }
                match this.reconnect().await {
                    Ok(stream) => {
                        if reconnected.send(stream).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("supervisor giving up on {}: {e:#}", this.device_id);
                        return;
                    }
                }
            }
        });
    }

    async fn teardown(&self) {
        self.stream.lock().await.take();
        let _ = self
            .adb(&[
                "-s".to_owned(),
                self.device_id.clone(),
                "forward".to_owned(),
                "--remove".to_owned(),
                format!("tcp:{}", self.local_port),
            ])
            .await;
        self.set_status("Disconnected");
    }
}

#[async_trait]
impl DeviceConnection for UsbConnection {
    async fn connect(&self, device_id: &str) -> Result<()> {
        debug_assert_eq!(device_id, self.device_id);
        let stream = self.establish().await?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    fn remote_port(&self) -> u16 {
        self.config.remote_port
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

pub struct UsbConnectionFactory {
    config: UsbConfig,
    runner: Arc<dyn AdbRunner>,
}

impl UsbConnectionFactory {
    pub fn new(config: UsbConfig, runner: Arc<dyn AdbRunner>) -> Self {
        Self { config, runner }
    }

    /// List attached, authorized devices.
    pub async fn authorized_devices(&self) -> Result<Vec<AdbDevice>> {
        let listing = self
            .runner
            .run(
                &self.config.adb_path,
                &["devices".to_owned(), "-l".to_owned()],
                self.config.command_timeout,
            )
            .await?;
        if !listing.success {
            bail!("adb devices failed: {}", listing.stderr.trim());
        }
        Ok(parse_devices_output(&listing.stdout).into_iter().filter(AdbDevice::is_authorized).collect())
    }
}

impl ConnectionFactory for UsbConnectionFactory {
    fn open(&self, device_id: &str, local_port: u16) -> Result<Box<dyn DeviceConnection>> {
        Ok(Box::new(UsbConnection::new(
            self.config.clone(),
            Arc::clone(&self.runner),
            device_id.to_owned(),
            local_port,
        )))
    }
}
