// ── SshTunnel – local TCP listener forwarded over SSH ────────────────────────

use crate::ssh::service::SshSession;
use bundlepull_core::error::{TransferError, TransferResult};
use log::{debug, error, info};
use ssh2::Session;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// How long the accept loop and each forwarding session wait before
/// re-checking the stop flag.
const STOP_POLL: Duration = Duration::from_secs(1);
const PUMP_SLEEP_MS: u64 = 5;

/// Local TCP listener whose connections are each forwarded over their own
/// direct-tcpip channel to a fixed remote endpoint. Accepted sockets are
/// never shared or pooled: one socket, one channel, one forwarding session.
///
/// The tunnel takes ownership of its session. ssh2 blocking mode is
/// session-global and the channel pumps need it off, so sharing the
/// connection with concurrent SFTP traffic is not supported.
pub struct SshTunnel {
    local_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    stop: Arc<AtomicBool>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SshTunnel {
    /// Bind an ephemeral local port and start forwarding. The port actually
    /// bound is reported by [`local_port`](Self::local_port).
    pub async fn open(
        session: SshSession,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> TransferResult<Self> {
        Self::open_on(session, 0, remote_host, remote_port).await
    }

    /// Bind a specific local port (`0` for ephemeral) and start forwarding.
    pub async fn open_on(
        session: SshSession,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> TransferResult<Self> {
        let remote_host = remote_host.into();

        let listener = std::net::TcpListener::bind(("127.0.0.1", local_port)).map_err(|e| {
            TransferError::connection_failed(format!("Failed to bind local port: {}", e))
        })?;
        listener.set_nonblocking(true).map_err(|e| {
            TransferError::connection_failed(format!("Failed to set non-blocking: {}", e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransferError::connection_failed(e.to_string()))?;
        let listener = tokio::net::TcpListener::from_std(listener).map_err(|e| {
            TransferError::connection_failed(format!("Failed to convert listener: {}", e))
        })?;

        info!(
            "Tunnel listening on {} -> {}:{}",
            local_addr, remote_host, remote_port
        );

        let stop = Arc::new(AtomicBool::new(false));
        let ssh = session.raw_session();
        let accept_stop = stop.clone();
        let host = remote_host.clone();

        let task = tokio::spawn(async move {
            // owns the connection for the tunnel's lifetime
            let _session = session;
            loop {
                if accept_stop.load(Ordering::SeqCst) {
                    break;
                }
                match tokio::time::timeout(STOP_POLL, listener.accept()).await {
                    Err(_) => continue, // timed out; re-check the stop flag
                    Ok(Ok((stream, peer))) => {
                        debug!("Tunnel accepted connection from {}", peer);
                        let ssh = ssh.clone();
                        let host = host.clone();
                        let conn_stop = accept_stop.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(
                                stream, peer, ssh, &host, remote_port, conn_stop,
                            )
                            .await
                            {
                                error!("Tunnel connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Ok(Err(e)) => {
                        error!("Tunnel accept failed: {}", e);
                    }
                }
            }
            info!("Tunnel on {} stopped", local_addr);
        });

        Ok(Self {
            local_addr,
            remote_host,
            remote_port,
            stop,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn remote_endpoint(&self) -> (&str, u16) {
        (&self.remote_host, self.remote_port)
    }

    /// Signal the accept loop and forwarding sessions, then wait for the
    /// accept loop to exit. Idempotent; forwarding sessions observe the flag
    /// within one polling interval.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let task = self
            .accept_task
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.accept_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

// ── Per-connection forwarding ────────────────────────────────────────────────

/// Write-side queue for the channel pump. The SSH window can fill while the
/// local side keeps sending; bytes wait here so a blocked write never drops
/// its tail, and a dropped sender is remembered as local EOF.
#[derive(Default)]
struct PendingWrites {
    buf: Vec<u8>,
    local_eof: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum DrainOutcome {
    /// Everything queued reached the channel.
    Flushed,
    /// The channel cannot take more right now; the tail stays queued.
    Blocked,
    /// The channel is gone; the pump should shut down.
    Closed,
}

impl PendingWrites {
    fn refill(&mut self, rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
        loop {
            match rx.try_recv() {
                Ok(data) => self.buf.extend_from_slice(&data),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.local_eof = true;
                    break;
                }
            }
        }
    }

    fn drain_into(&mut self, writer: &mut impl Write) -> DrainOutcome {
        while !self.buf.is_empty() {
            match writer.write(&self.buf) {
                Ok(0) => return DrainOutcome::Closed,
                Ok(n) => {
                    self.buf.drain(..n);
                    let _ = writer.flush();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return DrainOutcome::Blocked,
                Err(e) if e.kind() == ErrorKind::TimedOut => return DrainOutcome::Blocked,
                Err(e) => {
                    debug!("SSH channel write error: {}", e);
                    return DrainOutcome::Closed;
                }
            }
        }
        DrainOutcome::Flushed
    }

    /// Local side finished and every queued byte reached the channel.
    fn drained(&self) -> bool {
        self.local_eof && self.buf.is_empty()
    }
}

async fn forward_connection(
    local_stream: tokio::net::TcpStream,
    peer: SocketAddr,
    session: Session,
    remote_host: &str,
    remote_port: u16,
    stop: Arc<AtomicBool>,
) -> TransferResult<()> {
    let peer_ip = peer.ip().to_string();
    let peer_port = peer.port();

    let mut channel = tokio::task::spawn_blocking({
        let session = session.clone();
        let remote_host = remote_host.to_string();
        move || {
            // channel open needs blocking mode; the pump needs it off
            session.set_blocking(true);
            let channel = session
                .channel_direct_tcpip(&remote_host, remote_port, Some((&peer_ip, peer_port)))
                .map_err(|e| {
                    TransferError::connection_failed(format!("Failed to open channel: {}", e))
                });
            session.set_blocking(false);
            channel
        }
    })
    .await
    .map_err(|e| TransferError::io_error(format!("Blocking task failed: {}", e)))??;

    let (mut local_read, mut local_write) = local_stream.into_split();

    let (tx_to_remote, mut rx_to_remote) = mpsc::unbounded_channel::<Vec<u8>>();
    let (tx_to_local, mut rx_to_local) = mpsc::unbounded_channel::<Vec<u8>>();

    let pump_stop = stop.clone();
    let ssh_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 32768];
        let mut pending = PendingWrites::default();

        loop {
            if pump_stop.load(Ordering::SeqCst) {
                break;
            }

            pending.refill(&mut rx_to_remote);
            if pending.drain_into(&mut channel) == DrainOutcome::Closed {
                break;
            }
            if pending.drained() {
                break;
            }

            match channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx_to_local.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(_) => break,
            }

            if channel.eof() {
                break;
            }

            std::thread::sleep(Duration::from_millis(PUMP_SLEEP_MS));
        }

        let _ = channel.close();
        let _ = channel.wait_close();
    });

    let local_to_remote = tokio::spawn(async move {
        let mut buf = [0u8; 32768];
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx_to_remote.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let remote_to_local = tokio::spawn(async move {
        while let Some(data) = rx_to_local.recv().await {
            if local_write.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    let stopped = async {
        while !stop.load(Ordering::SeqCst) {
            tokio::time::sleep(STOP_POLL).await;
        }
    };

    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
        _ = stopped => {}
    }

    let _ = tokio::task::spawn_blocking(move || {
        let _ = ssh_thread.join();
    })
    .await;

    Ok(())
}
