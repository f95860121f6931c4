// ── SshSession – connection lifecycle and SFTP operations ────────────────────

use crate::ssh::types::SshConfig;
use bundlepull_core::error::{TransferError, TransferErrorKind, TransferResult};
use bundlepull_core::progress::ProgressTracker;
use bundlepull_core::types::{
    is_safe_relative, join_remote, FileFailure, FileOutcome, RemoteFileStat, RemoteListing,
};
use log::{debug, info, warn};
use ssh2::{ErrorCode, Session, Sftp};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Buffer size for sequential SFTP downloads. One read never spans more than
/// one SFTP protocol packet, so larger buffers buy nothing here.
const DOWNLOAD_BUF: usize = 32 * 1024;

// ── Error mapping ────────────────────────────────────────────────────────────

// SFTP status codes 2 and 10 are NO_SUCH_FILE and NO_SUCH_PATH.
fn is_no_such_file(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(2) | ErrorCode::SFTP(10))
}

/// Session-level ssh2 errors mean the connection itself is gone; SFTP status
/// errors are per-operation.
fn map_ssh_err(err: ssh2::Error, context: &str) -> TransferError {
    match err.code() {
        ErrorCode::Session(_) => {
            TransferError::transport_lost(format!("{}: {}", context, err))
        }
        _ => TransferError::io_error(format!("{}: {}", context, err)),
    }
}

fn stat_to_remote(stat: &ssh2::FileStat) -> RemoteFileStat {
    if stat.is_dir() {
        RemoteFileStat::directory()
    } else {
        RemoteFileStat::file(stat.size.unwrap_or(0))
    }
}

// ── Download planning ────────────────────────────────────────────────────────

/// One file of a walked tree, resolved to its fetch endpoints.
struct FetchJob {
    remote: String,
    rel: String,
    local: PathBuf,
}

/// Resolve a walked listing into the local directory skeleton (parents
/// first), the per-file fetch jobs, and the listing entries rejected as
/// unsafe. Entries whose stat marks them untransferable produce no job.
fn tree_layout(
    listing: &RemoteListing,
    stats: &HashMap<String, RemoteFileStat>,
    root: &str,
    local_dir: &Path,
) -> (Vec<PathBuf>, Vec<FetchJob>, Vec<FileFailure>) {
    let mut dirs: Vec<&String> = listing
        .dirs
        .iter()
        .filter(|dir| is_safe_relative(dir))
        .collect();
    dirs.sort_by_key(|dir| dir.len());
    let dirs = dirs.into_iter().map(|dir| local_dir.join(dir)).collect();

    let mut jobs = Vec::new();
    let mut rejected = Vec::new();
    for rel in &listing.files {
        if !is_safe_relative(rel) {
            warn!("Skipping unsafe relative path '{}'", rel);
            rejected.push(FileFailure {
                path: rel.clone(),
                kind: TransferErrorKind::IoError,
                message: "Unsafe relative path in listing".to_string(),
            });
            continue;
        }
        let remote = join_remote(root, rel);
        if let Some(stat) = stats.get(&remote) {
            if !stat.is_transferable() {
                continue;
            }
        }
        jobs.push(FetchJob {
            remote,
            rel: rel.clone(),
            local: local_dir.join(rel),
        });
    }
    (dirs, jobs, rejected)
}

/// Stream `reader` into `writer` in [`DOWNLOAD_BUF`]-sized reads, reporting
/// each written buffer to the tracker. Returns bytes moved plus whether the
/// stream ended short of `expected_size`; the remote can shrink a file while
/// a transfer runs, so a short stream is an outcome, not an error.
fn copy_stream(
    remote_path: &str,
    local_path: &Path,
    reader: &mut impl Read,
    writer: &mut impl Write,
    expected_size: u64,
    progress: Option<&ProgressTracker>,
) -> TransferResult<(u64, bool)> {
    let mut transferred: u64 = 0;
    let mut buf = vec![0u8; DOWNLOAD_BUF];
    loop {
        let n = reader.read(&mut buf).map_err(|e| {
            TransferError::io_error(format!("Read error in '{}': {}", remote_path, e))
        })?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(|e| {
            TransferError::io_error(format!(
                "Write error for '{}': {}",
                local_path.display(),
                e
            ))
        })?;
        transferred += n as u64;
        if let Some(tracker) = progress {
            tracker.advance(n as u64);
        }
    }
    Ok((transferred, transferred < expected_size))
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One SSH connection plus at most one SFTP sub-channel, created on first use
/// and reused for the session's lifetime. Only the creation is lock-guarded;
/// the channel itself is shared by concurrent workers afterwards.
pub struct SshSession {
    session: Session,
    #[allow(dead_code)] // held to keep the TCP connection alive
    tcp: TcpStream,
    sftp: Mutex<Option<Arc<Sftp>>>,
    config: SshConfig,
    auth_method: String,
}

impl SshSession {
    // ── Connect ──────────────────────────────────────────────────────────────

    pub fn connect(config: SshConfig) -> TransferResult<Self> {
        let addr = config.addr();
        info!("SSH connecting to {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| {
                TransferError::connection_failed(format!("Cannot resolve '{}': {}", addr, e))
            })?
            .next()
            .ok_or_else(|| {
                TransferError::connection_failed(format!("'{}' resolved to no addresses", addr))
            })?;

        let tcp = TcpStream::connect_timeout(
            &socket_addr,
            Duration::from_secs(config.timeout_secs),
        )
        .map_err(|e| {
            TransferError::connection_failed(format!("TCP connection to {} failed: {}", addr, e))
        })?;

        tcp.set_nonblocking(false).map_err(|e| {
            TransferError::connection_failed(format!("Failed to set blocking mode: {}", e))
        })?;

        let mut session = Session::new().map_err(|e| {
            TransferError::connection_failed(format!("Failed to create SSH session: {}", e))
        })?;

        session.set_tcp_stream(
            tcp.try_clone()
                .map_err(|e| TransferError::connection_failed(e.to_string()))?,
        );
        session
            .handshake()
            .map_err(|e| TransferError::connection_failed(format!("SSH handshake failed: {}", e)))?;

        let auth_method = Self::authenticate(&mut session, &config)?;
        if !session.authenticated() {
            return Err(TransferError::auth_failed(
                "Not authenticated after auth attempt",
            ));
        }
        info!("SSH authenticated to {} via {}", addr, auth_method);

        let keepalive = config.keepalive_interval_secs;
        session.set_keepalive(keepalive > 0, keepalive as u32);

        Ok(Self {
            session,
            tcp,
            sftp: Mutex::new(None),
            config,
            auth_method,
        })
    }

    // ── Authentication helpers ───────────────────────────────────────────────

    fn authenticate(session: &mut Session, config: &SshConfig) -> TransferResult<String> {
        // 1. Agent-based auth
        if config.use_agent {
            if let Ok(mut agent) = session.agent() {
                if agent.connect().is_ok() {
                    let _ = agent.list_identities();
                    let identities = agent.identities().unwrap_or_default();
                    for identity in identities {
                        if agent.userauth(&config.username, &identity).is_ok() {
                            return Ok("agent".to_string());
                        }
                    }
                }
            }
        }

        // 2. Private-key file
        if let Some(ref key_path) = config.private_key_path {
            let passphrase = config.private_key_passphrase.as_deref();
            session
                .userauth_pubkey_file(&config.username, None, Path::new(key_path), passphrase)
                .map_err(|e| {
                    TransferError::auth_failed(format!("Public-key auth failed: {}", e))
                })?;
            if session.authenticated() {
                return Ok("publickey".to_string());
            }
        }

        // 3. Default key paths (~/.ssh/id_ed25519, id_rsa, …)
        if config.password.is_none() {
            if let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) {
                for name in &["id_ed25519", "id_rsa", "id_ecdsa"] {
                    let path = ssh_dir.join(name);
                    if path.exists() {
                        let passphrase = config.private_key_passphrase.as_deref();
                        if session
                            .userauth_pubkey_file(&config.username, None, &path, passphrase)
                            .is_ok()
                            && session.authenticated()
                        {
                            return Ok(format!("publickey-default({})", name));
                        }
                    }
                }
            }
        }

        // 4. Password / keyboard-interactive
        if let Some(ref password) = config.password {
            if session
                .userauth_password(&config.username, password)
                .is_ok()
                && session.authenticated()
            {
                return Ok("password".to_string());
            }

            struct SimpleKbdHandler {
                password: String,
            }

            impl ssh2::KeyboardInteractivePrompt for SimpleKbdHandler {
                fn prompt(
                    &mut self,
                    _username: &str,
                    _instructions: &str,
                    prompts: &[ssh2::Prompt],
                ) -> Vec<String> {
                    prompts.iter().map(|_| self.password.clone()).collect()
                }
            }

            let mut handler = SimpleKbdHandler {
                password: password.clone(),
            };
            if session
                .userauth_keyboard_interactive(&config.username, &mut handler)
                .is_ok()
                && session.authenticated()
            {
                return Ok("keyboard-interactive".to_string());
            }
        }

        Err(TransferError::auth_failed(
            "No authentication method succeeded",
        ))
    }

    pub fn auth_method(&self) -> &str {
        &self.auth_method
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// The SFTP sub-channel, opened on first use and shared afterwards.
    fn sftp(&self) -> TransferResult<Arc<Sftp>> {
        let mut guard = self
            .sftp
            .lock()
            .map_err(|_| TransferError::io_error("SFTP channel lock poisoned"))?;
        if let Some(sftp) = guard.as_ref() {
            return Ok(sftp.clone());
        }
        let sftp = self
            .session
            .sftp()
            .map_err(|e| map_ssh_err(e, "SFTP channel error"))?;
        let sftp = Arc::new(sftp);
        *guard = Some(sftp.clone());
        Ok(sftp)
    }

    /// Clone of the underlying ssh2 session, for tunnel channel opens.
    pub(crate) fn raw_session(&self) -> Session {
        self.session.clone()
    }

    // ── Remote filesystem ────────────────────────────────────────────────────

    /// Stat one remote path. A missing path reports `exists == false` rather
    /// than an error, so callers can branch on typed results.
    pub fn stat(&self, path: &str) -> TransferResult<RemoteFileStat> {
        let sftp = self.sftp()?;
        match sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(stat_to_remote(&stat)),
            Err(err) if is_no_such_file(&err) => Ok(RemoteFileStat::missing()),
            Err(err) => Err(map_ssh_err(err, &format!("stat failed for '{}'", path))),
        }
    }

    /// Walk the tree under `root` breadth-first. Directories are recorded
    /// before their contents; unreadable directories are skipped rather than
    /// failing the whole walk. Returns the listing plus the stat of every
    /// file seen, keyed by absolute path.
    pub fn walk(
        &self,
        root: &str,
    ) -> TransferResult<(RemoteListing, HashMap<String, RemoteFileStat>)> {
        let sftp = self.sftp()?;
        let mut listing = RemoteListing::default();
        let mut stats = HashMap::new();
        let mut pending: VecDeque<String> = VecDeque::from([String::new()]);

        while let Some(rel_dir) = pending.pop_front() {
            let abs_dir = if rel_dir.is_empty() {
                root.to_string()
            } else {
                join_remote(root, &rel_dir)
            };
            let entries = match sftp.readdir(Path::new(&abs_dir)) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!("Skipping unreadable directory '{}': {}", abs_dir, err);
                    continue;
                }
            };
            for (entry_path, stat) in entries {
                let name = match entry_path.file_name() {
                    Some(name) => name.to_string_lossy().to_string(),
                    None => continue,
                };
                if name == "." || name == ".." {
                    continue;
                }
                let rel = if rel_dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", rel_dir, name)
                };
                if stat.is_dir() {
                    listing.dirs.push(rel.clone());
                    pending.push_back(rel);
                } else {
                    stats.insert(join_remote(root, &rel), stat_to_remote(&stat));
                    listing.files.push(rel);
                }
            }
        }
        Ok((listing, stats))
    }

    /// Read up to `size` bytes at `offset`. SFTP reads cap at one protocol
    /// packet, so the buffer is filled in a loop — a short return from here
    /// genuinely means end of file.
    pub fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>> {
        let sftp = self.sftp()?;
        let mut file = match sftp.open(Path::new(path)) {
            Ok(file) => file,
            Err(err) if is_no_such_file(&err) => {
                return Err(TransferError::not_found(path));
            }
            Err(err) => {
                return Err(map_ssh_err(err, &format!("Failed to open '{}'", path)));
            }
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| TransferError::io_error(format!("Seek in '{}' failed: {}", path, e)))?;

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| TransferError::io_error(format!("Read error in '{}': {}", path, e)))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Delete a remote file, for best-effort cleanup of temporaries.
    pub fn remove(&self, path: &str) -> TransferResult<()> {
        let sftp = self.sftp()?;
        sftp.unlink(Path::new(path))
            .map_err(|e| map_ssh_err(e, &format!("unlink '{}' failed", path)))
    }

    // ── Downloads ────────────────────────────────────────────────────────────

    /// Stream one remote file to `local_path` through the shared SFTP channel,
    /// reporting each written buffer to the tracker. A remote file that ends
    /// before its stat'd size is tolerated and flagged as truncated.
    ///
    /// This is the sequential native surface for callers driving a pull over
    /// SSH directly; the chunked pipeline reaches the same channel through
    /// [`read_chunk`](Self::read_chunk) instead.
    pub fn download_file(
        &self,
        remote_path: &str,
        local_path: &Path,
        progress: Option<&ProgressTracker>,
    ) -> TransferResult<FileOutcome> {
        let stat = self.stat(remote_path)?;
        if !stat.exists {
            return Err(TransferError::not_found(remote_path));
        }
        if stat.is_directory {
            return Err(TransferError::is_directory(remote_path));
        }

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransferError::io_error(format!(
                    "Failed to create '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let sftp = self.sftp()?;
        let mut remote = sftp.open(Path::new(remote_path)).map_err(|e| {
            map_ssh_err(e, &format!("Failed to open remote '{}'", remote_path))
        })?;
        let mut local = std::fs::File::create(local_path).map_err(|e| {
            TransferError::io_error(format!(
                "Failed to create local '{}': {}",
                local_path.display(),
                e
            ))
        })?;

        let (transferred, truncated) = copy_stream(
            remote_path,
            local_path,
            &mut remote,
            &mut local,
            stat.size,
            progress,
        )?;
        if truncated {
            warn!(
                "Remote file '{}' ended early: {} of {} bytes",
                remote_path, transferred, stat.size
            );
        }
        Ok(FileOutcome {
            bytes_written: transferred,
            truncated,
            checksum: None,
        })
    }

    /// Walk `root` and download every file sequentially into `local_dir`,
    /// creating directories parent-first. Per-file failures are collected and
    /// returned; they never abort the remaining files.
    pub fn download_tree(
        &self,
        root: &str,
        local_dir: &Path,
        progress: Option<&ProgressTracker>,
    ) -> TransferResult<Vec<FileFailure>> {
        let (listing, stats) = self.walk(root)?;
        let (dirs, jobs, mut failures) = tree_layout(&listing, &stats, root, local_dir);

        std::fs::create_dir_all(local_dir).map_err(|e| {
            TransferError::io_error(format!(
                "Failed to create '{}': {}",
                local_dir.display(),
                e
            ))
        })?;
        for dir in &dirs {
            std::fs::create_dir_all(dir).map_err(|e| {
                TransferError::io_error(format!("Failed to create '{}': {}", dir.display(), e))
            })?;
        }

        for job in jobs {
            if let Err(err) = self.download_file(&job.remote, &job.local, progress) {
                warn!("Failed to download '{}': {}", job.remote, err);
                failures.push(FileFailure::from_error(job.rel, &err));
            }
        }
        Ok(failures)
    }

    // ── Disconnect ───────────────────────────────────────────────────────────

    /// Graceful disconnect. Dropping the session closes the connection and
    /// the SFTP sub-channel either way.
    pub fn disconnect(&self) {
        let _ = self
            .session
            .disconnect(None, "Client disconnecting", None);
        info!("SSH session to {} closed", self.config.addr());
    }
}
