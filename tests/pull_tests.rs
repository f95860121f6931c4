use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bundlepull::{
    AgentRpc, DeviceControl, DumpResult, FallbackController, ProcessInfo, ProgressSink,
    ProgressSnapshot, RemoteFileStat, RemoteListing, RpcTransport, SshFallback, Transport,
    TransferConfig, TransferError, TransferErrorKind, TransferResult, TransportState,
};
use bundlepull_core::checksum::sha256_hex;

// ── Shared in-memory remote ──────────────────────────────────────────────────

/// One remote filesystem model served by both the mock agent and the mock
/// SFTP transport, so fallback runs see identical content on either path.
struct MockRemote {
    root: String,
    /// Relative directory paths, parents before children.
    dirs: Vec<String>,
    /// Relative file path -> content.
    files: BTreeMap<String, Vec<u8>>,
    /// Absolute paths outside the tree (the dumped artifact lives here).
    extra: BTreeMap<String, Vec<u8>>,
    /// Absolute path -> size to report from stat instead of the real length.
    stat_overrides: BTreeMap<String, u64>,
    removed: Mutex<Vec<String>>,
}

impl MockRemote {
    fn content(&self, path: &str) -> Option<&Vec<u8>> {
        if let Some(rel) = path.strip_prefix(&format!("{}/", self.root)) {
            return self.files.get(rel);
        }
        self.extra.get(path)
    }

    fn is_dir(&self, path: &str) -> bool {
        if path == self.root {
            return true;
        }
        path.strip_prefix(&format!("{}/", self.root))
            .map(|rel| self.dirs.iter().any(|dir| dir == rel))
            .unwrap_or(false)
    }

    fn stat_of(&self, path: &str) -> RemoteFileStat {
        if self.is_dir(path) {
            return RemoteFileStat::directory();
        }
        match self.content(path) {
            Some(data) => {
                let size = self
                    .stat_overrides
                    .get(path)
                    .copied()
                    .unwrap_or(data.len() as u64);
                RemoteFileStat::file(size)
            }
            None => RemoteFileStat::missing(),
        }
    }

    fn listing(&self, root: &str) -> TransferResult<RemoteListing> {
        if root != self.root {
            return Err(TransferError::not_found(root));
        }
        Ok(RemoteListing {
            dirs: self.dirs.clone(),
            files: self.files.keys().cloned().collect(),
        })
    }

    fn read(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>> {
        match self.content(path) {
            Some(data) => {
                let start = (offset as usize).min(data.len());
                let end = (start + size).min(data.len());
                Ok(data[start..end].to_vec())
            }
            None => Err(TransferError::not_found(path)),
        }
    }

    fn remove(&self, path: &str) -> bool {
        let known = self.content(path).is_some();
        if known {
            self.removed.lock().unwrap().push(path.to_string());
        }
        known
    }
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// App-bundle-shaped fixture: 1240 tree bytes across five files (one of
/// them empty) plus a 300-byte dumped artifact outside the tree.
fn demo_remote() -> Arc<MockRemote> {
    let mut files = BTreeMap::new();
    files.insert("Demo".to_string(), pattern(0x11, 512));
    files.insert("Info.plist".to_string(), b"<plist/>".to_vec());
    files.insert(
        "Frameworks/Shared.framework/Shared".to_string(),
        pattern(0x22, 600),
    );
    files.insert(
        "_CodeSignature/CodeResources".to_string(),
        pattern(0x33, 120),
    );
    files.insert("empty.dylib".to_string(), Vec::new());

    let mut extra = BTreeMap::new();
    extra.insert("/tmp/dump.bin".to_string(), pattern(0x44, 300));

    Arc::new(MockRemote {
        root: "/var/containers/Bundle/Application/7F2A/Demo.app".to_string(),
        dirs: vec![
            "Frameworks".to_string(),
            "Frameworks/Shared.framework".to_string(),
            "_CodeSignature".to_string(),
        ],
        files,
        extra,
        stat_overrides: BTreeMap::new(),
        removed: Mutex::new(Vec::new()),
    })
}

const DEMO_TREE_BYTES: u64 = 512 + 8 + 600 + 120;
const DEMO_ARTIFACT_BYTES: u64 = 300;

fn small_remote() -> Arc<MockRemote> {
    let mut files = BTreeMap::new();
    files.insert("a/f1".to_string(), pattern(1, 100));
    files.insert("a/b/f2".to_string(), pattern(2, 50));
    Arc::new(MockRemote {
        root: "/var/data".to_string(),
        dirs: vec!["a".to_string(), "a/b".to_string()],
        files,
        extra: BTreeMap::new(),
        stat_overrides: BTreeMap::new(),
        removed: Mutex::new(Vec::new()),
    })
}

// ── Mock collaborators ───────────────────────────────────────────────────────

/// Agent over a [`MockRemote`] with targeted failure injection.
struct MockAgent {
    remote: Arc<MockRemote>,
    /// First N `list_files` calls fail with transport loss.
    lost_lists: AtomicUsize,
    /// First N `read_chunk` calls fail with transport loss.
    lost_reads: AtomicUsize,
    /// When set, every `batch_stat` call fails with this message.
    batch_error: Option<String>,
    /// Absolute path whose reads fail with a local-style error.
    broken_read: Option<String>,
    list_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    stat_calls: AtomicUsize,
}

impl MockAgent {
    fn over(remote: Arc<MockRemote>) -> Self {
        Self {
            remote,
            lost_lists: AtomicUsize::new(0),
            lost_reads: AtomicUsize::new(0),
            batch_error: None,
            broken_read: None,
            list_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            stat_calls: AtomicUsize::new(0),
        }
    }

    fn losing_lists(self, n: usize) -> Self {
        self.lost_lists.store(n, Ordering::SeqCst);
        self
    }

    fn losing_reads(self, n: usize) -> Self {
        self.lost_reads.store(n, Ordering::SeqCst);
        self
    }

    fn with_broken_batch(mut self, message: &str) -> Self {
        self.batch_error = Some(message.to_string());
        self
    }

    fn with_broken_read(mut self, path: &str) -> Self {
        self.broken_read = Some(path.to_string());
        self
    }
}

fn consume(counter: &AtomicUsize) -> bool {
    loop {
        let current = counter.load(Ordering::SeqCst);
        if current == 0 {
            return false;
        }
        if counter
            .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return true;
        }
    }
}

#[async_trait]
impl AgentRpc for MockAgent {
    async fn stat(&self, path: &str) -> TransferResult<RemoteFileStat> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.remote.stat_of(path))
    }

    async fn batch_stat(
        &self,
        paths: &[String],
    ) -> TransferResult<HashMap<String, RemoteFileStat>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(ref message) = self.batch_error {
            return Err(TransferError::io_error(message.clone()));
        }
        Ok(paths
            .iter()
            .map(|path| (path.clone(), self.remote.stat_of(path)))
            .collect())
    }

    async fn list_files(&self, root: &str) -> TransferResult<RemoteListing> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if consume(&self.lost_lists) {
            return Err(TransferError::transport_lost("script is destroyed"));
        }
        self.remote.listing(root)
    }

    async fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>> {
        if consume(&self.lost_reads) {
            return Err(TransferError::transport_lost("connection is closed"));
        }
        if self.broken_read.as_deref() == Some(path) {
            return Err(TransferError::io_error("injected read failure").with_path(path));
        }
        self.remote.read(path, offset, size)
    }

    async fn remove_path(&self, path: &str) -> TransferResult<bool> {
        Ok(self.remote.remove(path))
    }

    async fn dump_decrypted_executable(&self, out_path: &str) -> TransferResult<DumpResult> {
        if !self.remote.extra.contains_key(out_path) {
            return Err(TransferError::io_error(format!(
                "No artifact staged at '{}'",
                out_path
            )));
        }
        Ok(DumpResult {
            out_path: out_path.to_string(),
            bundle_path: self.remote.root.clone(),
            executable_name: "Demo".to_string(),
        })
    }
}

struct MockDevice {
    processes: Vec<ProcessInfo>,
    attached: AtomicU32,
    log: Mutex<Vec<String>>,
}

impl MockDevice {
    fn with(processes: Vec<ProcessInfo>, attached: u32) -> Self {
        Self {
            processes,
            attached: AtomicU32::new(attached),
            log: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceControl for MockDevice {
    async fn list_processes(&self) -> TransferResult<Vec<ProcessInfo>> {
        self.log.lock().unwrap().push("list".to_string());
        Ok(self.processes.clone())
    }

    fn attached_pid(&self) -> Option<u32> {
        Some(self.attached.load(Ordering::SeqCst))
    }

    async fn detach(&self) -> TransferResult<()> {
        self.log.lock().unwrap().push("detach".to_string());
        Ok(())
    }

    async fn attach(&self, pid: u32) -> TransferResult<()> {
        self.log.lock().unwrap().push(format!("attach:{}", pid));
        self.attached.store(pid, Ordering::SeqCst);
        Ok(())
    }
}

/// SFTP-shaped transport over the same remote, for fallback runs.
struct MockSftp {
    remote: Arc<MockRemote>,
}

#[async_trait]
impl Transport for MockSftp {
    fn name(&self) -> &'static str {
        "sftp"
    }

    async fn list_tree(&self, root: &str) -> TransferResult<RemoteListing> {
        self.remote.listing(root)
    }

    async fn stat(&self, path: &str) -> TransferResult<RemoteFileStat> {
        Ok(self.remote.stat_of(path))
    }

    async fn batch_stat(
        &self,
        paths: &[String],
    ) -> TransferResult<HashMap<String, RemoteFileStat>> {
        Ok(paths
            .iter()
            .map(|path| (path.clone(), self.remote.stat_of(path)))
            .collect())
    }

    async fn read_chunk(&self, path: &str, offset: u64, size: usize) -> TransferResult<Vec<u8>> {
        self.remote.read(path, offset, size)
    }

    async fn remove(&self, path: &str) -> TransferResult<()> {
        if self.remote.remove(path) {
            Ok(())
        } else {
            Err(TransferError::not_found(path))
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    finished: Mutex<Option<ProgressSnapshot>>,
}

impl ProgressSink for RecordingSink {
    fn render(&self, _snapshot: &ProgressSnapshot) {}

    fn finish(&self, snapshot: &ProgressSnapshot) {
        *self.finished.lock().unwrap() = Some(snapshot.clone());
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn test_config() -> TransferConfig {
    TransferConfig {
        chunk_size: 256,
        max_workers: 3,
        batch_stat_size: 2,
    }
}

fn controller_over(
    agent: MockAgent,
    device: MockDevice,
    ssh: Option<SshFallback>,
) -> FallbackController {
    FallbackController::new(Arc::new(agent), Arc::new(device), ssh, test_config()).unwrap()
}

/// Map of relative path -> content for every file under `dir`.
fn snapshot_tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(base, &path, out);
            } else {
                let rel = path.strip_prefix(base).unwrap().to_string_lossy().to_string();
                out.insert(rel, std::fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn pull_bundle_downloads_tree_and_artifact_under_one_total() {
    let remote = demo_remote();
    let ctl = controller_over(
        MockAgent::over(remote.clone()),
        MockDevice::with(Vec::new(), 7),
        None,
    );

    let dump = ctl.dump_executable("/tmp/dump.bin").await.unwrap();
    assert_eq!(dump.executable_name, "Demo");
    assert_eq!(dump.bundle_path, remote.root);

    let scratch = tempfile::tempdir().unwrap();
    let local_dir = scratch.path().join("Demo.app");
    let local_artifact = scratch.path().join("Demo.decrypted");
    let sink = Arc::new(RecordingSink::default());

    let report = ctl
        .pull_bundle(
            &dump.bundle_path,
            &dump.out_path,
            &local_dir,
            &local_artifact,
            Some(sink.clone()),
        )
        .await
        .unwrap();

    assert_eq!(report.tree.transport, "rpc");
    assert!(report.tree.fully_transferred());
    assert_eq!(report.tree.total_files, 5);
    assert_eq!(report.tree.transferred_files, 5);
    assert_eq!(report.tree.transferred_bytes, DEMO_TREE_BYTES);
    assert_eq!(report.artifact.bytes_written, DEMO_ARTIFACT_BYTES);
    assert!(!report.artifact.truncated);

    // Local bytes match the remote exactly, including the empty file.
    let local = snapshot_tree(&local_dir);
    assert_eq!(local.len(), 5);
    for (rel, data) in &remote.files {
        assert_eq!(local.get(rel.as_str()), Some(data), "mismatch at {}", rel);
    }
    let artifact_data = remote.extra.get("/tmp/dump.bin").unwrap();
    assert_eq!(&std::fs::read(&local_artifact).unwrap(), artifact_data);
    assert_eq!(
        report.artifact.checksum.as_deref(),
        Some(sha256_hex(artifact_data).as_str())
    );

    // The remote artifact was cleaned up, under the combined progress total.
    assert!(report.artifact_removed);
    assert_eq!(
        remote.removed.lock().unwrap().as_slice(),
        ["/tmp/dump.bin".to_string()]
    );
    let finished = sink.finished.lock().unwrap().clone().unwrap();
    assert_eq!(finished.label, "Downloading");
    assert_eq!(finished.total, DEMO_TREE_BYTES + DEMO_ARTIFACT_BYTES);
    assert_eq!(finished.transferred, DEMO_TREE_BYTES + DEMO_ARTIFACT_BYTES);
}

#[tokio::test]
async fn one_broken_file_never_stops_the_rest_of_the_tree() {
    let remote = demo_remote();
    let broken = format!("{}/Frameworks/Shared.framework/Shared", remote.root);
    let ctl = controller_over(
        MockAgent::over(remote.clone()).with_broken_read(&broken),
        MockDevice::with(Vec::new(), 7),
        None,
    );

    let scratch = tempfile::tempdir().unwrap();
    let report = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();

    assert_eq!(report.transferred_files, 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, "Frameworks/Shared.framework/Shared");
    assert_eq!(report.failed[0].kind, TransferErrorKind::IoError);
    assert!(!report.fully_transferred());

    // Siblings arrived whole.
    assert_eq!(
        std::fs::read(scratch.path().join("Demo")).unwrap(),
        pattern(0x11, 512)
    );
    assert_eq!(ctl.state().await, TransportState::Primary);
}

#[tokio::test]
async fn agent_loss_mid_transfer_falls_back_to_sftp() {
    let remote = demo_remote();
    let ssh = SshFallback::Transport(Arc::new(MockSftp {
        remote: remote.clone(),
    }));
    let ctl = controller_over(
        MockAgent::over(remote.clone()).losing_reads(1),
        MockDevice::with(Vec::new(), 7),
        Some(ssh),
    );

    let scratch = tempfile::tempdir().unwrap();
    let report = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();

    // The whole operation re-ran on SFTP; nothing in the report mixes
    // transports.
    assert_eq!(report.transport, "sftp");
    assert!(report.fully_transferred());
    assert_eq!(report.transferred_bytes, DEMO_TREE_BYTES);
    assert_eq!(ctl.state().await, TransportState::SshFallback);

    let local = snapshot_tree(scratch.path());
    for (rel, data) in &remote.files {
        assert_eq!(local.get(rel.as_str()), Some(data), "mismatch at {}", rel);
    }

    // Later operations stay on the fallback transport.
    let (tree, total) = ctl.enumerate(&remote.root).await.unwrap();
    assert_eq!(total, DEMO_TREE_BYTES);
    assert_eq!(tree.files.len(), 5);
}

#[tokio::test]
async fn agent_loss_without_ssh_retargets_and_completes() {
    let remote = small_remote();
    let ctl = controller_over(
        MockAgent::over(remote.clone()).losing_lists(1),
        MockDevice::with(vec![ProcessInfo::new(58, "SpringBoard")], 7),
        None,
    );

    let scratch = tempfile::tempdir().unwrap();
    let report = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();

    assert_eq!(report.transport, "rpc");
    assert_eq!(report.total_bytes, 150);
    assert_eq!(report.transferred_bytes, 150);
    assert!(report.fully_transferred());
    assert_eq!(ctl.state().await, TransportState::Primary);

    assert!(scratch.path().join("a").is_dir());
    assert!(scratch.path().join("a/b").is_dir());
    assert_eq!(
        std::fs::read(scratch.path().join("a/f1")).unwrap(),
        pattern(1, 100)
    );
    assert_eq!(
        std::fs::read(scratch.path().join("a/b/f2")).unwrap(),
        pattern(2, 50)
    );
}

#[tokio::test]
async fn retarget_goes_to_first_candidate_with_a_new_pid() {
    let remote = small_remote();
    let device = Arc::new(MockDevice::with(
        vec![
            ProcessInfo::new(12, "installd"),
            ProcessInfo::new(58, "SpringBoard"),
        ],
        7,
    ));
    let ctl = FallbackController::new(
        Arc::new(MockAgent::over(remote.clone()).losing_lists(1)),
        device.clone(),
        None,
        test_config(),
    )
    .unwrap();

    ctl.enumerate(&remote.root).await.unwrap();
    assert_eq!(
        device.calls(),
        vec![
            "list".to_string(),
            "detach".to_string(),
            "attach:58".to_string()
        ]
    );
}

#[tokio::test]
async fn broken_batch_stat_still_classifies_every_path() {
    let remote = demo_remote();
    let agent = Arc::new(MockAgent::over(remote.clone()).with_broken_batch("batchStat unsupported"));
    let ctl = FallbackController::new(
        agent.clone(),
        Arc::new(MockDevice::with(Vec::new(), 7)),
        None,
        test_config(),
    )
    .unwrap();

    let (tree, total) = ctl.enumerate(&remote.root).await.unwrap();

    assert_eq!(total, DEMO_TREE_BYTES);
    assert_eq!(tree.files.len(), 5);
    // Five files in batches of two: three failed batch calls, then one
    // individual stat per path.
    assert_eq!(agent.batch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(agent.stat_calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn rerun_overwrites_into_an_identical_tree() {
    let remote = demo_remote();
    let ctl = controller_over(
        MockAgent::over(remote.clone()),
        MockDevice::with(Vec::new(), 7),
        None,
    );

    let scratch = tempfile::tempdir().unwrap();
    let first = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();
    let after_first = snapshot_tree(scratch.path());

    let second = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();
    let after_second = snapshot_tree(scratch.path());

    assert!(first.fully_transferred());
    assert!(second.fully_transferred());
    assert_eq!(after_first, after_second);
    assert_ne!(first.operation_id, second.operation_id);
}

#[tokio::test]
async fn shrunken_remote_file_is_flagged_truncated() {
    let remote = demo_remote();
    let mut remote = Arc::try_unwrap(remote).ok().unwrap();
    remote.stat_overrides.insert(
        format!("{}/Demo", remote.root),
        1024, // manifest claims 1024; only 512 exist
    );
    let remote = Arc::new(remote);

    let ctl = controller_over(
        MockAgent::over(remote.clone()),
        MockDevice::with(Vec::new(), 7),
        None,
    );

    let scratch = tempfile::tempdir().unwrap();
    let report = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();

    assert_eq!(report.truncated, vec!["Demo".to_string()]);
    assert!(report.failed.is_empty());
    assert!(!report.fully_transferred());
    assert_eq!(report.total_bytes, DEMO_TREE_BYTES + 512);
    assert_eq!(report.transferred_bytes, DEMO_TREE_BYTES);
    assert_eq!(
        std::fs::read(scratch.path().join("Demo")).unwrap().len(),
        512
    );
}

#[tokio::test]
async fn single_file_download_checksums_the_result() {
    let remote = demo_remote();
    let ctl = controller_over(
        MockAgent::over(remote.clone()),
        MockDevice::with(Vec::new(), 7),
        None,
    );

    let scratch = tempfile::tempdir().unwrap();
    let local = scratch.path().join("dump.bin");
    let outcome = ctl
        .download_file("/tmp/dump.bin", &local, None)
        .await
        .unwrap();

    assert_eq!(outcome.bytes_written, DEMO_ARTIFACT_BYTES);
    let expected = sha256_hex(remote.extra.get("/tmp/dump.bin").unwrap());
    assert_eq!(outcome.checksum.as_deref(), Some(expected.as_str()));

    let err = ctl
        .download_file(&remote.root, &scratch.path().join("dir"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, TransferErrorKind::IsDirectory);
}

#[tokio::test]
async fn reports_serialise_with_camel_case_keys() {
    let remote = small_remote();
    let ctl = controller_over(
        MockAgent::over(remote.clone()),
        MockDevice::with(Vec::new(), 7),
        None,
    );

    let scratch = tempfile::tempdir().unwrap();
    let report = ctl
        .download_tree(&remote.root, scratch.path(), None)
        .await
        .unwrap();

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"operationId\""));
    assert!(json.contains("\"transferredBytes\":150"));
    assert!(json.contains("\"startedAt\""));

    let back: bundlepull::TransferReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.operation_id, report.operation_id);
    assert_eq!(back.transferred_files, 2);
}

#[tokio::test]
async fn rpc_transport_is_usable_standalone() {
    let remote = demo_remote();
    let transport = RpcTransport::new(Arc::new(MockAgent::over(remote.clone())));

    let listing = transport.list_tree(&remote.root).await.unwrap();
    assert_eq!(listing.dirs.len(), 3);
    assert_eq!(listing.files.len(), 5);

    let stat = transport
        .stat(&format!("{}/Info.plist", remote.root))
        .await
        .unwrap();
    assert!(stat.is_transferable());
    assert_eq!(stat.size, 8);
}
