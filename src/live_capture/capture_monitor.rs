use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::capture_format::{IncrementalParser, MAX_RECORD_BYTES};
use super::interfaces::{choose_default, list_interfaces};
use super::types::*;
use crate::configuration::types::CaptureConfig;
use crate::dissector::process::{collect_bounded, spawn_error};
use crate::error_handling::types::ForensicError;
use crate::session_management::session::{CaptureSession, SessionSource};
use crate::session_management::session_registry::SessionRegistry;

/// Upper bound on what one read of the capture file pulls into memory.
const READ_CHUNK_BYTES: u64 = 2 * MAX_RECORD_BYTES as u64;

struct LiveCapture {
    capture_id: String,
    /// Staged file the capture process writes to.
    file_path: PathBuf,
    /// Where the file is moved once the capture is stopped.
    reserved_path: PathBuf,
    state: CaptureState,
    child: Option<Child>,
    stderr: Option<JoinHandle<String>>,
    parser: IncrementalParser,
    size_bytes: u64,
    error: Option<String>,
    /// Set once the file stops parsing; no further parsing is attempted.
    parse_error: Option<String>,
}

impl LiveCapture {
    async fn take_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Notices a capture process that ended on its own.
    async fn refresh_state(&mut self) {
        let status = match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => status,
            Some(Ok(None)) | None => return,
            Some(Err(e)) => {
                warn!("[{}] Failed to query capture process: {}", self.capture_id, e);
                return;
            }
        };
        self.child = None;
        if status.success() {
            info!("[{}] Capture process finished", self.capture_id);
            self.state = CaptureState::Stopped;
        } else {
            let stderr = self.take_stderr().await;
            error!("[{}] Capture process exited with {}", self.capture_id, status);
            self.state = CaptureState::Errored;
            self.error = Some(ForensicError::process(status.code(), &stderr).to_string());
        }
    }

    /// Parses whatever was flushed since the last call, one bounded chunk at a time.
    async fn refresh_stats(&mut self) {
        let len = match tokio::fs::metadata(&self.file_path).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                debug!("[{}] Capture file not readable yet: {}", self.capture_id, e);
                return;
            }
        };
        if len < self.parser.offset() {
            warn!(
                "[{}] Capture file shrank to {} bytes, restarting parse",
                self.capture_id, len
            );
            self.parser.reset();
            self.parse_error = None;
        }
        self.size_bytes = len;
        if self.parse_error.is_some() {
            return;
        }

        while self.parser.offset() < len {
            let data = match read_chunk(&self.file_path, self.parser.offset(), READ_CHUNK_BYTES).await {
                Ok(data) => data,
                Err(e) => {
                    debug!("[{}] Failed to read capture file: {}", self.capture_id, e);
                    return;
                }
            };
            match self.parser.advance(&data) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "[{}] Capture file stopped parsing at offset {}: {}",
                        self.capture_id,
                        self.parser.offset(),
                        e
                    );
                    self.parse_error = Some(format!("capture file is malformed: {}", e));
                    break;
                }
            }
        }
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            capture_id: self.capture_id.clone(),
            state: self.state,
            size_bytes: self.size_bytes,
            packet_count: self.parser.packet_count(),
            format: self.parser.format(),
            byte_order: self.parser.byte_order(),
            error: self.error.clone().or_else(|| self.parse_error.clone()),
        }
    }
}

async fn read_chunk(path: &Path, offset: u64, limit: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut data = Vec::new();
    file.take(limit).read_to_end(&mut data).await?;
    Ok(data)
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    let pid = match child.id() {
        Some(pid) => pid,
        None => return Ok(()),
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

struct CaptureSlot {
    owner: Option<String>,
    capture: AsyncMutex<LiveCapture>,
}

pub fn capture_args(interface: &str, file_path: &Path, options: &StartOptions) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        interface.to_string(),
        "-w".to_string(),
        file_path.to_string_lossy().into_owned(),
    ];
    if let Some(secs) = options.duration_secs {
        args.push("-a".to_string());
        args.push(format!("duration:{}", secs));
    }
    if let Some(count) = options.max_packets {
        args.push("-c".to_string());
        args.push(count.to_string());
    }
    if let Some(filter) = options.filter.as_deref().filter(|f| !f.trim().is_empty()) {
        args.push("-f".to_string());
        args.push(filter.to_string());
    }
    args
}

/// Runs capture processes and answers cheap progress polls about them.
///
/// Polls never start the dissector; they parse the growing capture file from
/// where the previous poll stopped. Polls and stops on one capture are serialized.
///
/// A capture writes to a staged file the session registry does not list; only
/// a successful [`stop`](Self::stop) moves it into place as a session. A capture
/// whose process failed is dropped by the first poll that notices.
pub struct CaptureMonitor {
    tool: PathBuf,
    grace_period: Duration,
    stop_timeout: Duration,
    registry: Arc<SessionRegistry>,
    captures: Mutex<HashMap<String, Arc<CaptureSlot>>>,
}

impl CaptureMonitor {
    pub fn new(tool: PathBuf, config: &CaptureConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            tool,
            grace_period: Duration::from_millis(config.grace_period_ms),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            registry,
            captures: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<CaptureSlot>>> {
        self.captures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, capture_id: &str, owner: Option<&str>) -> Result<Arc<CaptureSlot>, ForensicError> {
        let not_found = || ForensicError::NotFound(format!("capture {}", capture_id));
        let slot = self.table().get(capture_id).cloned().ok_or_else(not_found)?;
        match owner {
            Some(o) if slot.owner.as_deref() != Some(o) => Err(not_found()),
            _ => Ok(slot),
        }
    }

    pub async fn interfaces(&self) -> Result<Vec<NetworkInterface>, ForensicError> {
        list_interfaces(&self.tool).await
    }

    async fn default_interface(&self) -> Result<String, ForensicError> {
        let interfaces = self.interfaces().await?;
        let chosen = choose_default(&interfaces)
            .ok_or_else(|| ForensicError::NotFound("capture interface".to_string()))?;
        info!(
            "Capturing on default interface {} ({})",
            chosen.name,
            chosen.description.as_deref().unwrap_or("no description")
        );
        Ok(chosen.name.clone())
    }

    /// Spawns a capture into a fresh staged registry path. Fails if the process dies within the grace window.
    pub async fn start(
        &self,
        options: &StartOptions,
        owner: Option<&str>,
    ) -> Result<CaptureHandle, ForensicError> {
        let interface = match options.interface.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.default_interface().await?,
        };
        let started_at: DateTime<Utc> = Utc::now();
        let file_name = format!("live-{}.pcapng", started_at.format("%Y%m%dT%H%M%SZ"));
        let (capture_id, reserved_path) = self.registry.reserve(&file_name);
        let file_path = self.registry.staging_path(&capture_id, &file_name);
        let args = capture_args(&interface, &file_path, options);

        info!("[{}] Starting capture on {}", capture_id, interface);
        let mut child = Command::new(&self.tool)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.tool, e))?;
        let stderr = child.stderr.take().map(collect_bounded);

        let mut capture = LiveCapture {
            capture_id: capture_id.clone(),
            file_path: file_path.clone(),
            reserved_path,
            state: CaptureState::Starting,
            child: None,
            stderr,
            parser: IncrementalParser::default(),
            size_bytes: 0,
            error: None,
            parse_error: None,
        };

        let early_exit = tokio::time::timeout(self.grace_period, child.wait()).await;
        match early_exit {
            Err(_) => {
                capture.state = CaptureState::Running;
                capture.child = Some(child);
            }
            Ok(Ok(status)) if status.success() => {
                debug!("[{}] Capture finished within the grace window", capture_id);
                capture.state = CaptureState::Stopped;
            }
            Ok(Ok(status)) => {
                let diagnostic = capture.take_stderr().await;
                error!("[{}] Capture failed to start: {}", capture_id, status);
                if let Err(e) = tokio::fs::remove_file(&file_path).await {
                    debug!("[{}] No partial capture to remove: {}", capture_id, e);
                }
                return Err(ForensicError::process(status.code(), &diagnostic));
            }
            Ok(Err(e)) => return Err(ForensicError::IoError(e)),
        }

        let handle = CaptureHandle {
            capture_id: capture_id.clone(),
            interface,
            file_path,
            started_at,
            state: capture.state,
        };
        self.table().insert(
            capture_id,
            Arc::new(CaptureSlot {
                owner: owner.map(str::to_string),
                capture: AsyncMutex::new(capture),
            }),
        );
        Ok(handle)
    }

    pub async fn poll(
        &self,
        capture_id: &str,
        owner: Option<&str>,
    ) -> Result<CaptureStats, ForensicError> {
        let slot = self.slot(capture_id, owner)?;
        let mut capture = slot.capture.lock().await;
        capture.refresh_state().await;
        capture.refresh_stats().await;
        let stats = capture.stats();

        if capture.state == CaptureState::Errored {
            self.table().remove(capture_id);
            info!("[{}] Dropping failed capture", capture_id);
            if let Err(e) = tokio::fs::remove_file(&capture.file_path).await {
                debug!("[{}] No partial capture to remove: {}", capture_id, e);
            }
        }
        Ok(stats)
    }

    /// Interrupts the capture, waits for it, and registers the file as a session.
    pub async fn stop(
        &self,
        capture_id: &str,
        owner: Option<&str>,
    ) -> Result<CaptureSession, ForensicError> {
        let slot = self.slot(capture_id, owner)?;
        let mut capture = slot.capture.lock().await;

        if let Some(mut child) = capture.child.take() {
            debug!("[{}] Interrupting capture process", capture_id);
            if let Err(e) = interrupt(&mut child) {
                warn!("[{}] Failed to interrupt capture: {}", capture_id, e);
            }
            match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => debug!("[{}] Capture process exited with {}", capture_id, status),
                Ok(Err(e)) => warn!("[{}] Failed to wait for capture: {}", capture_id, e),
                Err(_) => {
                    warn!(
                        "[{}] Capture ignored the interrupt for {:.1}s, killing it",
                        capture_id,
                        self.stop_timeout.as_secs_f64()
                    );
                    if let Err(e) = child.kill().await {
                        warn!("[{}] Failed to kill capture: {}", capture_id, e);
                    }
                }
            }
        }
        let stderr = capture.take_stderr().await;
        self.table().remove(capture_id);
        capture.refresh_stats().await;

        let written = match tokio::fs::metadata(&capture.file_path).await {
            Ok(metadata) => metadata.is_file() && metadata.len() > 0,
            Err(_) => false,
        };
        if !written {
            capture.state = CaptureState::Errored;
            error!("[{}] Capture produced no data", capture_id);
            if let Err(e) = tokio::fs::remove_file(&capture.file_path).await {
                debug!("[{}] No empty capture to remove: {}", capture_id, e);
            }
            let diagnostic = if stderr.trim().is_empty() {
                "capture file is missing or empty".to_string()
            } else {
                format!("capture file is missing or empty: {}", stderr.trim())
            };
            return Err(ForensicError::process(None, &diagnostic));
        }

        capture.state = CaptureState::Stopped;
        info!(
            "[{}] Capture stopped with {} packet(s) in {} bytes",
            capture_id,
            capture.parser.packet_count(),
            capture.size_bytes
        );
        let promoted = self.registry.promote(
            capture_id,
            &capture.file_path,
            &capture.reserved_path,
            slot.owner.as_deref(),
            SessionSource::LiveCapture,
        );
        if let Err(e) = &promoted {
            error!("[{}] Failed to register capture: {}", capture_id, e);
            self.registry.forget(capture_id);
        }
        promoted
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::dissector::fake_tool::write_script;
    use tempfile::TempDir;

    const WRITES_ONE_PACKET: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-w" ]; then out="$2"; fi
  shift
done
printf '\324\303\262\241\002\000\004\000\000\000\000\000\000\000\000\000\377\377\000\000\001\000\000\000' > "$out"
printf '\001\000\000\000\000\000\000\000\004\000\000\000\004\000\000\000abcd' >> "$out"
trap 'exit 0' INT TERM
while true; do sleep 0.05; done"#;

    fn monitor(script: &str) -> (TempDir, Arc<SessionRegistry>, CaptureMonitor) {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "capture-tool", script);
        let registry = Arc::new(SessionRegistry::new(dir.path().join("store")).unwrap());
        let config = CaptureConfig {
            capture_tool_path: Some(tool.clone()),
            grace_period_ms: 200,
            stop_timeout_secs: 5,
        };
        let monitor = CaptureMonitor::new(tool, &config, registry.clone());
        (dir, registry, monitor)
    }

    fn on(interface: &str) -> StartOptions {
        StartOptions {
            interface: Some(interface.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn args_carry_optional_limits() {
        let options = StartOptions {
            interface: None,
            duration_secs: Some(30),
            max_packets: Some(500),
            filter: Some("tcp port 80".into()),
        };
        let args = capture_args("eth0", Path::new("/tmp/x.pcapng"), &options);
        assert_eq!(
            args,
            vec!["-i", "eth0", "-w", "/tmp/x.pcapng", "-a", "duration:30", "-c", "500", "-f", "tcp port 80"]
        );
    }

    #[tokio::test]
    async fn capture_runs_polls_and_finalizes() {
        let (_dir, registry, monitor) = monitor(WRITES_ONE_PACKET);
        let handle = monitor.start(&on("eth0"), Some("alice")).await.unwrap();
        assert_eq!(handle.state, CaptureState::Running);

        let stats = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = monitor.poll(&handle.capture_id, None).await.unwrap();
                if stats.packet_count == 1 {
                    return stats;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stats.size_bytes, 44);
        assert_eq!(stats.format, Some(CaptureFormat::Pcap));
        assert_eq!(stats.state, CaptureState::Running);

        // Idempotent
        let again = monitor.poll(&handle.capture_id, None).await.unwrap();
        assert_eq!(again.packet_count, 1);

        assert!(matches!(
            monitor.poll(&handle.capture_id, Some("bob")).await,
            Err(ForensicError::NotFound(_))
        ));

        // Still being written, so not a session yet.
        assert!(matches!(
            registry.get(&handle.capture_id, None),
            Err(ForensicError::NotFound(_))
        ));
        assert!(registry.list(None).unwrap().is_empty());

        let session = monitor.stop(&handle.capture_id, Some("alice")).await.unwrap();
        assert_eq!(session.id, handle.capture_id);
        assert_eq!(session.source, SessionSource::LiveCapture);
        assert_eq!(session.size_bytes, 44);
        assert_eq!(session.owner.as_deref(), Some("alice"));
        assert!(registry.get(&session.id, Some("alice")).is_ok());
        assert!(session.file_path.exists());
        assert!(!handle.file_path.exists());

        assert!(matches!(
            monitor.poll(&handle.capture_id, None).await,
            Err(ForensicError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn immediate_failure_surfaces_stderr() {
        let (_dir, _registry, monitor) = monitor(
            "echo \"You don't have permission to capture on that device\" >&2\nexit 2",
        );
        let err = monitor.start(&on("eth0"), None).await.unwrap_err();
        match err {
            ForensicError::Process { status, diagnostic } => {
                assert_eq!(status, Some(2));
                assert!(diagnostic.contains("permission"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn empty_capture_is_not_registered() {
        let (_dir, registry, monitor) =
            monitor("trap 'exit 0' INT TERM\nwhile true; do sleep 0.05; done");
        let handle = monitor.start(&on("eth0"), None).await.unwrap();
        let err = monitor.stop(&handle.capture_id, None).await.unwrap_err();
        assert!(matches!(err, ForensicError::Process { .. }));
        assert!(registry.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn capture_that_ends_by_itself_can_still_be_finalized() {
        let script = WRITES_ONE_PACKET.replace(
            "trap 'exit 0' INT TERM\nwhile true; do sleep 0.05; done",
            "exit 0",
        );
        let (_dir, _registry, monitor) = monitor(&script);
        let handle = monitor.start(&on("eth0"), None).await.unwrap();
        assert_eq!(handle.state, CaptureState::Stopped);

        let stats = monitor.poll(&handle.capture_id, None).await.unwrap();
        assert_eq!(stats.state, CaptureState::Stopped);
        assert_eq!(stats.packet_count, 1);

        let session = monitor.stop(&handle.capture_id, None).await.unwrap();
        assert_eq!(session.size_bytes, 44);
    }

    #[tokio::test]
    async fn unknown_capture_is_not_found() {
        let (_dir, _registry, monitor) = monitor("exit 0");
        assert!(matches!(
            monitor.stop("nope", None).await,
            Err(ForensicError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn shrinking_file_resets_the_parser() {
        let (_dir, _registry, monitor) = monitor(WRITES_ONE_PACKET);
        let handle = monitor.start(&on("eth0"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = monitor.poll(&handle.capture_id, None).await.unwrap();
        assert_eq!(first.packet_count, 1);

        // A restarted capture begins with just a header.
        let header = std::fs::read(&handle.file_path).unwrap()[..24].to_vec();
        std::fs::write(&handle.file_path, header).unwrap();
        let after = monitor.poll(&handle.capture_id, None).await.unwrap();
        assert_eq!(after.packet_count, 0);
        assert_eq!(after.size_bytes, 24);
    }

    async fn poll_until<F>(monitor: &CaptureMonitor, capture_id: &str, done: F) -> CaptureStats
    where
        F: Fn(&CaptureStats) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let stats = monitor.poll(capture_id, None).await.unwrap();
                if done(&stats) {
                    return stats;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn corrupt_record_length_is_reported_once() {
        let script = WRITES_ONE_PACKET.replace(
            r"'\001\000\000\000\000\000\000\000\004\000\000\000\004\000\000\000abcd'",
            r"'\001\000\000\000\000\000\000\000\000\000\000\177\000\000\000\177'",
        );
        let (_dir, _registry, monitor) = monitor(&script);
        let handle = monitor.start(&on("eth0"), None).await.unwrap();

        let stats = poll_until(&monitor, &handle.capture_id, |s| s.error.is_some()).await;
        assert_eq!(stats.packet_count, 0);
        assert_eq!(stats.state, CaptureState::Running);
        assert!(stats.error.unwrap().contains("malformed"));

        let again = monitor.poll(&handle.capture_id, None).await.unwrap();
        assert_eq!(again.packet_count, 0);
        assert!(again.error.is_some());
        monitor.stop(&handle.capture_id, None).await.unwrap();
    }

    #[tokio::test]
    async fn failed_capture_is_dropped_by_the_poll_that_sees_it() {
        let (_dir, registry, monitor) = monitor("sleep 0.4\necho 'interface went away' >&2\nexit 3");
        let handle = monitor.start(&on("eth0"), None).await.unwrap();
        assert_eq!(handle.state, CaptureState::Running);

        let stats = poll_until(&monitor, &handle.capture_id, |s| s.state != CaptureState::Running).await;
        assert_eq!(stats.state, CaptureState::Errored);
        assert!(stats.error.unwrap().contains("interface went away"));

        assert!(matches!(
            monitor.poll(&handle.capture_id, None).await,
            Err(ForensicError::NotFound(_))
        ));
        assert!(matches!(
            monitor.stop(&handle.capture_id, None).await,
            Err(ForensicError::NotFound(_))
        ));
        assert!(registry.list(None).unwrap().is_empty());
    }
}
