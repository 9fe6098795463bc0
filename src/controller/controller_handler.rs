use crate::configuration::config::Config;
use crate::correlation::{AnalysisArtifact, ExtractionOptions, FieldExtractor};
use crate::dissector::locator::{resolve_tshark, tshark_version};
use crate::error_handling::types::ForensicError;
use crate::job_dispatch::{AnalysisDispatcher, DispatchStats};
use crate::live_capture::{CaptureHandle, CaptureMonitor, CaptureStats, NetworkInterface, StartOptions};
use crate::session_management::{CaptureSession, SessionRegistry};
use crate::stream_reconstruction::{FollowRequest, FollowResult, StreamReconstructor, TcpStreamEntry};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Single owner of the engine's shared state.
///
/// Every dissector invocation goes through the dispatcher, so at most
/// `max_concurrent_jobs` of them run at once no matter which operation started them.
pub struct Controller {
    config: Config,
    registry: Arc<SessionRegistry>,
    dispatcher: AnalysisDispatcher,
    monitor: CaptureMonitor,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ForensicError> {
        info!("Creating controller");
        config
            .validate()
            .map_err(|e| ForensicError::Configuration(e.to_string()))?;

        let registry = Arc::new(SessionRegistry::new(&config.storage_path)?);
        let dispatcher = AnalysisDispatcher::new(
            config.dispatcher.max_concurrent_jobs,
            config.dispatcher.max_queued_jobs,
        );
        let capture_tool = match &config.capture.capture_tool_path {
            Some(path) => path.clone(),
            None => resolve_tshark(config.dissector.tshark_path.as_deref()).unwrap_or_else(|e| {
                warn!("No capture tool resolved yet ({}), relying on the search path", e);
                PathBuf::from("tshark")
            }),
        };
        debug!("Capture tool: {}", capture_tool.display());
        let monitor = CaptureMonitor::new(capture_tool, &config.capture, Arc::clone(&registry));

        Ok(Self {
            config,
            registry,
            dispatcher,
            monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolved on every call so a dissector installed after startup is picked up.
    fn tshark(&self) -> Result<PathBuf, ForensicError> {
        resolve_tshark(self.config.dissector.tshark_path.as_deref())
    }

    /// Extraction options seeded from the `[dissector]` section.
    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            max_packets: self.config.dissector.max_packets,
            sample_frames_per_session: self.config.dissector.sample_frames_per_session,
            include_sha256: self.config.dissector.include_sha256,
        }
    }

    /// A follow request for `stream_id` with the `[follow]` budgets.
    pub fn follow_request(&self, stream_id: u64) -> FollowRequest {
        FollowRequest::new(stream_id, &self.config.follow)
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    // Sessions

    pub fn upload(
        &self,
        file_name: &str,
        data: &[u8],
        owner: Option<&str>,
    ) -> Result<CaptureSession, ForensicError> {
        self.registry.register_upload(file_name, data, owner)
    }

    pub fn session(&self, session_id: &str, owner: Option<&str>) -> Result<CaptureSession, ForensicError> {
        self.registry.get(session_id, owner)
    }

    pub fn list_sessions(&self, owner: Option<&str>) -> Result<Vec<CaptureSession>, ForensicError> {
        self.registry.list(owner)
    }

    // Analysis

    pub async fn analyze(
        &self,
        session_id: &str,
        owner: Option<&str>,
        options: ExtractionOptions,
    ) -> Result<AnalysisArtifact, ForensicError> {
        let session = self.registry.get(session_id, owner)?;
        info!("[{}] Analysis requested", session.id);
        self.analyze_file(&session.file_path, options).await
    }

    /// Correlates a capture file that is not necessarily registered.
    pub async fn analyze_file(
        &self,
        pcap: &Path,
        options: ExtractionOptions,
    ) -> Result<AnalysisArtifact, ForensicError> {
        let tshark = self.tshark()?;
        let thresholds = self.config.rules.clone();
        let pcap = pcap.to_path_buf();
        let label = format!("analyze {}", pcap.display());
        self.dispatcher
            .run(&label, self.config.analysis_timeout(), async move {
                let version = tshark_version(&tshark).await;
                FieldExtractor::new(tshark, version, thresholds)
                    .analyze(&pcap, &options)
                    .await
            })
            .await
    }

    // Streams

    pub async fn list_streams(
        &self,
        session_id: &str,
        owner: Option<&str>,
        limit: Option<usize>,
        max_packets: Option<u64>,
    ) -> Result<Vec<TcpStreamEntry>, ForensicError> {
        let session = self.registry.get(session_id, owner)?;
        self.list_streams_in(&session.file_path, limit, max_packets).await
    }

    pub async fn list_streams_in(
        &self,
        pcap: &Path,
        limit: Option<usize>,
        max_packets: Option<u64>,
    ) -> Result<Vec<TcpStreamEntry>, ForensicError> {
        let reconstructor = StreamReconstructor::new(self.tshark()?);
        let pcap = pcap.to_path_buf();
        let label = format!("streams {}", pcap.display());
        self.dispatcher
            .run(&label, self.config.stream_timeout(), async move {
                reconstructor.list_streams(&pcap, limit, max_packets).await
            })
            .await
    }

    pub async fn follow_stream(
        &self,
        session_id: &str,
        owner: Option<&str>,
        request: FollowRequest,
    ) -> Result<FollowResult, ForensicError> {
        let session = self.registry.get(session_id, owner)?;
        self.follow_stream_in(&session.file_path, request).await
    }

    pub async fn follow_stream_in(
        &self,
        pcap: &Path,
        request: FollowRequest,
    ) -> Result<FollowResult, ForensicError> {
        let reconstructor = StreamReconstructor::new(self.tshark()?);
        let pcap = pcap.to_path_buf();
        let label = format!("follow {}#{}", pcap.display(), request.stream_id);
        self.dispatcher
            .run(&label, self.config.stream_timeout(), async move {
                reconstructor.follow_stream(&pcap, &request).await
            })
            .await
    }

    // Live capture

    pub async fn interfaces(&self) -> Result<Vec<NetworkInterface>, ForensicError> {
        self.monitor.interfaces().await
    }

    pub async fn start_capture(
        &self,
        options: &StartOptions,
        owner: Option<&str>,
    ) -> Result<CaptureHandle, ForensicError> {
        self.monitor.start(options, owner).await
    }

    pub async fn poll_capture(
        &self,
        capture_id: &str,
        owner: Option<&str>,
    ) -> Result<CaptureStats, ForensicError> {
        self.monitor.poll(capture_id, owner).await
    }

    /// Stops the capture; the returned session is ready for analysis.
    pub async fn stop_capture(
        &self,
        capture_id: &str,
        owner: Option<&str>,
    ) -> Result<CaptureSession, ForensicError> {
        self.monitor.stop(capture_id, owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.storage_path = dir.join("storage");
        config
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.dispatcher.max_concurrent_jobs = 0;
        assert!(matches!(
            Controller::new(config),
            Err(ForensicError::Configuration(_))
        ));
    }

    #[test]
    fn options_follow_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.dissector.max_packets = Some(500);
        config.dissector.include_sha256 = false;
        config.follow.context_packets = 4;
        let controller = Controller::new(config).unwrap();

        let options = controller.extraction_options();
        assert_eq!(options.max_packets, Some(500));
        assert!(!options.include_sha256);
        assert_eq!(controller.follow_request(7).stream_id, 7);
        assert_eq!(controller.dispatch_stats().max_active, 2);
    }

    #[test]
    fn sessions_are_scoped_to_their_owner() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(config_in(dir.path())).unwrap();

        let session = controller
            .upload("trace.pcap", b"bytes", Some("alice"))
            .unwrap();
        assert!(controller.session(&session.id, Some("alice")).is_ok());
        assert!(matches!(
            controller.session(&session.id, Some("bob")),
            Err(ForensicError::NotFound(_))
        ));
        assert_eq!(controller.list_sessions(Some("alice")).unwrap().len(), 1);
        assert!(controller.list_sessions(Some("bob")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_dissector_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.dissector.tshark_path = Some(dir.path().join("no-such-tshark"));
        let controller = Controller::new(config).unwrap();
        let session = controller.upload("a.pcap", b"x", None).unwrap();

        let err = controller
            .analyze(&session.id, None, ExtractionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForensicError::Configuration(_)));
    }

    #[cfg(unix)]
    mod with_fake_dissector {
        use super::*;
        use crate::dissector::fake_tool::write_script;

        const TSHARK: &str = r#"case "$1" in
--version) echo 'TShark (Wireshark) 4.2.0' ;;
*)
printf '"frame.number"\t"frame.time_epoch"\t"frame.len"\t"ip.src"\t"ip.dst"\t"udp.srcport"\t"udp.dstport"\t"frame.protocols"\t"dns.qry.name"\n'
printf '"1"\t"5.0"\t"80"\t"192.168.1.2"\t"192.168.1.1"\t"40000"\t"53"\t"eth:ethertype:ip:udp:dns"\t"example.org"\n'
;;
esac"#;

        fn controller_with(dir: &Path, script: &str) -> Controller {
            let tshark = write_script(dir, "tshark", script);
            let mut config = config_in(dir);
            config.dissector.tshark_path = Some(tshark);
            config.dissector.analysis_timeout_secs = 1;
            Controller::new(config).unwrap()
        }

        #[tokio::test]
        async fn analyze_goes_through_the_dispatcher() {
            let dir = tempfile::tempdir().unwrap();
            let controller = controller_with(dir.path(), TSHARK);
            let session = controller
                .upload("dns.pcap", b"capture", Some("alice"))
                .unwrap();

            let artifact = controller
                .analyze(&session.id, Some("alice"), controller.extraction_options())
                .await
                .unwrap();
            assert_eq!(artifact.pcap.packets_analyzed, 1);
            assert_eq!(artifact.sessions.len(), 1);
            assert_eq!(
                artifact.tooling.tshark_version.as_deref(),
                Some("TShark (Wireshark) 4.2.0")
            );
            assert!(artifact
                .timeline
                .iter()
                .any(|e| e.summary == "DNS query: example.org"));

            let stats = controller.dispatch_stats();
            assert_eq!(stats.active, 0);
            assert_eq!(stats.queued, 0);
        }

        #[tokio::test]
        async fn foreign_owner_never_reaches_the_dissector() {
            let dir = tempfile::tempdir().unwrap();
            let controller = controller_with(dir.path(), TSHARK);
            let session = controller.upload("dns.pcap", b"capture", Some("alice")).unwrap();

            let err = controller
                .list_streams(&session.id, Some("mallory"), None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, ForensicError::NotFound(_)));
        }

        #[tokio::test]
        async fn slow_analysis_times_out_and_frees_its_slot() {
            let dir = tempfile::tempdir().unwrap();
            let controller = controller_with(
                dir.path(),
                "case \"$1\" in --version) echo v ;; *) sleep 10 ;; esac",
            );
            let session = controller.upload("slow.pcap", b"capture", None).unwrap();

            let err = controller
                .analyze(&session.id, None, ExtractionOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ForensicError::Timeout { .. }));
            assert!(err.is_retryable());
            assert_eq!(controller.dispatch_stats().active, 0);
        }
    }
}
