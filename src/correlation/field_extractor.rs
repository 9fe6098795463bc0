use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use sha2::{Digest, Sha256};

use super::correlator::Correlator;
use super::rules::RULES_VERSION;
use super::types::{AnalysisArtifact, PcapMetadata, Tooling, SCHEMA_VERSION};
use crate::configuration::types::RuleThresholds;
use crate::dissector::field_reader::FieldReader;
use crate::dissector::process::StreamingTool;
use crate::error_handling::types::ForensicError;

/// Columns requested from the dissector, in output order.
pub const FIELDS: &[&str] = &[
    "frame.number",
    "frame.time_epoch",
    "frame.len",
    "ip.src",
    "ip.dst",
    "ipv6.src",
    "ipv6.dst",
    "tcp.srcport",
    "tcp.dstport",
    "udp.srcport",
    "udp.dstport",
    "tcp.len",
    "udp.length",
    "frame.protocols",
    "dns.qry.name",
    "http.request.method",
    "http.host",
    "http.request.uri",
    "tls.handshake.extensions_server_name",
];

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOptions {
    pub max_packets: Option<u64>,
    pub sample_frames_per_session: usize,
    pub include_sha256: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_packets: None,
            sample_frames_per_session: 8,
            include_sha256: true,
        }
    }
}

/// Runs the dissector over a capture file and correlates its rows into an
/// [`AnalysisArtifact`]. Deadlines are the caller's concern.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    tshark: PathBuf,
    tshark_version: Option<String>,
    thresholds: RuleThresholds,
}

impl FieldExtractor {
    pub fn new(tshark: PathBuf, tshark_version: Option<String>, thresholds: RuleThresholds) -> Self {
        Self {
            tshark,
            tshark_version,
            thresholds,
        }
    }

    pub fn extraction_args(pcap: &Path, max_packets: Option<u64>) -> Vec<String> {
        let mut args = vec!["-r".to_string(), pcap.to_string_lossy().into_owned()];
        args.extend(
            [
                "-n",
                "-T",
                "fields",
                "-E",
                "header=y",
                "-E",
                "separator=\t",
                "-E",
                "quote=d",
                "-E",
                "occurrence=f",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        if let Some(count) = max_packets {
            args.push("-c".to_string());
            args.push(count.to_string());
        }
        for field in FIELDS {
            args.push("-e".to_string());
            args.push(field.to_string());
        }
        args
    }

    pub async fn analyze(
        &self,
        pcap: &Path,
        options: &ExtractionOptions,
    ) -> Result<AnalysisArtifact, ForensicError> {
        let metadata = match tokio::fs::metadata(pcap).await {
            Ok(m) if m.is_file() => m,
            _ => {
                return Err(ForensicError::NotFound(format!(
                    "capture file {}",
                    pcap.display()
                )))
            }
        };
        let absolute = tokio::fs::canonicalize(pcap).await?;
        info!("Analyzing {}", absolute.display());

        let sha256 = if options.include_sha256 {
            Some(sha256_file(absolute.clone()).await?)
        } else {
            None
        };

        let args = Self::extraction_args(&absolute, options.max_packets);
        let mut tool = StreamingTool::spawn(&self.tshark, &args)?;
        let mut reader = FieldReader::default();
        let mut correlator = Correlator::new(options.sample_frames_per_session);
        while let Some(line) = tool.next_line().await? {
            if let Some(record) = reader.push_line(&line) {
                correlator.ingest_record(record);
            }
        }
        if let Some(record) = reader.finish() {
            correlator.ingest_record(record);
        }
        tool.finish().await?;

        let correlation = correlator.finish(&self.thresholds);
        debug!(
            "{}: {} session(s), {} timeline event(s)",
            absolute.display(),
            correlation.sessions.len(),
            correlation.timeline.len()
        );

        Ok(AnalysisArtifact {
            schema_version: SCHEMA_VERSION,
            generated_at: Utc::now(),
            rules_version: RULES_VERSION,
            pcap: PcapMetadata {
                path: absolute.display().to_string(),
                file_name: absolute
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size_bytes: metadata.len(),
                sha256,
                packets_analyzed: correlation.packets_analyzed,
                first_ts: correlation.first_ts,
                last_ts: correlation.last_ts,
            },
            tooling: Tooling {
                tshark_path: self.tshark.display().to_string(),
                tshark_version: self.tshark_version.clone(),
            },
            sessions: correlation.sessions,
            timeline: correlation.timeline,
        })
    }
}

/// Hex SHA-256 of a file, hashed off the async runtime.
pub async fn sha256_file(path: PathBuf) -> Result<String, ForensicError> {
    tokio::task::spawn_blocking(move || -> Result<String, ForensicError> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| ForensicError::process(None, &format!("hashing task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_request_every_field_once() {
        let args = FieldExtractor::extraction_args(Path::new("/tmp/x.pcap"), Some(100));
        assert_eq!(&args[..2], &["-r".to_string(), "/tmp/x.pcap".to_string()]);
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "100"));
        assert_eq!(args.iter().filter(|a| *a == "-e").count(), FIELDS.len());
        assert!(args.contains(&"separator=\t".to_string()));
    }

    #[tokio::test]
    async fn missing_capture_is_not_found() {
        let extractor = FieldExtractor::new(PathBuf::from("tshark"), None, RuleThresholds::default());
        let err = extractor
            .analyze(Path::new("/no/such/file.pcap"), &ExtractionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ForensicError::NotFound(_)));
    }

    #[tokio::test]
    async fn sha256_of_known_content() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"abc").unwrap();
        let digest = sha256_file(file.path().to_path_buf()).await.unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[cfg(unix)]
    mod with_fake_dissector {
        use super::*;
        use crate::dissector::fake_tool::write_script;

        const OUTPUT: &str = r#"printf '"frame.number"\t"frame.time_epoch"\t"frame.len"\t"ip.src"\t"ip.dst"\t"tcp.srcport"\t"tcp.dstport"\t"tcp.len"\t"frame.protocols"\t"http.request.method"\t"http.host"\t"http.request.uri"\n'
printf '"1"\t"10.0"\t"60"\t"10.0.0.1"\t"10.0.0.2"\t"5000"\t"80"\t"0"\t"eth:ethertype:ip:tcp"\t""\t""\t""\n'
printf '"2"\t"10.1"\t"60"\t"10.0.0.2"\t"10.0.0.1"\t"80"\t"5000"\t"0"\t"eth:ethertype:ip:tcp"\t""\t""\t""\n'
printf '"3"\t"10.2"\t"120"\t"10.0.0.1"\t"10.0.0.2"\t"5000"\t"80"\t"60"\t"eth:ethertype:ip:tcp:http"\t"GET"\t"example.com"\t"/"\n'"#;

        #[tokio::test]
        async fn artifact_from_dissector_output() {
            let dir = tempfile::tempdir().unwrap();
            let tshark = write_script(dir.path(), "tshark", OUTPUT);
            let pcap = dir.path().join("capture.pcap");
            std::fs::write(&pcap, b"not really a capture").unwrap();

            let extractor = FieldExtractor::new(
                tshark.clone(),
                Some("TShark (Wireshark) 4.2.0".into()),
                RuleThresholds::default(),
            );
            let artifact = extractor
                .analyze(&pcap, &ExtractionOptions::default())
                .await
                .unwrap();

            assert_eq!(artifact.schema_version, SCHEMA_VERSION);
            assert_eq!(artifact.pcap.packets_analyzed, 3);
            assert_eq!(artifact.pcap.file_name, "capture.pcap");
            assert_eq!(artifact.pcap.first_ts, Some(10.0));
            assert!(artifact.pcap.sha256.is_some());
            assert_eq!(artifact.sessions.len(), 1);
            assert_eq!(artifact.sessions[0].packet_count, 3);
            assert_eq!(artifact.sessions[0].observations.http_requests.len(), 1);
            assert!(artifact
                .timeline
                .iter()
                .any(|e| e.summary == "HTTP request: GET example.com/"));
            assert_eq!(artifact.tooling.tshark_path, tshark.display().to_string());
        }

        #[tokio::test]
        async fn empty_output_is_an_empty_artifact() {
            let dir = tempfile::tempdir().unwrap();
            let tshark = write_script(dir.path(), "tshark", "exit 0");
            let pcap = dir.path().join("empty.pcap");
            std::fs::write(&pcap, b"").unwrap();

            let extractor = FieldExtractor::new(tshark, None, RuleThresholds::default());
            let options = ExtractionOptions {
                include_sha256: false,
                ..Default::default()
            };
            let artifact = extractor.analyze(&pcap, &options).await.unwrap();
            assert!(artifact.sessions.is_empty());
            assert!(artifact.timeline.is_empty());
            assert_eq!(artifact.pcap.packets_analyzed, 0);
            assert_eq!(artifact.pcap.sha256, None);
        }

        #[tokio::test]
        async fn dissector_failure_is_a_process_error() {
            let dir = tempfile::tempdir().unwrap();
            let tshark = write_script(dir.path(), "tshark", "echo 'bad capture' >&2\nexit 2");
            let pcap = dir.path().join("bad.pcap");
            std::fs::write(&pcap, b"x").unwrap();

            let extractor = FieldExtractor::new(tshark, None, RuleThresholds::default());
            let err = extractor
                .analyze(&pcap, &ExtractionOptions::default())
                .await
                .unwrap_err();
            match err {
                ForensicError::Process { status, diagnostic } => {
                    assert_eq!(status, Some(2));
                    assert!(diagnostic.contains("bad capture"));
                }
                other => panic!("unexpected error: {}", other),
            }
        }
    }
}
