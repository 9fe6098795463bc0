use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use uuid::Uuid;

use super::session::{CaptureSession, SessionSidecar, SessionSource};
use crate::error_handling::types::ForensicError;

const SIDECAR_SUFFIX: &str = ".meta.json";
const FALLBACK_FILE_NAME: &str = "capture.pcapng";
/// Separates id and name of a file that is still being written.
const STAGING_INFIX: &str = ".partial-";

/// Maps opaque session ids to capture files stored under `base_path`.
///
/// Files are stored as `<id>-<name>`, so a registry created over an existing
/// directory hydrates sessions lazily on lookup instead of needing a database.
/// Ownership is stored in a `<id>.meta.json` sidecar.
///
/// Lookups scoped to an owner answer `NotFound` both for unknown ids and for
/// ids belonging to somebody else.
pub struct SessionRegistry {
    base_path: PathBuf,
    session_index: Mutex<HashMap<String, CaptureSession>>,
}

impl SessionRegistry {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, ForensicError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(|e| {
            error!(
                "Failed to create storage dir {}: {}",
                base_path.display(),
                e
            );
            ForensicError::IoError(e)
        })?;
        info!("SessionRegistry initialized at {}", base_path.display());
        Ok(Self {
            base_path,
            session_index: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Allocates a fresh id and the storage path a file with this name will live at.
    /// Nothing is registered until [`register_file`](Self::register_file) is called.
    pub fn reserve(&self, file_name: &str) -> (String, PathBuf) {
        let id = Uuid::new_v4().to_string();
        let path = self
            .base_path
            .join(format!("{}-{}", id, sanitize_file_name(file_name)));
        debug!("Reserved {} at {}", id, path.display());
        (id, path)
    }

    /// Where a file for a reserved id is written while it is incomplete.
    ///
    /// Staged files do not follow the `<id>-<name>` layout, so [`get`](Self::get)
    /// and [`list`](Self::list) ignore them until [`promote`](Self::promote).
    pub fn staging_path(&self, id: &str, file_name: &str) -> PathBuf {
        self.base_path
            .join(format!("{}{}{}", id, STAGING_INFIX, sanitize_file_name(file_name)))
    }

    /// Moves a finished staged file to its reserved path and registers it.
    pub fn promote(
        &self,
        id: &str,
        staged: &Path,
        reserved: &Path,
        owner: Option<&str>,
        source: SessionSource,
    ) -> Result<CaptureSession, ForensicError> {
        fs::rename(staged, reserved).map_err(|e| {
            error!(
                "[{}] Failed to move {} into place: {}",
                id,
                staged.display(),
                e
            );
            ForensicError::IoError(e)
        })?;
        self.register_file(id, reserved, owner, source)
    }

    /// Drops everything the registry remembers about `id`, leaving data files alone.
    pub fn forget(&self, id: &str) {
        if self.index().remove(id).is_some() {
            debug!("[{}] Forgotten", id);
        }
        if let Err(e) = fs::remove_file(self.sidecar_path(id)) {
            debug!("[{}] No sidecar to remove: {}", id, e);
        }
    }

    /// Stores uploaded bytes and registers them as a new session.
    pub fn register_upload(
        &self,
        file_name: &str,
        data: &[u8],
        owner: Option<&str>,
    ) -> Result<CaptureSession, ForensicError> {
        let (id, path) = self.reserve(file_name);
        fs::write(&path, data).map_err(|e| {
            error!("Failed to write upload {}: {}", path.display(), e);
            ForensicError::IoError(e)
        })?;
        self.register_file(&id, &path, owner, SessionSource::Upload)
    }

    /// Registers a file already written at a path obtained from [`reserve`](Self::reserve).
    pub fn register_file(
        &self,
        id: &str,
        path: &Path,
        owner: Option<&str>,
        source: SessionSource,
    ) -> Result<CaptureSession, ForensicError> {
        let file_name = stored_name(id, path).ok_or_else(|| {
            ForensicError::MalformedInput(format!(
                "{} does not follow the <id>-<name> layout",
                path.display()
            ))
        })?;
        let metadata = fs::metadata(path)?;
        let sidecar = SessionSidecar {
            owner: owner.map(str::to_string),
            source,
        };
        let sidecar_path = self.sidecar_path(id);
        let encoded = serde_json::to_vec(&sidecar)
            .map_err(|e| ForensicError::MalformedInput(e.to_string()))?;
        if let Err(e) = fs::write(&sidecar_path, encoded) {
            // The session stays usable in this process; only ownership across restarts is lost.
            warn!(
                "Failed to write sidecar {}: {}",
                sidecar_path.display(),
                e
            );
        }

        let session = CaptureSession {
            id: id.to_string(),
            file_name,
            file_path: path.to_path_buf(),
            size_bytes: metadata.len(),
            created_at: created_at(&metadata),
            owner: sidecar.owner,
            source,
        };
        self.index().insert(session.id.clone(), session.clone());
        info!(
            "[{}] Registered {} ({} bytes, {:?})",
            session.id, session.file_name, session.size_bytes, session.source
        );
        Ok(session)
    }

    /// Resolves `id`, hydrating from disk when it is not in memory.
    pub fn get(&self, id: &str, owner: Option<&str>) -> Result<CaptureSession, ForensicError> {
        let not_found = || ForensicError::NotFound(format!("session {}", id));
        if !is_valid_id(id) {
            return Err(not_found());
        }

        let cached = self.index().get(id).cloned();
        let session = match cached {
            Some(session) => session,
            None => {
                let hydrated = self.hydrate(id).ok_or_else(not_found)?;
                self.index().insert(id.to_string(), hydrated.clone());
                hydrated
            }
        };

        if !session.visible_to(owner) {
            debug!("[{}] Lookup rejected for another owner", id);
            return Err(not_found());
        }
        Ok(session)
    }

    /// All sessions on disk visible to `owner`, oldest first.
    pub fn list(&self, owner: Option<&str>) -> Result<Vec<CaptureSession>, ForensicError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            if let Some(id) = split_stored_name(&name).map(|(id, _)| id.to_string()) {
                ids.push(id);
            }
        }

        let mut sessions: Vec<CaptureSession> = ids
            .iter()
            .filter_map(|id| self.get(id, owner).ok())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        debug!("Listed {} session(s)", sessions.len());
        Ok(sessions)
    }

    fn hydrate(&self, id: &str) -> Option<CaptureSession> {
        let prefix = format!("{}-", id);
        let entries = match fs::read_dir(&self.base_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan {}: {}", self.base_path.display(), e);
                return None;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || name.ends_with(SIDECAR_SUFFIX) {
                continue;
            }
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let sidecar = self.read_sidecar(id);
            let session = CaptureSession {
                id: id.to_string(),
                file_name: name[prefix.len()..].to_string(),
                file_path: path,
                size_bytes: metadata.len(),
                created_at: created_at(&metadata),
                owner: sidecar.as_ref().and_then(|s| s.owner.clone()),
                source: sidecar.map(|s| s.source).unwrap_or(SessionSource::Upload),
            };
            info!("[{}] Hydrated {} from disk", id, session.file_name);
            return Some(session);
        }
        None
    }

    fn read_sidecar(&self, id: &str) -> Option<SessionSidecar> {
        let raw = fs::read(self.sidecar_path(id)).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                warn!("[{}] Ignoring unreadable sidecar: {}", id, e);
                None
            }
        }
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{}{}", id, SIDECAR_SUFFIX))
    }

    fn index(&self) -> MutexGuard<'_, HashMap<String, CaptureSession>> {
        self.session_index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps `[A-Za-z0-9._-]`, replaces everything else, and refuses hidden/empty names.
pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

fn is_valid_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

fn split_stored_name(name: &str) -> Option<(&str, &str)> {
    // Uuid text form is 36 characters, followed by '-' and the original name.
    if name.len() <= 37 || !name.is_char_boundary(36) || name.as_bytes()[36] != b'-' {
        return None;
    }
    let (id, rest) = name.split_at(36);
    if !is_valid_id(id) {
        return None;
    }
    Some((id, &rest[1..]))
}

fn stored_name(id: &str, path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    match split_stored_name(name) {
        Some((found, rest)) if found == id => Some(rest.to_string()),
        _ => None,
    }
}

fn created_at(metadata: &fs::Metadata) -> DateTime<Utc> {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, SessionRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = SessionRegistry::new(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn upload_is_stored_with_id_prefix() {
        let (_dir, registry) = registry();
        let session = registry
            .register_upload("trace.pcap", b"abcd", None)
            .unwrap();

        assert_eq!(session.file_name, "trace.pcap");
        assert_eq!(session.size_bytes, 4);
        assert_eq!(
            session.file_path.file_name().unwrap().to_string_lossy(),
            format!("{}-trace.pcap", session.id)
        );
        assert_eq!(registry.get(&session.id, None).unwrap(), session);
    }

    #[test]
    fn sessions_survive_a_restart() {
        let (dir, registry) = registry();
        let session = registry
            .register_upload("restart.pcapng", b"0123456789", Some("alice"))
            .unwrap();
        drop(registry);

        let reopened = SessionRegistry::new(dir.path()).unwrap();
        let hydrated = reopened.get(&session.id, Some("alice")).unwrap();
        assert_eq!(hydrated.file_name, "restart.pcapng");
        assert_eq!(hydrated.size_bytes, 10);
        assert_eq!(hydrated.owner.as_deref(), Some("alice"));
    }

    #[test]
    fn foreign_and_missing_sessions_look_the_same() {
        let (_dir, registry) = registry();
        let session = registry
            .register_upload("a.pcap", b"x", Some("alice"))
            .unwrap();

        let foreign = registry.get(&session.id, Some("bob")).unwrap_err();
        let missing = registry
            .get(&Uuid::new_v4().to_string(), Some("bob"))
            .unwrap_err();
        assert!(matches!(foreign, ForensicError::NotFound(_)));
        assert!(matches!(missing, ForensicError::NotFound(_)));
        assert!(registry.get(&session.id, None).is_ok());
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.get("../etc/passwd", None),
            Err(ForensicError::NotFound(_))
        ));
    }

    #[test]
    fn list_filters_by_owner() {
        let (_dir, registry) = registry();
        registry.register_upload("a.pcap", b"1", Some("alice")).unwrap();
        registry.register_upload("b.pcap", b"2", Some("bob")).unwrap();
        registry.register_upload("c.pcap", b"3", None).unwrap();

        assert_eq!(registry.list(None).unwrap().len(), 3);
        let alice = registry.list(Some("alice")).unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].file_name, "a.pcap");
    }

    #[test]
    fn reserved_path_registers_as_live_capture() {
        let (_dir, registry) = registry();
        let (id, path) = registry.reserve("live eth0.pcapng");
        std::fs::write(&path, b"data").unwrap();

        let session = registry
            .register_file(&id, &path, None, SessionSource::LiveCapture)
            .unwrap();
        assert_eq!(session.file_name, "live_eth0.pcapng");
        assert_eq!(session.source, SessionSource::LiveCapture);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(sanitize_file_name("../../evil.pcap"), "evil.pcap");
        assert_eq!(sanitize_file_name("a b;c.pcap"), "a_b_c.pcap");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
    }

    #[test]
    fn staged_file_stays_hidden_until_promoted() {
        let (_dir, registry) = registry();
        let (id, reserved) = registry.reserve("live.pcapng");
        let staged = registry.staging_path(&id, "live.pcapng");
        std::fs::write(&staged, b"partial").unwrap();

        assert!(matches!(registry.get(&id, None), Err(ForensicError::NotFound(_))));
        assert!(registry.list(None).unwrap().is_empty());

        let session = registry
            .promote(&id, &staged, &reserved, Some("alice"), SessionSource::LiveCapture)
            .unwrap();
        assert_eq!(session.file_path, reserved);
        assert!(!staged.exists());
        assert_eq!(registry.list(Some("alice")).unwrap().len(), 1);
    }

    #[test]
    fn forgotten_session_is_gone_from_memory() {
        let (_dir, registry) = registry();
        let session = registry.register_upload("a.pcap", b"x", Some("alice")).unwrap();
        registry.forget(&session.id);
        std::fs::remove_file(&session.file_path).unwrap();
        assert!(matches!(
            registry.get(&session.id, Some("alice")),
            Err(ForensicError::NotFound(_))
        ));
    }
}
