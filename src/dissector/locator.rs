use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use super::process::run_tool;
use crate::error_handling::types::ForensicError;

/// Environment variable consulted when no dissector path is configured.
pub const TSHARK_ENV: &str = "TSHARK_PATH";

#[cfg(windows)]
const TSHARK_BINARY: &str = "tshark.exe";
#[cfg(not(windows))]
const TSHARK_BINARY: &str = "tshark";

#[cfg(target_os = "macos")]
const PLATFORM_LOCATIONS: &[&str] = &[
    "/Applications/Wireshark.app/Contents/MacOS/tshark",
    "/opt/homebrew/bin/tshark",
    "/usr/local/bin/tshark",
];
#[cfg(windows)]
const PLATFORM_LOCATIONS: &[&str] = &[
    r"C:\Program Files\Wireshark\tshark.exe",
    r"C:\Program Files (x86)\Wireshark\tshark.exe",
];
#[cfg(not(any(target_os = "macos", windows)))]
const PLATFORM_LOCATIONS: &[&str] = &["/usr/bin/tshark", "/usr/local/bin/tshark", "/usr/sbin/tshark"];

/// Finds the dissector binary: explicit path, then `TSHARK_PATH`, then `PATH`,
/// then the usual install locations for this platform.
pub fn resolve_tshark(explicit: Option<&Path>) -> Result<PathBuf, ForensicError> {
    if let Some(path) = explicit {
        return existing(path, "configured tshark_path");
    }
    if let Some(path) = std::env::var_os(TSHARK_ENV).filter(|v| !v.is_empty()) {
        return existing(Path::new(&path), TSHARK_ENV);
    }
    if let Some(found) = search_path(TSHARK_BINARY) {
        info!("Using tshark from PATH: {}", found.display());
        return Ok(found);
    }
    for candidate in PLATFORM_LOCATIONS {
        let candidate = Path::new(candidate);
        if candidate.is_file() {
            info!("Using tshark from {}", candidate.display());
            return Ok(candidate.to_path_buf());
        }
    }
    Err(ForensicError::Configuration(format!(
        "tshark not found on PATH. Install Wireshark/tshark or set {}.",
        TSHARK_ENV
    )))
}

fn existing(path: &Path, origin: &str) -> Result<PathBuf, ForensicError> {
    if path.is_file() {
        debug!("Using tshark from {}: {}", origin, path.display());
        Ok(path.to_path_buf())
    } else {
        Err(ForensicError::Configuration(format!(
            "{} points to {}, which is not a file",
            origin,
            path.display()
        )))
    }
}

fn search_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// First line of `tshark --version`, or `None` if it cannot be obtained.
pub async fn tshark_version(tshark: &Path) -> Option<String> {
    match run_tool(tshark, &["--version".to_string()], Duration::from_secs(10)).await {
        Ok(output) => output
            .stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty()),
        Err(e) => {
            warn!("Could not read tshark version: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn explicit_path_wins() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var(TSHARK_ENV, "/definitely/not/here");
        let resolved = resolve_tshark(Some(file.path())).unwrap();
        std::env::remove_var(TSHARK_ENV);
        assert_eq!(resolved, file.path());
    }

    #[test]
    #[serial]
    fn env_variable_is_used_without_explicit_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var(TSHARK_ENV, file.path());
        let resolved = resolve_tshark(None);
        std::env::remove_var(TSHARK_ENV);
        assert_eq!(resolved.unwrap(), file.path());
    }

    #[test]
    #[serial]
    fn missing_explicit_binary_is_a_configuration_error() {
        let err = resolve_tshark(Some(Path::new("/no/such/tshark"))).unwrap_err();
        assert!(matches!(err, ForensicError::Configuration(_)));
    }
}
