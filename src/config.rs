use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::DEFAULT_CONF_THRESHOLD;

/// Preferred writable location in container deployments.
pub const DEFAULT_DATA_DIR: &str = "/data";
const APP_DIR: &str = "plant-disease-api";
const FALLBACK_DIR: &str = "plant-disease-cache";

/// Settings the diagnosis service reads at request time.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cache_dir: PathBuf,
    pub model_path: PathBuf,
    pub default_conf: f32,
    pub max_upload_bytes: usize,
    /// Upper bound on downloading an image for `/predict/url`.
    pub fetch_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join(FALLBACK_DIR),
            model_path: PathBuf::from("best_model.onnx"),
            default_conf: DEFAULT_CONF_THRESHOLD,
            max_upload_bytes: 10 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Picks the cache directory once at startup.
///
/// Precedence: explicit path, then `/data` if writable, then the per-user
/// cache directory, then a directory under the system temp dir.
pub fn resolve_cache_dir(explicit: Option<&Path>) -> PathBuf {
    let defaults = [
        Some(PathBuf::from(DEFAULT_DATA_DIR)),
        dirs::cache_dir().map(|dir| dir.join(APP_DIR)),
    ];
    resolve_cache_dir_from(explicit, &defaults.into_iter().flatten().collect::<Vec<_>>())
}

pub(crate) fn resolve_cache_dir_from(explicit: Option<&Path>, defaults: &[PathBuf]) -> PathBuf {
    if let Some(dir) = explicit {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                info!(cache_dir = %dir.display(), "using configured cache directory");
                return dir.to_path_buf();
            }
            Err(e) => warn!(cache_dir = %dir.display(), error = %e, "configured cache directory unusable"),
        }
    }

    for dir in defaults {
        if is_writable_dir(dir) {
            info!(cache_dir = %dir.display(), "using cache directory");
            return dir.clone();
        }
    }

    let fallback = std::env::temp_dir().join(FALLBACK_DIR);
    if let Err(e) = fs::create_dir_all(&fallback) {
        warn!(cache_dir = %fallback.display(), error = %e, "could not create fallback cache directory");
    }
    warn!(cache_dir = %fallback.display(), "no writable default cache directory, using fallback");
    fallback
}

/// Creates `dir` if needed and probes it with a scratch file.
fn is_writable_dir(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".write-probe");
    let writable = fs::write(&probe, b"").is_ok();
    let _ = fs::remove_file(&probe);
    writable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_directory_wins() {
        let root = tempfile::tempdir().unwrap();
        let explicit = root.path().join("explicit");
        let default = root.path().join("default");

        let chosen = resolve_cache_dir_from(Some(&explicit), &[default.clone()]);
        assert_eq!(chosen, explicit);
        assert!(explicit.is_dir());
        assert!(!default.exists());
    }

    #[test]
    fn first_writable_default_is_used() {
        let root = tempfile::tempdir().unwrap();
        // A regular file cannot host a cache directory.
        let blocked = root.path().join("blocked");
        fs::write(&blocked, b"file").unwrap();
        let usable = root.path().join("usable");

        let chosen = resolve_cache_dir_from(None, &[blocked.join("sub"), usable.clone()]);
        assert_eq!(chosen, usable);
    }

    #[test]
    fn falls_back_to_temp_dir() {
        let root = tempfile::tempdir().unwrap();
        let blocked = root.path().join("blocked");
        fs::write(&blocked, b"file").unwrap();

        let chosen = resolve_cache_dir_from(None, &[blocked.join("sub")]);
        assert_eq!(chosen, std::env::temp_dir().join(FALLBACK_DIR));
    }

    #[test]
    fn unusable_explicit_directory_falls_through() {
        let root = tempfile::tempdir().unwrap();
        let blocked = root.path().join("blocked");
        fs::write(&blocked, b"file").unwrap();
        let usable = root.path().join("usable");

        let chosen = resolve_cache_dir_from(Some(&blocked.join("sub")), &[usable.clone()]);
        assert_eq!(chosen, usable);
    }
}
