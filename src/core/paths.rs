use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base keel state directory (~/.config/keel/, or $KEEL_HOME when set)
pub fn keel() -> Result<PathBuf> {
    if let Ok(home) = env::var("KEEL_HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }

    #[cfg(windows)]
    {
        let appdata = env::var("APPDATA").map_err(|_| {
            Error::internal_unexpected(
                "APPDATA environment variable not set on Windows".to_string(),
            )
        })?;
        Ok(PathBuf::from(appdata).join("keel"))
    }

    #[cfg(not(windows))]
    {
        let home = env::var("HOME").map_err(|_| {
            Error::internal_unexpected(
                "HOME environment variable not set on Unix-like system".to_string(),
            )
        })?;
        Ok(PathBuf::from(home).join(".config").join("keel"))
    }
}

/// Per-topology state directory
pub fn state(topology: &str) -> Result<PathBuf> {
    Ok(keel()?.join(topology))
}

/// Default secrets file for a topology
pub fn secrets(topology: &str) -> Result<PathBuf> {
    Ok(state(topology)?.join("secrets.env"))
}

/// Secrets backups directory
pub fn backups(topology: &str) -> Result<PathBuf> {
    Ok(state(topology)?.join("backups"))
}

/// Default topology file in the working directory
pub fn default_config() -> PathBuf {
    PathBuf::from("keel.json")
}

/// Expand `~` in user-supplied paths
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
