//! Exclusive locks: a local `O_EXCL` lock file (secrets store) and a remote
//! `mkdir` marker (release pointer). Both are released on drop.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::ssh::{self, RemoteExecutor};
use crate::utils::shell::{join_remote, quote_path};

/// `pid <n> since <rfc3339>`, written into every lock so a stale one can be traced.
pub fn holder_info() -> String {
    format!(
        "pid {} since {}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

#[derive(Debug)]
pub struct LocalLock {
    path: PathBuf,
}

impl LocalLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("create {}", parent.display())))
            })?;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(holder_info().as_bytes()).map_err(|e| {
                    Error::internal_io(e.to_string(), Some(format!("write {}", path.display())))
                })?;
                tracing::debug!(lock = %path.display(), "acquired local lock");
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                Err(Error::lock_held(path.display().to_string(), holder.trim()).with_hint(format!(
                    "If the holder is gone, remove the stale lock with: rm -f {}",
                    quote_path(&path.display().to_string())
                )))
            }
            Err(e) => Err(Error::internal_io(
                e.to_string(),
                Some(format!("create {}", path.display())),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// In-progress marker directory on a host. `mkdir` is atomic, so at most
/// one run can hold it.
pub struct RemoteLock<'a> {
    executor: &'a dyn RemoteExecutor,
    host: Host,
    marker: String,
    released: bool,
}

impl<'a> RemoteLock<'a> {
    pub fn acquire(executor: &'a dyn RemoteExecutor, host: &Host, marker: &str) -> Result<Self> {
        let m = quote_path(marker);
        let owner = quote_path(&join_remote(marker, "owner"));
        let parent = marker
            .rsplit_once('/')
            .map(|(p, _)| p)
            .filter(|p| !p.is_empty())
            .unwrap_or("/");

        let acquired = ssh::test(
            executor,
            host,
            &format!(
                "mkdir -p {} && mkdir {} 2>/dev/null && printf '%s\\n' {} > {}",
                quote_path(parent),
                m,
                quote_path(&holder_info()),
                owner
            ),
        )?;

        if !acquired {
            let holder = ssh::run(executor, host, &format!("cat {} 2>/dev/null || true", owner))
                .map(|out| out.stdout.trim().to_string())
                .unwrap_or_default();
            return Err(Error::lock_held(format!("{}:{}", host.id, marker), holder)
                .with_detail("marker", serde_json::json!(marker))
                .with_hint(format!(
                    "If no run is active, remove the stale marker on {} with: rm -rf {}",
                    host.id, m
                )));
        }

        tracing::debug!(host = %host.id, marker, "acquired remote lock");
        Ok(Self {
            executor,
            host: host.clone(),
            marker: marker.to_string(),
            released: false,
        })
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> Result<()> {
        ssh::run(
            self.executor,
            &self.host,
            &format!("rm -rf {}", quote_path(&self.marker)),
        )
        .map(|_| ())
    }
}

impl Drop for RemoteLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove() {
            tracing::warn!(host = %self.host.id, marker = %self.marker, error = %e, "failed to release remote lock");
            log_status!(
                "lock",
                "Could not remove {} on {}; remove it by hand once no run is active",
                self.marker,
                self.host.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SshExecutor;
    use crate::testing::local_host;
    use tempfile::tempdir;

    #[test]
    fn local_lock_is_exclusive_until_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets.lock");

        let lock = LocalLock::acquire(&path).unwrap();
        let err = LocalLock::acquire(&path).unwrap_err();
        assert_eq!(err.code.as_str(), "lock.held");
        assert!(err.details["holder"].as_str().unwrap().starts_with("pid "));
        assert!(err.hints.iter().any(|h| h.message.contains("rm -f")
            && h.message.contains(&*path.to_string_lossy())));

        drop(lock);
        assert!(!path.exists());
        assert!(LocalLock::acquire(&path).is_ok());
    }

    #[test]
    fn remote_lock_uses_marker_directory() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join(".keel/deploy.lock");
        let marker = marker.to_string_lossy().to_string();
        let exec = SshExecutor::new(5);
        let host = local_host("app");

        let lock = RemoteLock::acquire(&exec, &host, &marker).unwrap();
        assert!(Path::new(&marker).join("owner").exists());

        let err = RemoteLock::acquire(&exec, &host, &marker).err().unwrap();
        assert_eq!(err.code.as_str(), "lock.held");
        assert_eq!(err.details["marker"], marker.as_str());
        assert!(err.hints.iter().any(|h| h.message.contains(&format!("rm -rf {}", quote_path(&marker)))));

        lock.release().unwrap();
        assert!(!Path::new(&marker).exists());

        {
            let _held = RemoteLock::acquire(&exec, &host, &marker).unwrap();
        }
        assert!(!Path::new(&marker).exists());
    }
}
