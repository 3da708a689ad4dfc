//! Network namespace management.
//!
//! Namespaces are created under the `/run/netns/<name>` convention so that
//! standard tooling (`ip netns exec`, daemons' own introspection) sees them.
//! The manager keeps an open file descriptor per namespace for `setns` based
//! entry and for moving links with `setns_by_fd`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::mount::{umount2, MntFlags};
use nix::sched::{setns, CloneFlags};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Directory the kernel-visible namespace files live in.
pub const NETNS_DIR: &str = "/run/netns";

/// Tracks the namespaces this process has created.
#[derive(Debug, Default)]
pub struct NetnsManager {
    namespaces: HashMap<String, File>,
}

impl NetnsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filesystem path of a named namespace.
    pub fn path(name: &str) -> PathBuf {
        Path::new(NETNS_DIR).join(name)
    }

    /// Whether a namespace file with this name exists on the host, whoever
    /// created it.
    pub fn exists(name: &str) -> bool {
        Self::path(name).exists()
    }

    /// Create a named network namespace and retain a descriptor to it.
    pub async fn create(&mut self, name: &str) -> Result<()> {
        debug!(name, "creating network namespace");

        rtnetlink::NetworkNamespace::add(name.to_string())
            .await
            .map_err(|err| match err {
                rtnetlink::Error::NamespaceError(ref msg)
                    if msg.contains("ermission") || msg.contains("not permitted") =>
                {
                    Error::NotPermitted {
                        operation: format!("create network namespace '{name}'"),
                    }
                }
                other => Error::from_rtnetlink(other, "create network namespace", name),
            })?;

        let file = match OpenOptions::new().read(true).open(Self::path(name)) {
            Ok(file) => file,
            // Nobody holds a descriptor yet, so take the namespace back out
            // before reporting the failure.
            Err(err) => {
                let _ = self.delete(name).await;
                return Err(Error::from_io(err, "open network namespace", name));
            }
        };
        self.namespaces.insert(name.to_string(), file);

        Ok(())
    }

    /// Delete a named network namespace. A namespace that is already gone
    /// counts as success so teardown stays idempotent.
    pub async fn delete(&mut self, name: &str) -> Result<()> {
        self.namespaces.remove(name);

        let ns_path = Self::path(name);
        if !ns_path.exists() {
            return Ok(());
        }

        debug!(name, "deleting network namespace");

        // Lazy unmount avoids EBUSY while daemons inside are still dying.
        if let Err(err) = umount2(&ns_path, MntFlags::MNT_DETACH) {
            if err != nix::errno::Errno::EINVAL && err != nix::errno::Errno::ENOENT {
                warn!(name, %err, "failed to unmount namespace");
            }
        }

        match tokio::fs::remove_file(&ns_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::from_io(err, "remove network namespace", name)),
        }
    }

    /// Raw descriptor for `setns_by_fd` style link moves.
    pub fn fd(&self, name: &str) -> Result<RawFd> {
        self.file(name).map(|file| file.as_raw_fd())
    }

    pub fn file(&self, name: &str) -> Result<&File> {
        self.namespaces.get(name).ok_or_else(|| Error::NotFound {
            object: format!("network namespace '{name}'"),
        })
    }

    /// Switch the calling thread into a namespace; the returned guard
    /// restores the original namespace on drop.
    pub fn enter(&self, name: &str) -> Result<NamespaceGuard> {
        let target = self.file(name)?;

        let original = OpenOptions::new()
            .read(true)
            .open("/proc/self/ns/net")
            .map_err(|err| Error::from_io(err, "open current namespace", "/proc/self/ns/net"))?;

        setns(target, CloneFlags::CLONE_NEWNET).map_err(|err| {
            Error::classify_errno(err as i32, "enter network namespace", name).unwrap_or_else(
                || Error::external(format!("failed to enter network namespace '{name}'"), err),
            )
        })?;

        Ok(NamespaceGuard {
            original,
            name: name.to_string(),
        })
    }

    /// Run a closure with the calling thread switched into a namespace.
    ///
    /// The closure must not await; use it for brief synchronous work such as
    /// `/proc/sys/net` writes or opening sockets bound to the namespace.
    pub fn exec_inside<F, T>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let _guard = self.enter(name)?;
        Ok(f())
    }
}

/// RAII guard restoring the thread's original network namespace.
pub struct NamespaceGuard {
    original: File,
    name: String,
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(err) = setns(&self.original, CloneFlags::CLONE_NEWNET) {
            warn!(name = %self.name, %err, "failed to restore original namespace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_paths_follow_run_netns_convention() {
        assert_eq!(
            NetnsManager::path("r1"),
            PathBuf::from("/run/netns").join("r1")
        );
    }

    #[test]
    fn unknown_namespace_lookup_fails() {
        let manager = NetnsManager::new();
        assert!(matches!(
            manager.fd("missing"),
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn create_and_delete_namespace() -> Result<()> {
        let mut manager = NetnsManager::new();

        manager.create("nsnetsim-t0").await?;
        assert!(NetnsManager::exists("nsnetsim-t0"));
        assert!(manager.fd("nsnetsim-t0").is_ok());

        manager.delete("nsnetsim-t0").await?;
        assert!(!NetnsManager::exists("nsnetsim-t0"));

        // Second delete is a no-op.
        manager.delete("nsnetsim-t0").await?;
        Ok(())
    }
}
