//! Kernel executor: the sole owner of side effects on the host.
//!
//! All link, bridge, address, route and namespace mutations flow through
//! [`Executor`], which serialises them over one rtnetlink connection and
//! registers a compensating [`CleanupAction`] for every successful mutation.
//! [`Executor::unwind`] drains the stack best-effort; individual
//! compensation failures are logged and never raised, so one stuck resource
//! cannot prevent cleanup of the rest.

use std::net::IpAddr;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use nix::sched::{setns, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rtnetlink::Handle;
use tracing::{debug, warn};

use crate::cleanup::{CleanupAction, CleanupStack};
use crate::netns::NetnsManager;
use crate::{Error, Result};

/// How long a terminated daemon gets to exit before SIGKILL.
pub const DAEMON_STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Executor {
    handle: Handle,
    netns: NetnsManager,
    cleanup: CleanupStack,
}

impl Executor {
    /// Open the root-namespace netlink connection.
    pub async fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|err| Error::external("failed to open netlink socket", err))?;
        tokio::spawn(connection);

        Ok(Self {
            handle,
            netns: NetnsManager::new(),
            cleanup: CleanupStack::new(),
        })
    }

    pub fn netns(&self) -> &NetnsManager {
        &self.netns
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanup.len()
    }

    /// Netlink handle whose socket is bound inside the given namespace.
    fn ns_handle(&self, ns: &str) -> Result<Handle> {
        let opened = self.netns.exec_inside(ns, rtnetlink::new_connection)?;
        let (connection, handle, _) = opened.map_err(|err| {
            Error::external(
                format!("failed to open netlink socket in namespace '{ns}'"),
                err,
            )
        })?;
        tokio::spawn(connection);
        Ok(handle)
    }

    async fn find_link(handle: &Handle, name: &str) -> Result<Option<u32>> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(Some(link.header.index)),
            Ok(None) => Ok(None),
            Err(err) => match Error::from_rtnetlink(err, "look up link", name) {
                Error::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
        Self::find_link(handle, name)
            .await?
            .ok_or_else(|| Error::NotFound {
                object: format!("link '{name}'"),
            })
    }

    /// Read-only probe for the pre-run collision check.
    pub async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(Self::find_link(&self.handle, name).await?.is_some())
    }

    pub async fn create_netns(&mut self, name: &str) -> Result<()> {
        self.netns.create(name).await?;
        self.cleanup.push(CleanupAction::DelNetns {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Create a veth pair, both ends in the root namespace. The host-side
    /// `peer` end is the one registered for cleanup; deleting it removes the
    /// pair wherever the other end has been moved to.
    pub async fn create_veth(&mut self, iface: &str, peer: &str) -> Result<()> {
        debug!(iface, peer, "creating veth pair");
        self.handle
            .link()
            .add()
            .veth(iface.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(err, "create veth pair", peer))?;
        self.cleanup.push(CleanupAction::DelLink {
            name: peer.to_string(),
        });
        Ok(())
    }

    pub async fn create_bridge(&mut self, name: &str) -> Result<()> {
        debug!(name, "creating bridge");
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(err, "create bridge", name))?;
        self.cleanup.push(CleanupAction::DelBridge {
            name: name.to_string(),
        });
        Ok(())
    }

    pub async fn move_into_netns(&mut self, iface: &str, ns: &str) -> Result<()> {
        let index = Self::link_index(&self.handle, iface).await?;
        let fd = self.netns.fd(ns)?;
        self.handle
            .link()
            .set(index)
            .setns_by_fd(fd)
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(err, "move link into namespace", iface))
    }

    /// Enslave a root-namespace link to a bridge.
    pub async fn attach_to_bridge(&mut self, iface: &str, bridge: &str) -> Result<()> {
        let bridge_index = Self::link_index(&self.handle, bridge).await?;
        let iface_index = Self::link_index(&self.handle, iface).await?;
        self.handle
            .link()
            .set(iface_index)
            .master(bridge_index)
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(err, "attach link to bridge", iface))
    }

    /// Bring a link up, in the root namespace or inside `ns`.
    pub async fn set_link_up(&mut self, ns: Option<&str>, name: &str) -> Result<()> {
        let handle = match ns {
            Some(ns) => self.ns_handle(ns)?,
            None => self.handle.clone(),
        };
        let index = Self::link_index(&handle, name).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(err, "bring up link", name))
    }

    pub async fn set_mac(&mut self, ns: &str, name: &str, mac: [u8; 6]) -> Result<()> {
        let handle = self.ns_handle(ns)?;
        let index = Self::link_index(&handle, name).await?;
        handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(|err| Error::from_rtnetlink(err, "set MAC address on", name))
    }

    pub async fn add_address(&mut self, ns: &str, name: &str, address: IpNetwork) -> Result<()> {
        let handle = self.ns_handle(ns)?;
        let index = Self::link_index(&handle, name).await?;
        handle
            .address()
            .add(index, address.ip(), address.prefix())
            .execute()
            .await
            .map_err(|err| {
                Error::from_rtnetlink(err, "add address", &format!("{address} on {name}"))
            })
    }

    /// Install a static route inside a namespace. The kernel's refusal of an
    /// unreachable next-hop is surfaced as-is.
    pub async fn add_route(
        &mut self,
        ns: &str,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
        device: Option<&str>,
    ) -> Result<()> {
        let handle = self.ns_handle(ns)?;
        let device_index = match device {
            Some(device) => Some(Self::link_index(&handle, device).await?),
            None => None,
        };

        let object = format!("route {destination} in {ns}");
        match destination {
            IpNetwork::V4(net) => {
                let mut request = handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.ip(), net.prefix());
                if let Some(IpAddr::V4(gw)) = gateway {
                    request = request.gateway(gw);
                }
                if let Some(index) = device_index {
                    request = request.output_interface(index);
                }
                request
                    .execute()
                    .await
                    .map_err(|err| Error::from_rtnetlink(err, "add route", &object))
            }
            IpNetwork::V6(net) => {
                let mut request = handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.ip(), net.prefix());
                if let Some(IpAddr::V6(gw)) = gateway {
                    request = request.gateway(gw);
                }
                if let Some(index) = device_index {
                    request = request.output_interface(index);
                }
                request
                    .execute()
                    .await
                    .map_err(|err| Error::from_rtnetlink(err, "add route", &object))
            }
        }
    }

    /// Write a `/proc/sys/net` key, in the root namespace or inside `ns`.
    /// Keys that do not exist are skipped, which keeps IPv6-less hosts
    /// working.
    pub fn write_net_sysctl(&self, ns: Option<&str>, key: &str, value: &str) -> Result<()> {
        let path = format!("/proc/sys/net/{key}");
        let write = {
            let path = path.clone();
            let value = value.to_string();
            move || {
                if !Path::new(&path).exists() {
                    debug!(%path, "sysctl key absent, skipping");
                    return Ok(());
                }
                std::fs::write(&path, value)
            }
        };

        let outcome = match ns {
            Some(ns) => self.netns.exec_inside(ns, write)?,
            None => write(),
        };
        outcome.map_err(|err| Error::from_io(err, "write sysctl", &path))
    }

    /// Create a per-node runtime directory; the whole tree is removed on
    /// teardown.
    pub fn make_run_dir(&mut self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .map_err(|err| Error::from_io(err, "create runtime directory", &path.to_string_lossy()))?;
        self.cleanup.push(CleanupAction::RemoveRunDir {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Spawn a long-lived daemon inside a namespace with stdout and stderr
    /// appended to `log_path`. Returns the child pid; termination is
    /// registered on the cleanup stack.
    pub fn spawn_in_netns(
        &mut self,
        node: &str,
        ns: &str,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
        log_path: &Path,
    ) -> Result<i32> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|err| Error::from_io(err, "open daemon log", &log_path.to_string_lossy()))?;
        let log_err = log
            .try_clone()
            .map_err(|err| Error::from_io(err, "open daemon log", &log_path.to_string_lossy()))?;
        let ns_file = self
            .netns
            .file(ns)?
            .try_clone()
            .map_err(|err| Error::from_io(err, "clone namespace descriptor", ns))?;

        let mut command = std::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        for (key, value) in envs {
            command.env(key, value);
        }
        // Executed in the child after fork, before exec: only async-signal
        // safe calls are allowed, and setns(2) qualifies.
        unsafe {
            command.pre_exec(move || {
                setns(&ns_file, CloneFlags::CLONE_NEWNET)
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }

        let child = command
            .spawn()
            .map_err(|err| Error::from_io(err, "spawn daemon", program))?;
        let pid = child.id() as i32;
        debug!(node, ns, program, pid, "spawned daemon");

        self.cleanup.push(CleanupAction::StopDaemon {
            node: node.to_string(),
            pid,
        });
        Ok(pid)
    }

    /// Run a short-lived command inside a namespace and collect its output.
    pub async fn run_in_netns(
        &self,
        ns: &str,
        program: &str,
        args: &[String],
        envs: &[(String, String)],
    ) -> Result<std::process::Output> {
        let ns_file = self
            .netns
            .file(ns)?
            .try_clone()
            .map_err(|err| Error::from_io(err, "clone namespace descriptor", ns))?;

        let mut command = tokio::process::Command::new(program);
        command.args(args).stdin(Stdio::null());
        for (key, value) in envs {
            command.env(key, value);
        }
        unsafe {
            command.pre_exec(move || {
                setns(&ns_file, CloneFlags::CLONE_NEWNET)
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }

        command
            .output()
            .await
            .map_err(|err| Error::from_io(err, "run command", program))
    }

    /// Drain the cleanup stack, newest action first. Failures are logged and
    /// swallowed; a missing target counts as already cleaned up.
    pub async fn unwind(&mut self) {
        while let Some(action) = self.cleanup.pop() {
            debug!(?action, "compensating");
            match self.compensate(&action).await {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(err) => warn!(?action, %err, "cleanup action failed"),
            }
        }
    }

    async fn compensate(&mut self, action: &CleanupAction) -> Result<()> {
        match action {
            CleanupAction::DelLink { name } | CleanupAction::DelBridge { name } => {
                match Self::find_link(&self.handle, name).await? {
                    Some(index) => self
                        .handle
                        .link()
                        .del(index)
                        .execute()
                        .await
                        .map_err(|err| Error::from_rtnetlink(err, "delete link", name)),
                    None => Ok(()),
                }
            }
            CleanupAction::DelNetns { name } => self.netns.delete(name).await,
            CleanupAction::StopDaemon { pid, .. } => {
                stop_process(*pid, DAEMON_STOP_GRACE).await;
                Ok(())
            }
            CleanupAction::RemoveRunDir { path } => match tokio::fs::remove_dir_all(path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(Error::from_io(
                    err,
                    "remove runtime directory",
                    &path.to_string_lossy(),
                )),
            },
        }
    }
}

/// SIGTERM a process, give it `grace` to exit, then SIGKILL and reap. A pid
/// that is already gone is success.
pub async fn stop_process(pid: i32, grace: Duration) {
    let pid = Pid::from_raw(pid);
    if kill(pid, Signal::SIGTERM).is_err() {
        return;
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if tokio::time::Instant::now() >= deadline {
                    warn!(pid = pid.as_raw(), "daemon ignored SIGTERM, killing");
                    let _ = kill(pid, Signal::SIGKILL);
                    let _ = waitpid(pid, None);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            // Reaped, or not our child any more.
            _ => return,
        }
    }
}

/// Whether a process we spawned is still running (and not yet reaped).
pub fn process_alive(pid: i32) -> bool {
    matches!(
        waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::StillAlive)
    )
}
