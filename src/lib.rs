//! Network namespace based multi-router network simulator.
//!
//! This crate builds throwaway IP networks on a single Linux host out of
//! network namespaces, veth pairs and bridges, then launches real routing
//! daemons (BIRD, ExaBGP, StayRTR) inside the namespaces. A [`Topology`] is
//! assembled from declarative node/interface/address/route records, brought
//! up with [`Topology::run`], inspected through [`Topology::query`], and torn
//! down with [`Topology::destroy`].
//!
//! Every kernel mutation registers a compensating action on a per-topology
//! cleanup stack, so a failure anywhere during bringup unwinds to a clean
//! host.

pub mod cleanup;
pub mod daemon;
pub mod exec;
pub mod iface;
pub mod netns;
pub mod node;
pub mod topology;

pub use daemon::{Daemon, RuntimeDir};
pub use iface::Interface;
pub use node::{GenericNode, Node, RouterNode, SwitchNode};
pub use topology::{RouteVia, RouterKind, Topology, TopologyState};

use std::path::PathBuf;

use thiserror::Error;

/// Base directory for per-node runtime state (configs, sockets, logs, pids).
pub const RUN_BASE_DIR: &str = "/run/nsnetsim";

#[derive(Error, Debug)]
pub enum Error {
    /// Pre-run validation failed. All violations found in one pass are
    /// batched so a single fix cycle suffices.
    #[error("topology validation failed:\n  {}", .violations.join("\n  "))]
    InvariantViolation { violations: Vec<String> },

    #[error("'{object}' already exists on this host and is not ours")]
    NameCollision { object: String },

    #[error("'{object}' not found")]
    NotFound { object: String },

    #[error("not permitted to {operation} (CAP_NET_ADMIN and CAP_SYS_ADMIN required)")]
    NotPermitted { operation: String },

    #[error("{context}: {source}")]
    ExternalFailure {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("daemon on node '{node}' did not expose its control socket at '{}'", .socket.display())]
    DaemonUnready { node: String, socket: PathBuf },

    #[error("cannot {operation} while the topology is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TopologyState,
    },

    #[error("node '{node}' does not support {operation}")]
    Unsupported {
        node: String,
        operation: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Single-message convenience constructor for validation failures.
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation {
            violations: vec![message.into()],
        }
    }

    pub(crate) fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::ExternalFailure {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Classify an errno into the error taxonomy, if it maps onto one of the
    /// dedicated kinds. `operation` is a human-readable description used for
    /// permission errors, `object` the kernel object the operation targeted.
    pub(crate) fn classify_errno(errno: i32, operation: &str, object: &str) -> Option<Self> {
        use nix::libc;

        match errno {
            libc::EPERM | libc::EACCES => Some(Error::NotPermitted {
                operation: operation.to_string(),
            }),
            libc::EEXIST | libc::EADDRINUSE => Some(Error::NameCollision {
                object: object.to_string(),
            }),
            libc::ENOENT | libc::ENODEV | libc::ESRCH => Some(Error::NotFound {
                object: object.to_string(),
            }),
            _ => None,
        }
    }

    /// Classify a netlink failure into the error taxonomy.
    pub(crate) fn from_rtnetlink(err: rtnetlink::Error, operation: &str, object: &str) -> Self {
        if let rtnetlink::Error::NetlinkError(ref msg) = err {
            if let Some(classified) = Self::classify_errno(-msg.raw_code(), operation, object) {
                return classified;
            }
        }
        Error::external(format!("failed to {operation} '{object}'"), err)
    }

    /// Classify an I/O failure into the error taxonomy.
    pub(crate) fn from_io(err: std::io::Error, operation: &str, object: &str) -> Self {
        if let Some(errno) = err.raw_os_error() {
            if let Some(classified) = Self::classify_errno(errno, operation, object) {
                return classified;
            }
        }
        Error::external(format!("failed to {operation} '{object}'"), err)
    }
}
