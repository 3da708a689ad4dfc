//! Topology registry and scheduler.
//!
//! A topology collects nodes while `Built`, validates every global invariant
//! in one pass, then drives bringup in dependency order: switches first so
//! bridges exist before peers are enslaved, then routers (namespace,
//! interfaces, routes, daemon). Any failure stops forward progress, drains
//! the cleanup stack and leaves the topology `Destroyed`; a topology is
//! single-use and never re-enters `Built`.

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use crate::daemon::{BirdDaemon, Daemon, ExaBgpDaemon, StayRtrDaemon};
use crate::exec::Executor;
use crate::netns::NetnsManager;
use crate::node::{GenericNode, Node, RouterNode, SwitchNode};
pub use crate::node::{RouteVia, StaticRoute};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Built,
    Running,
    Destroyed,
}

/// What runs inside a router node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterKind {
    Plain,
    Bird,
    ExaBgp,
    StayRtr,
}

impl std::str::FromStr for RouterKind {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "plain" => Ok(RouterKind::Plain),
            "bird" => Ok(RouterKind::Bird),
            "exabgp" => Ok(RouterKind::ExaBgp),
            "stayrtr" => Ok(RouterKind::StayRtr),
            other => Err(Error::invariant(format!(
                "unsupported router kind '{other}' (expected plain, bird, exabgp or stayrtr)"
            ))),
        }
    }
}

/// The high-level simulation: a name-keyed registry of nodes plus the
/// executor and cleanup stack that own their kernel objects while running.
pub struct Topology {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    state: TopologyState,
    exec: Option<Executor>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            state: TopologyState::Built,
            exec: None,
        }
    }

    pub fn state(&self) -> TopologyState {
        self.state
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    /// Register a node. Fails on duplicate names and once the topology has
    /// left `Built`.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        self.ensure_built("add a node")?;

        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            return Err(Error::NameCollision {
                object: format!("node '{name}'"),
            });
        }

        info!(node = %name, kind = node.kind_name(), "adding node");
        self.order.push(name.clone());
        self.nodes.insert(name, node);
        Ok(())
    }

    pub fn add_generic(&mut self, name: &str) -> Result<()> {
        self.add_node(Node::Generic(GenericNode::new(name)?))
    }

    pub fn add_switch(&mut self, name: &str) -> Result<()> {
        self.add_node(Node::Switch(SwitchNode::new(name)?))
    }

    /// Register a router. Daemon-bearing kinds require a configuration file
    /// (for StayRTR it is the cache, and may be omitted).
    pub fn add_router(&mut self, name: &str, kind: RouterKind, config: Option<&Path>) -> Result<()> {
        let daemon = match kind {
            RouterKind::Plain => None,
            RouterKind::Bird => {
                let config = config.ok_or_else(|| {
                    Error::invariant(format!("BIRD router '{name}' requires a config file"))
                })?;
                Some(Daemon::Bird(BirdDaemon::new(name, config)?))
            }
            RouterKind::ExaBgp => {
                let config = config.ok_or_else(|| {
                    Error::invariant(format!("ExaBGP router '{name}' requires a config file"))
                })?;
                Some(Daemon::ExaBgp(ExaBgpDaemon::new(name, config)?))
            }
            RouterKind::StayRtr => Some(Daemon::StayRtr(StayRtrDaemon::new(name, config, None)?)),
        };
        self.add_node(Node::Router(RouterNode::new(name, daemon)?))
    }

    pub fn add_interface(
        &mut self,
        router: &str,
        iface: &str,
        mac: Option<&str>,
        switch: Option<&str>,
    ) -> Result<()> {
        self.ensure_built("add an interface")?;
        self.router_mut(router)?.add_interface(iface, mac, switch)
    }

    pub fn add_address(
        &mut self,
        router: &str,
        iface: &str,
        address: &str,
        prefix_len: u8,
    ) -> Result<()> {
        self.ensure_built("add an address")?;
        let router_node = self.router_mut(router)?;
        router_node
            .interface_mut(iface)
            .ok_or_else(|| Error::NotFound {
                object: format!("interface '{iface}' on router '{router}'"),
            })?
            .add_address(address, prefix_len)
    }

    pub fn add_route(&mut self, router: &str, destination: &str, via: &str) -> Result<()> {
        self.ensure_built("add a route")?;
        self.router_mut(router)?.add_route(destination, via)
    }

    /// Bring the whole simulation up. Atomic from the caller's view: on
    /// success every node is live, on failure the cleanup stack is drained
    /// and no minted kernel object remains. Either way the topology can
    /// never be run again.
    pub async fn run(&mut self) -> Result<()> {
        self.ensure_built("run")?;
        info!(nodes = self.order.len(), "bringing topology up");

        match self.bringup().await {
            Ok(()) => {
                self.state = TopologyState::Running;
                info!("topology running");
                Ok(())
            }
            Err(err) => {
                warn!(%err, "bringup failed, unwinding");
                if let Some(exec) = self.exec.as_mut() {
                    exec.unwind().await;
                }
                self.state = TopologyState::Destroyed;
                Err(err)
            }
        }
    }

    async fn bringup(&mut self) -> Result<()> {
        self.validate()?;

        let mut exec = Executor::new().await?;
        if let Err(err) = self.probe_host_collisions(&exec).await {
            self.exec = Some(exec);
            return Err(err);
        }

        let bridges = self.bridge_map();
        let order = self.order.clone();
        let mut outcome = Ok(());

        for name in &order {
            if let Some(Node::Switch(switch)) = self.nodes.get(name) {
                outcome = switch.create(&mut exec).await;
                if outcome.is_err() {
                    break;
                }
            }
        }
        if outcome.is_ok() {
            for name in &order {
                if let Some(Node::Router(router)) = self.nodes.get_mut(name) {
                    outcome = router.create(&mut exec, &bridges).await;
                    if outcome.is_err() {
                        break;
                    }
                }
            }
        }

        self.exec = Some(exec);
        outcome
    }

    /// Tear the simulation down by draining the cleanup stack. Idempotent;
    /// repeated calls are no-ops.
    pub async fn destroy(&mut self) -> Result<()> {
        if let Some(exec) = self.exec.as_mut() {
            if exec.pending_cleanups() > 0 {
                info!("destroying topology");
                exec.unwind().await;
            }
        }
        self.state = TopologyState::Destroyed;
        Ok(())
    }

    /// Route an opaque request to a node's daemon and return the raw
    /// response. No topology state changes, whatever the outcome.
    pub async fn query(&self, node: &str, request: &[u8]) -> Result<Vec<u8>> {
        if self.state != TopologyState::Running {
            return Err(Error::InvalidState {
                operation: "query",
                state: self.state,
            });
        }
        let exec = self.exec.as_ref().ok_or(Error::InvalidState {
            operation: "query",
            state: self.state,
        })?;

        match self.nodes.get(node) {
            None => Err(Error::NotFound {
                object: format!("node '{node}'"),
            }),
            Some(Node::Router(router)) => router.query(exec, request).await,
            Some(_) => Err(Error::Unsupported {
                node: node.to_string(),
                operation: "query",
            }),
        }
    }

    /// One validation pass over every global invariant, batching all
    /// violations so a single fix cycle suffices.
    fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();
        let mut peer_owners: HashMap<&str, String> = HashMap::new();

        for name in &self.order {
            let Some(Node::Router(router)) = self.nodes.get(name) else {
                continue;
            };

            for iface in router.interfaces() {
                if let Some(switch) = iface.switch() {
                    match self.nodes.get(switch) {
                        Some(Node::Switch(_)) => {}
                        Some(_) => violations.push(format!(
                            "interface '{}' on router '{name}' references '{switch}', which is not a switch",
                            iface.name()
                        )),
                        None => violations.push(format!(
                            "interface '{}' on router '{name}' references unknown switch '{switch}'",
                            iface.name()
                        )),
                    }
                }

                let owner = format!("{name}/{}", iface.name());
                if let Some(previous) = peer_owners.insert(iface.peer_name(), owner.clone()) {
                    violations.push(format!(
                        "host-side name '{}' of {owner} collides with {previous}",
                        iface.peer_name()
                    ));
                }
            }

            for route in router.routes() {
                if let RouteVia::Device(device) = &route.via {
                    if router.interface(device).is_none() {
                        violations.push(format!(
                            "route {} on router '{name}' references interface '{device}', which does not exist",
                            route.destination
                        ));
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::InvariantViolation { violations })
        }
    }

    /// Read-only probe: none of the names we are about to mint may already
    /// exist on the host. Runs before any mutation.
    async fn probe_host_collisions(&self, exec: &Executor) -> Result<()> {
        for name in &self.order {
            match &self.nodes[name] {
                Node::Generic(_) => {}
                Node::Switch(switch) => {
                    if exec.link_exists(switch.bridge()).await? {
                        return Err(Error::NameCollision {
                            object: format!("bridge '{}'", switch.bridge()),
                        });
                    }
                }
                Node::Router(router) => {
                    if NetnsManager::exists(router.netns()) {
                        return Err(Error::NameCollision {
                            object: format!("network namespace '{}'", router.netns()),
                        });
                    }
                    for iface in router.interfaces() {
                        if exec.link_exists(iface.peer_name()).await? {
                            return Err(Error::NameCollision {
                                object: format!("link '{}'", iface.peer_name()),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Switch node name to bridge device name, for interface bringup.
    fn bridge_map(&self) -> HashMap<String, String> {
        self.nodes
            .values()
            .filter_map(|node| match node {
                Node::Switch(switch) => {
                    Some((switch.name().to_string(), switch.bridge().to_string()))
                }
                _ => None,
            })
            .collect()
    }

    fn ensure_built(&self, operation: &'static str) -> Result<()> {
        match self.state {
            TopologyState::Built => Ok(()),
            state => Err(Error::InvalidState { operation, state }),
        }
    }

    fn router_mut(&mut self, name: &str) -> Result<&mut RouterNode> {
        match self.nodes.get_mut(name) {
            None => Err(Error::NotFound {
                object: format!("node '{name}'"),
            }),
            Some(Node::Router(router)) => Ok(router),
            Some(_) => Err(Error::Unsupported {
                node: name.to_string(),
                operation: "configure router settings",
            }),
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if let Some(exec) = &self.exec {
            if exec.pending_cleanups() > 0 {
                warn!(
                    pending = exec.pending_cleanups(),
                    "topology dropped without destroy, kernel objects may remain"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_routers_on_a_switch() -> Topology {
        let mut topology = Topology::new();
        topology.add_switch("s1").unwrap();
        topology.add_router("r1", RouterKind::Plain, None).unwrap();
        topology.add_router("r2", RouterKind::Plain, None).unwrap();
        topology
            .add_interface("r1", "eth0", None, Some("s1"))
            .unwrap();
        topology
            .add_interface("r2", "eth0", None, Some("s1"))
            .unwrap();
        topology.add_address("r1", "eth0", "10.0.0.1", 24).unwrap();
        topology.add_address("r2", "eth0", "10.0.0.2", 24).unwrap();
        topology
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let mut topology = Topology::new();
        topology.add_router("r1", RouterKind::Plain, None).unwrap();
        assert!(matches!(
            topology.add_switch("r1"),
            Err(Error::NameCollision { .. })
        ));
    }

    #[test]
    fn interfaces_require_an_existing_router() {
        let mut topology = Topology::new();
        topology.add_switch("s1").unwrap();

        assert!(matches!(
            topology.add_interface("r1", "eth0", None, None),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            topology.add_interface("s1", "eth0", None, None),
            Err(Error::Unsupported { .. })
        ));
    }

    #[test]
    fn validation_batches_all_violations() {
        let mut topology = Topology::new();
        topology.add_router("r1", RouterKind::Plain, None).unwrap();
        topology
            .add_interface("r1", "eth0", None, Some("missing-switch"))
            .unwrap();
        topology.add_route("r1", "10.1.0.0/16", "eth9").unwrap();

        let err = topology.validate().unwrap_err();
        let Error::InvariantViolation { violations } = err else {
            panic!("expected InvariantViolation");
        };
        assert_eq!(violations.len(), 2);
        assert!(violations[0].contains("missing-switch"));
        assert!(violations[1].contains("eth9"));
    }

    #[test]
    fn switch_membership_requires_a_switch_node() {
        let mut topology = Topology::new();
        topology.add_router("r1", RouterKind::Plain, None).unwrap();
        topology.add_router("r2", RouterKind::Plain, None).unwrap();
        topology
            .add_interface("r1", "eth0", None, Some("r2"))
            .unwrap();

        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("not a switch"));
    }

    #[test]
    fn valid_topology_passes_validation() {
        let topology = two_routers_on_a_switch();
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn router_kind_parsing_names_the_offender() {
        assert_eq!("bird".parse::<RouterKind>().unwrap(), RouterKind::Bird);
        assert_eq!("plain".parse::<RouterKind>().unwrap(), RouterKind::Plain);

        let err = "frr".parse::<RouterKind>().unwrap_err();
        assert!(err.to_string().contains("frr"));
    }

    #[tokio::test]
    async fn query_requires_a_running_topology() {
        let topology = two_routers_on_a_switch();
        assert!(matches!(
            topology.query("r1", b"show status").await,
            Err(Error::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn destroyed_topologies_stay_destroyed() {
        let mut topology = Topology::new();
        topology.add_router("r1", RouterKind::Plain, None).unwrap();

        topology.destroy().await.unwrap();
        assert_eq!(topology.state(), TopologyState::Destroyed);

        // Destroy stays idempotent, mutation and re-run are refused.
        topology.destroy().await.unwrap();
        assert!(matches!(
            topology.add_switch("s1"),
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            topology.run().await,
            Err(Error::InvalidState { .. })
        ));
    }
}
