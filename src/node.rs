//! Topology node variants.
//!
//! Nodes share a small capability set (create, destroy via the cleanup
//! stack, optionally query) and are expressed as a tagged enum rather than a
//! hierarchy. Switches own a bridge, routers own a namespace with
//! interfaces, static routes and an optional daemon supervisor.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::daemon::Daemon;
use crate::exec::Executor;
use crate::iface::{clamp_name, valid_name, Interface};
use crate::{Error, Result};

#[derive(Debug)]
pub enum Node {
    Generic(GenericNode),
    Switch(SwitchNode),
    Router(RouterNode),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Generic(node) => &node.name,
            Node::Switch(node) => node.name(),
            Node::Router(node) => node.name(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Generic(_) => "generic",
            Node::Switch(_) => "switch",
            Node::Router(node) => match &node.daemon {
                None => "router",
                Some(daemon) => daemon.kind_name(),
            },
        }
    }
}

/// A registry participant with no kernel footprint.
#[derive(Debug)]
pub struct GenericNode {
    pub(crate) name: String,
}

impl GenericNode {
    pub fn new(name: &str) -> Result<Self> {
        check_node_name(name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }
}

/// A switch: one Linux bridge in the root namespace. Membership is recorded
/// on the interfaces that reference the switch by name, so the switch itself
/// stays free of back-references.
#[derive(Debug)]
pub struct SwitchNode {
    name: String,
    bridge: String,
}

impl SwitchNode {
    pub fn new(name: &str) -> Result<Self> {
        check_node_name(name)?;
        Ok(Self {
            name: name.to_string(),
            bridge: clamp_name(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the bridge device this switch mints.
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    pub(crate) async fn create(&self, exec: &mut Executor) -> Result<()> {
        info!(switch = %self.name, bridge = %self.bridge, "creating switch");
        exec.create_bridge(&self.bridge).await?;
        exec.set_link_up(None, &self.bridge).await
    }
}

/// A static route installed after the router's interfaces are addressed.
#[derive(Debug, Clone)]
pub struct StaticRoute {
    pub destination: IpNetwork,
    pub via: RouteVia,
}

/// Next hop of a static route: a gateway address or an egress device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteVia {
    Gateway(IpAddr),
    Device(String),
}

/// A router: one network namespace, an ordered set of interfaces, static
/// routes, and optionally a routing daemon supervised inside the namespace.
#[derive(Debug)]
pub struct RouterNode {
    name: String,
    netns: String,
    interfaces: Vec<Interface>,
    routes: Vec<StaticRoute>,
    pub(crate) daemon: Option<Daemon>,
}

impl RouterNode {
    pub fn new(name: &str, daemon: Option<Daemon>) -> Result<Self> {
        check_node_name(name)?;
        Ok(Self {
            name: name.to_string(),
            netns: clamp_name(name),
            interfaces: Vec::new(),
            routes: Vec::new(),
            daemon,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the network namespace this router mints.
    pub fn netns(&self) -> &str {
        &self.netns
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.iter().find(|iface| iface.name() == name)
    }

    pub(crate) fn interface_mut(&mut self, name: &str) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|iface| iface.name() == name)
    }

    pub fn routes(&self) -> &[StaticRoute] {
        &self.routes
    }

    pub fn add_interface(
        &mut self,
        name: &str,
        mac: Option<&str>,
        switch: Option<&str>,
    ) -> Result<()> {
        if self.interface(name).is_some() {
            return Err(Error::NameCollision {
                object: format!("interface '{name}' on router '{}'", self.name),
            });
        }
        self.interfaces
            .push(Interface::new(&self.name, name, mac, switch)?);
        Ok(())
    }

    /// Record a static route. `via` is a gateway address when it parses as
    /// one, otherwise the name of an egress interface (checked against the
    /// router's interfaces during validation).
    pub fn add_route(&mut self, destination: &str, via: &str) -> Result<()> {
        let destination: IpNetwork = destination.parse().map_err(|_| {
            Error::invariant(format!("'{destination}' is not a valid destination prefix"))
        })?;

        let via = match via.parse::<IpAddr>() {
            Ok(gateway) => {
                if gateway.is_ipv4() != destination.ip().is_ipv4() {
                    return Err(Error::invariant(format!(
                        "gateway '{gateway}' and destination '{destination}' disagree on address family"
                    )));
                }
                RouteVia::Gateway(gateway)
            }
            Err(_) => RouteVia::Device(via.to_string()),
        };

        self.routes.push(StaticRoute { destination, via });
        Ok(())
    }

    /// Bring the router up: namespace, loopback, forwarding, interfaces in
    /// insertion order, routes, then the daemon. `bridges` maps switch node
    /// names to their bridge devices.
    pub(crate) async fn create(
        &mut self,
        exec: &mut Executor,
        bridges: &HashMap<String, String>,
    ) -> Result<()> {
        info!(router = %self.name, netns = %self.netns, "creating router");

        exec.create_netns(&self.netns).await?;
        exec.set_link_up(Some(&self.netns), "lo").await?;
        exec.write_net_sysctl(Some(&self.netns), "ipv4/conf/all/forwarding", "1")?;
        exec.write_net_sysctl(Some(&self.netns), "ipv6/conf/all/forwarding", "1")?;

        for iface in &self.interfaces {
            let bridge = match iface.switch() {
                Some(switch) => Some(bridges.get(switch).map(String::as_str).ok_or_else(
                    || Error::NotFound {
                        object: format!("switch '{switch}'"),
                    },
                )?),
                None => None,
            };
            iface.bring_up(exec, &self.netns, bridge).await?;
        }

        for route in &self.routes {
            debug!(router = %self.name, destination = %route.destination, "adding static route");
            let (gateway, device) = match &route.via {
                RouteVia::Gateway(gateway) => (Some(*gateway), None),
                RouteVia::Device(device) => (None, Some(device.as_str())),
            };
            exec.add_route(&self.netns, route.destination, gateway, device)
                .await?;
        }

        if let Some(daemon) = &mut self.daemon {
            daemon.launch(exec, &self.name, &self.netns).await?;
        }

        Ok(())
    }

    pub(crate) async fn query(&self, exec: &Executor, request: &[u8]) -> Result<Vec<u8>> {
        match &self.daemon {
            Some(daemon) => daemon.query(exec, &self.name, &self.netns, request).await,
            None => Err(Error::Unsupported {
                node: self.name.clone(),
                operation: "query",
            }),
        }
    }
}

fn check_node_name(name: &str) -> Result<()> {
    if valid_name(name) {
        Ok(())
    } else {
        Err(Error::invariant(format!(
            "node name '{name}' must be 1 to 15 bytes of [A-Za-z0-9_-]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_names_honour_the_15_byte_limit() {
        assert!(RouterNode::new("abcdefghijklmno", None).is_ok());
        assert!(RouterNode::new("abcdefghijklmnop", None).is_err());
        assert!(SwitchNode::new("s1").is_ok());
        assert!(SwitchNode::new("s 1").is_err());
    }

    #[test]
    fn duplicate_interfaces_are_rejected() {
        let mut router = RouterNode::new("r1", None).unwrap();
        router.add_interface("eth0", None, None).unwrap();
        assert!(matches!(
            router.add_interface("eth0", None, None),
            Err(Error::NameCollision { .. })
        ));
    }

    #[test]
    fn routes_parse_gateway_or_device() {
        let mut router = RouterNode::new("r1", None).unwrap();

        router.add_route("10.1.0.0/16", "10.0.0.254").unwrap();
        router.add_route("10.2.0.0/16", "eth0").unwrap();
        assert_eq!(router.routes().len(), 2);
        assert_eq!(
            router.routes()[0].via,
            RouteVia::Gateway("10.0.0.254".parse().unwrap())
        );
        assert_eq!(router.routes()[1].via, RouteVia::Device("eth0".to_string()));

        assert!(router.add_route("not-a-prefix", "10.0.0.1").is_err());
        assert!(router.add_route("10.3.0.0/16", "fd00::1").is_err());
    }

    #[test]
    fn switch_mints_bridge_from_its_name() {
        let switch = SwitchNode::new("s1").unwrap();
        assert_eq!(switch.bridge(), "s1");
    }
}
