//! Interface and link model.
//!
//! A router interface is one half of a veth pair: the inside end keeps the
//! caller-supplied name, the host-side peer gets a deterministic
//! `<router>-<iface>` name reduced to the kernel's 15-byte limit. Addresses
//! and the MAC are parsed at insertion so bringup never sees ill-formed
//! values.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ipnetwork::IpNetwork;
use tracing::debug;

use crate::exec::Executor;
use crate::{Error, Result};

/// Kernel limit on interface (and here, node) names.
pub const MAX_NAME_LEN: usize = 15;

/// Node and interface names: 1 to 15 bytes of `[A-Za-z0-9_-]`.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Reduce a minted name to 15 bytes. Short names pass through untouched;
/// long ones keep a recognisable prefix plus a stable hash suffix. Input is
/// ASCII because it is built from validated names.
pub fn clamp_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    format!("{}-{:05x}", &name[..9], hasher.finish() & 0xf_ffff)
}

/// Host-side name for a router interface's veth peer.
pub fn mint_peer_name(router: &str, iface: &str) -> String {
    clamp_name(&format!("{router}-{iface}"))
}

pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::invariant(format!(
            "MAC address '{text}' must have six colon-separated octets"
        )));
    }
    for (octet, part) in mac.iter_mut().zip(&parts) {
        *octet = u8::from_str_radix(part, 16).map_err(|_| {
            Error::invariant(format!("MAC address '{text}' has an invalid octet '{part}'"))
        })?;
    }
    Ok(mac)
}

/// A network interface owned by exactly one router.
#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    mac: Option<[u8; 6]>,
    peer_name: String,
    addresses: Vec<IpNetwork>,
    switch: Option<String>,
}

impl Interface {
    pub fn new(router: &str, name: &str, mac: Option<&str>, switch: Option<&str>) -> Result<Self> {
        if !valid_name(name) {
            return Err(Error::invariant(format!(
                "interface name '{name}' must be 1 to 15 bytes of [A-Za-z0-9_-]"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            mac: mac.map(parse_mac).transpose()?,
            peer_name: mint_peer_name(router, name),
            addresses: Vec::new(),
            switch: switch.map(str::to_string),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn mac(&self) -> Option<[u8; 6]> {
        self.mac
    }

    /// The switch this interface is plugged into, by node name.
    pub fn switch(&self) -> Option<&str> {
        self.switch.as_deref()
    }

    pub fn addresses(&self) -> &[IpNetwork] {
        &self.addresses
    }

    /// Parse and record an address. Ill-formed input fails here, before any
    /// kernel call can happen.
    pub fn add_address(&mut self, address: &str, prefix_len: u8) -> Result<()> {
        let ip: std::net::IpAddr = address.parse().map_err(|_| {
            Error::invariant(format!("'{address}' is not a valid IP address"))
        })?;
        let network = IpNetwork::new(ip, prefix_len).map_err(|_| {
            Error::invariant(format!(
                "/{prefix_len} is not a valid prefix length for '{address}'"
            ))
        })?;
        self.addresses.push(network);
        Ok(())
    }

    /// Bring the interface up inside namespace `ns`:
    /// veth pair in the root namespace, inside end moved into the router,
    /// peer enslaved to its bridge (if any) and raised, inside end raised,
    /// MAC applied, addresses added. The peer must be up before addresses go
    /// on so the kernel accepts them.
    pub(crate) async fn bring_up(
        &self,
        exec: &mut Executor,
        ns: &str,
        bridge: Option<&str>,
    ) -> Result<()> {
        debug!(iface = %self.name, peer = %self.peer_name, ns, "bringing up interface");

        exec.create_veth(&self.name, &self.peer_name).await?;

        // The host-side peer must not speak IPv6 autoconf into the bridges
        // we build.
        exec.write_net_sysctl(
            None,
            &format!("ipv6/conf/{}/accept_dad", self.peer_name),
            "0",
        )?;
        exec.write_net_sysctl(
            None,
            &format!("ipv6/conf/{}/accept_ra", self.peer_name),
            "0",
        )?;

        exec.move_into_netns(&self.name, ns).await?;

        if let Some(bridge) = bridge {
            exec.attach_to_bridge(&self.peer_name, bridge).await?;
        }
        exec.set_link_up(None, &self.peer_name).await?;
        exec.set_link_up(Some(ns), &self.name).await?;

        if let Some(mac) = self.mac {
            exec.set_mac(ns, &self.name, mac).await?;
        }
        for address in &self.addresses {
            exec.add_address(ns, &self.name, *address).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_boundaries() {
        assert!(valid_name("eth0"));
        assert!(valid_name("a"));
        assert!(valid_name("abcdefghijklmno")); // exactly 15 bytes
        assert!(!valid_name("abcdefghijklmnop")); // 16 bytes
        assert!(!valid_name(""));
        assert!(!valid_name("eth 0"));
        assert!(!valid_name("eth.0"));
    }

    #[test]
    fn short_peer_names_pass_through() {
        assert_eq!(mint_peer_name("r1", "eth0"), "r1-eth0");
    }

    #[test]
    fn long_peer_names_are_clamped_deterministically() {
        let peer = mint_peer_name("router-fifteen1", "eth0");
        assert_eq!(peer.len(), MAX_NAME_LEN);
        assert_eq!(peer, mint_peer_name("router-fifteen1", "eth0"));
        // Distinct inputs keep distinct mints.
        assert_ne!(peer, mint_peer_name("router-fifteen2", "eth0"));
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("02:aa:bb:cc:dd:ee").unwrap(),
            [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]
        );
        assert!(parse_mac("02:aa:bb:cc:dd").is_err());
        assert!(parse_mac("02:aa:bb:cc:dd:zz").is_err());
        assert!(parse_mac("not-a-mac").is_err());
    }

    #[test]
    fn addresses_are_parsed_at_insertion() {
        let mut iface = Interface::new("r1", "eth0", None, None).unwrap();
        iface.add_address("10.0.0.1", 24).unwrap();
        iface.add_address("fd00::1", 64).unwrap();
        assert_eq!(iface.addresses().len(), 2);

        assert!(iface.add_address("10.0.0.999", 24).is_err());
        assert!(iface.add_address("10.0.0.1", 33).is_err());
        assert_eq!(iface.addresses().len(), 2);
    }

    #[test]
    fn interface_construction_validates_mac() {
        assert!(Interface::new("r1", "eth0", Some("02:00:00:00:00:01"), None).is_ok());
        assert!(Interface::new("r1", "eth0", Some("bogus"), None).is_err());
    }
}
