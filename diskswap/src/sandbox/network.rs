//! Network plumbing for the nested runtime.
//!
//! The nested runtime's own firewall management is disabled, so exactly
//! the rules nested containers need are installed here and removed in
//! reverse on teardown. The nested Supervisor's fixed address collides
//! with an address the surrounding host-side platform already uses;
//! fwmark-based policy routing keeps both reachable.

use diskswap_shared::constants::{
    HASSIO_GATEWAY, HASSIO_SUBNET, HASSIO_SUPERVISOR_IP, NESTED_BRIDGE_CIDR,
};
use diskswap_shared::{DiskswapError, DiskswapResult};

use crate::util::cmd;

/// Routing table reserved for host traffic to the colliding address.
const FWMARK_TABLE: &str = "100";
/// Mark stamped onto host-originated packets for that address.
const FWMARK: &str = "0x64";
/// Bridge the nested runtime creates for its default network.
const NESTED_BRIDGE: &str = "docker0";
/// Bridge backing the nested Supervisor's internal network.
const HASSIO_BRIDGE: &str = "hassio";
/// Interface carrying the host's real upstream connectivity.
const UPLINK: &str = "eth0";

/// One reversible network rule: an apply command and its undo command.
/// `tolerant` rules may fail on apply (e.g. deleting a route that was
/// never installed).
#[derive(Debug, Clone)]
pub(crate) struct NetRule {
    pub add: Vec<String>,
    pub del: Vec<String>,
    pub tolerant: bool,
}

fn rule(add: &[&str], del: &[&str]) -> NetRule {
    NetRule {
        add: add.iter().map(|s| s.to_string()).collect(),
        del: del.iter().map(|s| s.to_string()).collect(),
        tolerant: false,
    }
}

fn tolerant(add: &[&str], del: &[&str]) -> NetRule {
    NetRule {
        tolerant: true,
        ..rule(add, del)
    }
}

fn nested_bridge_subnet() -> String {
    // "10.99.99.1/24" -> "10.99.99.0/24"
    let (addr, prefix) = NESTED_BRIDGE_CIDR.split_once('/').unwrap_or(("", "24"));
    let mut octets: Vec<&str> = addr.split('.').collect();
    if octets.len() == 4 {
        octets[3] = "0";
    }
    format!("{}/{}", octets.join("."), prefix)
}

/// NAT and forwarding rules that let nested containers reach the
/// internet. Installed once the nested runtime's socket is responsive.
pub(crate) fn nat_rules() -> Vec<NetRule> {
    let subnet = nested_bridge_subnet();
    vec![
        rule(
            &["iptables", "-t", "nat", "-A", "POSTROUTING", "-s", &subnet, "!", "-o", NESTED_BRIDGE, "-j", "MASQUERADE"],
            &["iptables", "-t", "nat", "-D", "POSTROUTING", "-s", &subnet, "!", "-o", NESTED_BRIDGE, "-j", "MASQUERADE"],
        ),
        rule(
            &["iptables", "-A", "FORWARD", "-i", NESTED_BRIDGE, "-j", "ACCEPT"],
            &["iptables", "-D", "FORWARD", "-i", NESTED_BRIDGE, "-j", "ACCEPT"],
        ),
        rule(
            &["iptables", "-A", "FORWARD", "-o", NESTED_BRIDGE, "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
            &["iptables", "-D", "FORWARD", "-o", NESTED_BRIDGE, "-m", "conntrack", "--ctstate", "RELATED,ESTABLISHED", "-j", "ACCEPT"],
        ),
    ]
}

/// Route and policy-routing rules installed after the nested Supervisor
/// network exists. The broad /23 route that network installs is replaced
/// by a /24 scoped to the bridge, and host traffic to the colliding
/// Supervisor address is marked and forced out the uplink via its own
/// routing table.
pub(crate) fn routing_rules() -> Vec<NetRule> {
    let supervisor_host = format!("{}/32", HASSIO_SUPERVISOR_IP);
    let narrowed = narrowed_hassio_subnet();
    vec![
        // The broad route only existed because the bridge was created;
        // undoing its deletion on teardown would be re-breaking the host.
        tolerant(
            &["ip", "route", "del", HASSIO_SUBNET, "dev", HASSIO_BRIDGE],
            &[],
        ),
        rule(
            &["ip", "route", "replace", &narrowed, "dev", HASSIO_BRIDGE, "src", HASSIO_GATEWAY],
            &["ip", "route", "del", &narrowed, "dev", HASSIO_BRIDGE],
        ),
        rule(
            &["iptables", "-t", "mangle", "-A", "OUTPUT", "-d", &supervisor_host, "-j", "MARK", "--set-mark", FWMARK],
            &["iptables", "-t", "mangle", "-D", "OUTPUT", "-d", &supervisor_host, "-j", "MARK", "--set-mark", FWMARK],
        ),
        rule(
            &["ip", "rule", "add", "fwmark", FWMARK, "lookup", FWMARK_TABLE],
            &["ip", "rule", "del", "fwmark", FWMARK, "lookup", FWMARK_TABLE],
        ),
        rule(
            &["ip", "route", "replace", &supervisor_host, "dev", UPLINK, "table", FWMARK_TABLE],
            &["ip", "route", "flush", "table", FWMARK_TABLE],
        ),
    ]
}

fn narrowed_hassio_subnet() -> String {
    // "172.30.32.0/23" -> "172.30.32.0/24"
    let addr = HASSIO_SUBNET.split('/').next().unwrap_or(HASSIO_SUBNET);
    format!("{}/24", addr)
}

/// Apply rules in order, recording each into `applied` as it lands so a
/// mid-list failure still gets its prefix removed on teardown.
pub(crate) async fn apply(rules: Vec<NetRule>, applied: &mut Vec<NetRule>) -> DiskswapResult<()> {
    for net_rule in rules {
        let argv: Vec<&str> = net_rule.add.iter().map(String::as_str).collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DiskswapError::Internal("empty net rule".into()))?;
        if net_rule.tolerant {
            cmd::run_quiet(program, args).await;
        } else {
            cmd::run(program, args)
                .await
                .map_err(|e| DiskswapError::Sandbox(e.to_string()))?;
        }
        applied.push(net_rule);
    }
    Ok(())
}

/// Remove applied rules in reverse order, best-effort.
pub(crate) async fn remove(applied: &mut Vec<NetRule>) {
    while let Some(net_rule) = applied.pop() {
        let argv: Vec<&str> = net_rule.del.iter().map(String::as_str).collect();
        if let Some((program, args)) = argv.split_first() {
            cmd::run_quiet(program, args).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_subnet_derives_from_bridge_address() {
        assert_eq!(nested_bridge_subnet(), "10.99.99.0/24");
    }

    #[test]
    fn hassio_route_is_narrowed_to_a_slash_24() {
        assert_eq!(narrowed_hassio_subnet(), "172.30.32.0/24");
    }

    #[test]
    fn every_delete_mirrors_its_add() {
        for r in nat_rules() {
            assert_eq!(r.add[0], r.del[0]);
            assert!(r.add.contains(&"-A".to_string()));
            assert!(r.del.contains(&"-D".to_string()));
        }
    }

    #[test]
    fn broad_route_deletion_has_no_undo() {
        let rules = routing_rules();
        assert!(rules[0].tolerant);
        assert!(rules[0].del.is_empty());
        assert!(rules[1..].iter().all(|r| !r.del.is_empty()));
    }
}
