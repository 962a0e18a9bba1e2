use itertools::Itertools;
use log::{debug, error};
use std::fmt::Write;

use super::{Policy, ports, selector};
use crate::crd;
use crate::state::{Interface, Pod, State, keys};

/// Reserved table-name prefix. Every table owned by this agent starts with
/// it; cleanup never touches anything else.
pub const TABLE_PREFIX: &str = "mnp-";

/// Stable table identity for one (policy, interface) pairing.
pub fn table_name(policy: &keys::Object, iface: &str) -> String {
    format!("{TABLE_PREFIX}{}-{}-{iface}", policy.namespace, policy.name)
}

/// Name prefix shared by all of a policy's tables, used on cleanup.
pub fn policy_table_prefix(policy: &keys::Object) -> String {
    format!("{TABLE_PREFIX}{}-{}-", policy.namespace, policy.name)
}

/// Operator-supplied static content merged into every generated table.
#[derive(Clone, Debug, Default)]
pub struct CommonRules {
    pub accept_icmp: bool,
    pub accept_icmpv6: bool,
    pub custom_v4_ingress: Vec<String>,
    pub custom_v4_egress: Vec<String>,
    pub custom_v6_ingress: Vec<String>,
    pub custom_v6_egress: Vec<String>,
}

impl CommonRules {
    fn accepts_icmp(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.accept_icmp,
            Family::V6 => self.accept_icmpv6,
        }
    }

    fn custom(&self, family: Family, dir: Direction) -> &[String] {
        match (family, dir) {
            (Family::V4, Direction::Ingress) => &self.custom_v4_ingress,
            (Family::V4, Direction::Egress) => &self.custom_v4_egress,
            (Family::V6, Direction::Ingress) => &self.custom_v6_ingress,
            (Family::V6, Direction::Egress) => &self.custom_v6_egress,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    /// nftables family name, also the address-expression keyword
    fn kw(self) -> &'static str {
        match self {
            Family::V4 => "ip",
            Family::V6 => "ip6",
        }
    }

    fn icmp(self) -> &'static str {
        match self {
            Family::V4 => "icmp",
            Family::V6 => "ipv6-icmp",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    fn chain(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }

    fn hook(self) -> &'static str {
        match self {
            Direction::Ingress => "input",
            Direction::Egress => "output",
        }
    }

    fn iface_match(self) -> &'static str {
        match self {
            Direction::Ingress => "iifname",
            Direction::Egress => "oifname",
        }
    }

    /// address side holding the target pod's own IPs
    fn own_addr(self) -> &'static str {
        match self {
            Direction::Ingress => "daddr",
            Direction::Egress => "saddr",
        }
    }

    /// address side holding the peer
    fn peer_addr(self) -> &'static str {
        match self {
            Direction::Ingress => "saddr",
            Direction::Egress => "daddr",
        }
    }
}

/// Render the tables enforcing `policy` on one interface of the target pod:
/// one table per IP family the interface has addresses in, IPv4 first. The
/// output is a pure function of the snapshot; equal inputs give byte-equal
/// text.
pub fn render(
    state: &State,
    target: &Pod,
    policy_key: &keys::Object,
    policy: &Policy,
    iface: &Interface,
    common: &CommonRules,
) -> String {
    let mut out = String::new();
    for family in [Family::V4, Family::V6] {
        render_family(&mut out, family, state, target, policy_key, policy, iface, common);
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn render_family(
    out: &mut String,
    family: Family,
    state: &State,
    target: &Pod,
    policy_key: &keys::Object,
    policy: &Policy,
    iface: &Interface,
    common: &CommonRules,
) {
    let own_ips = match family {
        Family::V4 => iface.ipsv4.iter().join(", "),
        Family::V6 => iface.ipsv6.iter().join(", "),
    };
    if own_ips.is_empty() {
        return; // nothing of this family on the interface
    }

    let kw = family.kw();
    let name = table_name(policy_key, &iface.name);

    macro_rules! w {
        ($($tt:tt)*) => {
            out.write_fmt(format_args!($($tt)*)).unwrap();
            out.push('\n');
        };
    }

    w!("table {kw} {name} {{");
    w!("\tchain conntrack {{");
    w!("\t\tct state established,related accept");
    w!("\t\tct state invalid drop");
    w!("\t}}");

    for dir in [Direction::Ingress, Direction::Egress] {
        let attached = match dir {
            Direction::Ingress => policy.is_ingress,
            Direction::Egress => policy.is_egress,
        };
        if !attached {
            continue; // direction not listed: traffic unaffected by this table
        }

        w!("");
        w!("\tchain {} {{", dir.chain());
        w!("\t\ttype filter hook {} priority filter; policy drop;", dir.hook());
        // scope to this interface and the pod's own addresses
        w!("\t\t{} != \"{}\" accept", dir.iface_match(), iface.name);
        w!("\t\t{kw} {} != {{ {own_ips} }} accept", dir.own_addr());
        w!("\t\tjump conntrack");

        if common.accepts_icmp(family) {
            w!("\t\tmeta l4proto {} accept", family.icmp());
        }

        let mut lines = Vec::new();
        match dir {
            Direction::Ingress => {
                for rule in &policy.ingress {
                    append_rule(
                        &mut lines,
                        family,
                        dir,
                        rule.from.as_ref(),
                        &rule.ports,
                        state,
                        &policy.namespace,
                        target,
                        &iface.network,
                    );
                }
            }
            Direction::Egress => {
                for rule in &policy.egress {
                    append_rule(
                        &mut lines,
                        family,
                        dir,
                        rule.to.as_ref(),
                        &rule.ports,
                        state,
                        &policy.namespace,
                        target,
                        &iface.network,
                    );
                }
            }
        }
        for line in lines {
            w!("\t\t{line}");
        }

        for raw in common.custom(family, dir) {
            w!("\t\t{}", raw.trim());
        }

        w!("\t}}");
    }

    w!("}}");
}

/// Expand one policy rule into accept lines: the cartesian product of its
/// peers with its resolved port set, in policy order.
#[allow(clippy::too_many_arguments)]
fn append_rule(
    lines: &mut Vec<String>,
    family: Family,
    dir: Direction,
    peers: Option<&Vec<crd::Peer>>,
    rule_ports: &Option<Vec<crd::Port>>,
    state: &State,
    policy_namespace: &str,
    target: &Pod,
    network: &str,
) {
    let ports_clause = match ports::resolve(rule_ports, target) {
        None => String::new(),
        // every element was invalid or unresolved: the rule matches nothing
        Some(resolved) if resolved.is_empty() => return,
        Some(resolved) => format!(
            "meta l4proto . th dport {{ {} }} ",
            resolved.iter().map(|p| p.nft()).join(", ")
        ),
    };

    match peers {
        // absent or empty peer list: any source/destination
        None => lines.push(format!("{ports_clause}accept")),
        Some(peers) if peers.is_empty() => lines.push(format!("{ports_clause}accept")),
        Some(peers) => {
            for peer in peers {
                let Some(peer_clause) =
                    peer_match(family, dir, peer, state, policy_namespace, network)
                else {
                    continue; // nothing of this family behind the peer
                };
                lines.push(format!("{ports_clause}{peer_clause}accept"));
            }
        }
    }
}

fn peer_match(
    family: Family,
    dir: Direction,
    peer: &crd::Peer,
    state: &State,
    policy_namespace: &str,
    network: &str,
) -> Option<String> {
    let kw = family.kw();
    let addr = dir.peer_addr();

    if let Some(ref block) = peer.ip_block {
        return ip_block_match(family, kw, addr, block);
    }

    if peer.pod_selector.is_none() && peer.namespace_selector.is_none() {
        error!("peer without selectors or ipBlock (skipped)");
        return None;
    }

    let ips = selector::peer_ips(state, policy_namespace, peer, network);
    let set = match family {
        Family::V4 => ips.v4.iter().join(", "),
        Family::V6 => ips.v6.iter().join(", "),
    };
    if set.is_empty() {
        return None;
    }
    Some(format!("{kw} {addr} {{ {set} }} "))
}

/// CIDRs belong to exactly one family's table; exceptions are membership
/// negations and must be contained in the block.
fn ip_block_match(family: Family, kw: &str, addr: &str, block: &crd::IpBlock) -> Option<String> {
    let cidr: cidr::IpCidr = match block.cidr.parse() {
        Ok(v) => v,
        Err(e) => {
            error!("invalid ipBlock cidr (skipped): {}: {e}", block.cidr);
            return None;
        }
    };

    let except = block.except.as_deref().unwrap_or_default();

    match (family, cidr) {
        (Family::V4, cidr::IpCidr::V4(cidr)) => Some(block_match(kw, addr, cidr, except)),
        (Family::V6, cidr::IpCidr::V6(cidr)) => Some(block_match(kw, addr, cidr, except)),
        _ => None, // the other family's table
    }
}

fn block_match<C>(kw: &str, addr: &str, cidr: C, except: &[String]) -> String
where
    C: cidr::Cidr + std::fmt::Display + std::str::FromStr,
    <C as std::str::FromStr>::Err: std::fmt::Display,
{
    let mut keep = Vec::with_capacity(except.len());
    for raw in except {
        let e = match raw.parse::<C>() {
            Ok(v) => v,
            Err(err) => {
                error!("invalid ipBlock except (skipped): {raw}: {err}");
                continue;
            }
        };
        if !(cidr.contains(&e.first_address()) && e.network_length() >= cidr.network_length()) {
            debug!("ipBlock except {raw} not contained in {cidr} (skipped)");
            continue;
        }
        keep.push(e.to_string());
    }

    let mut m = format!("{kw} {addr} {cidr} ");
    if !keep.is_empty() {
        write!(m, "{kw} {addr} != {{ {} }} ", keep.iter().join(", ")).unwrap();
    }
    m
}

#[cfg(test)]
mod tests;
