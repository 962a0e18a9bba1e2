use eyre::format_err;
use k8s_openapi::api::core::v1 as core;
use log::error;
use serde::Deserialize;
use std::collections::BTreeMap as Map;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{crd, kube_watch, memstore, netpol};

pub mod keys;


pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

/// In-memory view of the cluster, fed by the watch layer and read as an
/// immutable snapshot during each apply round.
pub struct State {
    pub node_name: String,
    pub pods: memstore::Map<core::Pod, Pod>,
    pub nses: memstore::Map<core::Namespace, Namespace>,
    pub netpols: memstore::Map<crd::MultiNetworkPolicy, netpol::Policy>,
    pub net_attachments: memstore::Map<crd::NetworkAttachmentDefinition, NetAttachment>,
}

impl State {
    pub fn new(node_name: String) -> Self {
        Self {
            node_name,
            pods: memstore::Map::new(),
            nses: memstore::Map::new(),
            netpols: memstore::Map::new(),
            net_attachments: memstore::Map::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.pods.is_ready()
            && self.nses.is_ready()
            && self.netpols.is_ready()
            && self.net_attachments.is_ready()
    }

    pub fn ingest(&mut self, event: kube_watch::Event) {
        use kube_watch::Event::*;
        match event {
            Pod(e) => self.pods.ingest(*e),
            Namespace(e) => self.nses.ingest(*e),
            NetworkPolicy(e) => self.netpols.ingest(*e),
            NetAttachment(e) => self.net_attachments.ingest(*e),
        }
    }
}

/// Pod projection: only what selector evaluation, port resolution and rule
/// generation need.
#[derive(Debug, Clone)]
pub struct Pod {
    pub labels: Map<String, String>,
    pub node: String,
    pub uid: String,
    pub host_network: bool,
    pub running: bool,
    /// secondary interfaces, from the network-status annotation
    pub interfaces: Vec<Interface>,
    /// named container ports, for named-port resolution
    pub container_ports: Vec<ContainerPort>,
}

impl Pod {
    /// Peers and targets must be running, off the host network and attached
    /// to at least one secondary network.
    pub fn is_eligible(&self) -> bool {
        self.running && !self.host_network && !self.interfaces.is_empty()
    }

    pub fn interfaces_on<'a>(&'a self, network: &'a str) -> impl Iterator<Item = &'a Interface> {
        self.interfaces.iter().filter(move |i| i.network == network)
    }
}

/// One secondary network attachment of a pod, IPs partitioned by family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub network: String,
    pub ipsv4: Vec<Ipv4Addr>,
    pub ipsv6: Vec<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    pub name: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl memstore::KeyValueFrom<core::Pod> for Pod {
    type Key = keys::Object;

    fn key_from(pod: &core::Pod) -> Option<Self::Key> {
        keys::Object::try_from(&pod.metadata).ok()
    }

    fn value_from(pod: &core::Pod) -> Option<Self> {
        let namespace = pod.metadata.namespace.as_deref()?;
        let spec = pod.spec.as_ref()?;
        let node = spec.node_name.clone().unwrap_or_default();

        let running = (pod.status.as_ref()).and_then(|s| s.phase.as_deref()) == Some("Running");

        // a pod without the networks annotation has no secondary attachments,
        // whatever its network-status says
        let annotations = pod.metadata.annotations.as_ref();
        let interfaces = annotations
            .filter(|ann| ann.contains_key(NETWORKS_ANNOTATION))
            .and_then(|ann| ann.get(NETWORK_STATUS_ANNOTATION))
            .map(|status| parse_network_status(status, namespace))
            .unwrap_or_default();

        let container_ports = (spec.containers.iter())
            .flat_map(|c| c.ports.iter().flatten())
            .filter_map(|p| {
                Some(ContainerPort {
                    name: p.name.clone()?,
                    protocol: Protocol::try_from(&p.protocol).ok()?,
                    port: u16::try_from(p.container_port).ok()?,
                })
            })
            .collect();

        Some(Self {
            labels: pod.metadata.labels.clone().unwrap_or_default(),
            node,
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            host_network: spec.host_network.unwrap_or(false),
            running,
            interfaces,
            container_ports,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NetworkStatusEntry {
    name: String,
    #[serde(default)]
    interface: Option<String>,
    #[serde(default)]
    ips: Option<Vec<String>>,
}

/// Parse the network-status annotation into interfaces. A malformed
/// annotation yields no interfaces; a bad IP literal is skipped. Both are
/// logged, neither fails the pod.
fn parse_network_status(status: &str, namespace: &str) -> Vec<Interface> {
    let entries: Vec<NetworkStatusEntry> = match serde_json::from_str(status) {
        Ok(v) => v,
        Err(e) => {
            error!("invalid network-status annotation (ignored): {e}");
            return Vec::new();
        }
    };

    let mut interfaces = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(name) = entry.interface else {
            continue; // status entry without an interface (e.g. the default network)
        };

        let mut ipsv4 = Vec::new();
        let mut ipsv6 = Vec::new();
        for ip in entry.ips.iter().flatten() {
            match ip.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => ipsv4.push(ip),
                Ok(IpAddr::V6(ip)) => ipsv6.push(ip),
                Err(e) => error!("invalid IP in network-status (skipped): {ip}: {e}"),
            }
        }

        interfaces.push(Interface {
            name,
            network: qualify_network(&entry.name, namespace),
            ipsv4,
            ipsv6,
        });
    }
    interfaces
}

/// Network names are `namespace/name`; bare names belong to the given
/// namespace.
pub fn qualify_network(name: &str, namespace: &str) -> String {
    if name.contains('/') {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

#[derive(Debug, Clone)]
pub struct Namespace {
    pub labels: Map<String, String>,
}
impl memstore::KeyValueFrom<core::Namespace> for Namespace {
    type Key = String;

    fn key_from(ns: &core::Namespace) -> Option<Self::Key> {
        ns.metadata.name.clone()
    }

    fn value_from(ns: &core::Namespace) -> Option<Self> {
        Some(Self {
            labels: ns.metadata.labels.clone().unwrap_or_default(),
        })
    }
}

/// NetworkAttachmentDefinition projection: the CNI plugin type, used to
/// restrict enforcement to the operator's allowed plugin list.
#[derive(Debug, Clone)]
pub struct NetAttachment {
    pub plugin: Option<String>,
}
impl memstore::KeyValueFrom<crd::NetworkAttachmentDefinition> for NetAttachment {
    type Key = keys::Object;

    fn key_from(nad: &crd::NetworkAttachmentDefinition) -> Option<Self::Key> {
        keys::Object::try_from(&nad.metadata).ok()
    }

    fn value_from(nad: &crd::NetworkAttachmentDefinition) -> Option<Self> {
        Some(Self {
            plugin: plugin_type(nad.spec.config.as_deref()),
        })
    }
}

/// Extract the CNI plugin type from a NAD config blob, handling both the
/// single-plugin form and the `plugins` conflist form.
fn plugin_type(config: Option<&str>) -> Option<String> {
    let config = config?;
    let value: serde_json::Value = serde_json::from_str(config)
        .inspect_err(|e| error!("invalid CNI config in net-attach-def (ignored): {e}"))
        .ok()?;

    if let Some(plugin) = value.get("type").and_then(|t| t.as_str()) {
        return Some(plugin.to_string());
    }

    (value.get("plugins")?.as_array()?.first())
        .and_then(|p| p.get("type"))
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Protocol {
    TCP,
    UDP,
    SCTP,
}

impl Protocol {
    pub fn nft(&self) -> &'static str {
        match self {
            Protocol::TCP => "tcp",
            Protocol::UDP => "udp",
            Protocol::SCTP => "sctp",
        }
    }
}

impl TryFrom<&Option<String>> for Protocol {
    type Error = eyre::Error;
    fn try_from(v: &Option<String>) -> Result<Protocol, eyre::Error> {
        match v.as_deref() {
            None | Some("TCP") => Ok(Protocol::TCP),
            Some("UDP") => Ok(Protocol::UDP),
            Some("SCTP") => Ok(Protocol::SCTP),
            Some(v) => Err(format_err!("invalid protocol: {v}")),
        }
    }
}
