use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use log::error;

use crate::crd;
use crate::state::{Pod, Protocol};

/// A resolved port element: protocol plus an inclusive port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMatch {
    pub protocol: Protocol,
    pub port: u16,
    pub end_port: Option<u16>,
}

impl PortMatch {
    /// `meta l4proto . th dport` set element
    pub fn nft(&self) -> String {
        match self.end_port {
            None => format!("{} . {}", self.protocol.nft(), self.port),
            Some(end) => format!("{} . {}-{}", self.protocol.nft(), self.port, end),
        }
    }
}

/// Resolve a rule's port list against the target pod's container ports.
///
/// `None` means the rule carries no port restriction (any port). `Some` is
/// the resolved elements, in rule order; it may be empty when every element
/// was invalid or an unresolvable named port, in which case the rule matches
/// no traffic (a stated restriction never widens to "any port").
pub fn resolve(ports: &Option<Vec<crd::Port>>, target: &Pod) -> Option<Vec<PortMatch>> {
    let ports = ports.as_ref()?;
    if ports.is_empty() {
        return None;
    }

    let mut resolved = Vec::with_capacity(ports.len());

    for p in ports {
        let protocol = match Protocol::try_from(&p.protocol) {
            Ok(v) => v,
            Err(e) => {
                error!("{e} (port skipped)");
                continue;
            }
        };

        let (port, end_port) = match p.port.as_ref() {
            // no port with a known protocol: any port of that protocol
            None => (0, Some(u16::MAX)),
            Some(IntOrString::Int(port)) => {
                let Ok(port) = u16::try_from(*port) else {
                    error!("port {port} out of range (skipped)");
                    continue;
                };
                match p.end_port {
                    None => (port, None),
                    Some(end) => {
                        let Ok(end) = u16::try_from(end) else {
                            error!("endPort {end} out of range (skipped)");
                            continue;
                        };
                        if end < port {
                            error!("endPort {end} < port {port} (skipped)");
                            continue;
                        }
                        (port, Some(end))
                    }
                }
            }
            Some(IntOrString::String(name)) => {
                // named ports resolve against the target pod only; no match
                // means this element matches no traffic on this pod
                let Some(cp) = (target.container_ports.iter())
                    .find(|cp| cp.name == *name && cp.protocol == protocol)
                else {
                    continue;
                };
                (cp.port, None)
            }
        };

        resolved.push(PortMatch {
            protocol,
            port,
            end_port,
        });
    }

    Some(resolved)
}
