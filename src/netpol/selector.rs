use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::error;
use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::crd;
use crate::state::State;

/// Standard label selector semantics: `matchLabels` and `matchExpressions`
/// must both hold; an empty selector matches everything. An unknown operator
/// matches nothing (the offending rule selects no peers instead of failing
/// the whole policy).
pub fn matches_labels(selector: &LabelSelector, labels: &Map<String, String>) -> bool {
    let matches_labels = 'b: {
        let Some(ref filter) = selector.match_labels else {
            break 'b true; // empty => true
        };
        for (k, v) in filter {
            if labels.get(k) != Some(v) {
                break 'b false;
            }
        }
        true
    };

    let matches_expressions = 'b: {
        let Some(ref filter) = selector.match_expressions else {
            break 'b true; // empty => true
        };
        for expr in filter {
            let value = labels.get(&expr.key);

            let eval = match expr.operator.as_str() {
                "Exists" => value.is_some(),
                "DoesNotExist" => value.is_none(),
                "In" => value
                    .is_some_and(|value| expr.values.as_ref().is_some_and(|v| v.contains(value))),
                "NotIn" => value
                    .is_none_or(|value| expr.values.as_ref().is_some_and(|v| !v.contains(value))),
                op => {
                    error!("unknown selector operator {op}");
                    false
                }
            };

            if !eval {
                break 'b false;
            }
        }
        true
    };

    matches_labels && matches_expressions
}

/// Peer IPs on one network, per family, sorted.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PeerIps {
    pub v4: Set<Ipv4Addr>,
    pub v6: Set<Ipv6Addr>,
}

/// Resolve a selector-based peer against the snapshot, restricted to IPs the
/// peer pods hold on `network`.
///
/// A namespace selector scopes the peer to matching namespaces; without one
/// the policy's own namespace is the scope. A pod selector then filters pods
/// within that scope; without one all eligible pods match.
pub fn peer_ips(state: &State, policy_namespace: &str, peer: &crd::Peer, network: &str) -> PeerIps {
    let ns_filter: Option<Set<&String>> = peer.namespace_selector.as_ref().map(|ns_sel| {
        (state.nses.iter())
            .filter(|(_, ns)| matches_labels(ns_sel, &ns.labels))
            .map(|(name, _)| name)
            .collect()
    });

    let mut ips = PeerIps::default();

    for (key, pod) in state.pods.iter() {
        if !pod.is_eligible() {
            continue;
        }

        match ns_filter {
            Some(ref nses) => {
                if !nses.contains(&key.namespace) {
                    continue;
                }
            }
            None => {
                if key.namespace != policy_namespace {
                    continue;
                }
            }
        }

        if let Some(ref sel) = peer.pod_selector
            && !matches_labels(sel, &pod.labels)
        {
            continue;
        }

        for iface in pod.interfaces_on(network) {
            ips.v4.extend(&iface.ipsv4);
            ips.v6.extend(&iface.ipsv6);
        }
    }

    ips
}
