pub mod nftables;
pub mod ports;
pub mod selector;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::{
    crd, memstore,
    state::{self, keys},
};

/// Networks a policy applies to are declared in this annotation as a
/// comma-separated list of attachment names (bare or `namespace/name`).
pub const POLICY_FOR_ANNOTATION: &str = "k8s.v1.cni.cncf.io/policy-for";

#[derive(Clone, Debug)]
pub struct Policy {
    pub namespace: String,
    /// qualified network names this policy applies to, in annotation order
    pub networks: Vec<String>,
    pub is_ingress: bool,
    pub is_egress: bool,
    pub pod_selector: LabelSelector,
    pub ingress: Vec<crd::IngressRule>,
    pub egress: Vec<crd::EgressRule>,
}

impl Policy {
    pub fn applies_to(&self, key: &keys::Object, pod: &state::Pod) -> bool {
        key.namespace == self.namespace
            && pod.is_eligible()
            && selector::matches_labels(&self.pod_selector, &pod.labels)
    }
}

impl memstore::KeyValueFrom<crd::MultiNetworkPolicy> for Policy {
    type Key = keys::Object;

    fn key_from(v: &crd::MultiNetworkPolicy) -> Option<Self::Key> {
        keys::Object::try_from(&v.metadata).ok()
    }

    fn value_from(v: &crd::MultiNetworkPolicy) -> Option<Self> {
        let namespace = v.metadata.namespace.clone()?;
        let spec = &v.spec;

        let networks = (v.metadata.annotations.as_ref())
            .and_then(|ann| ann.get(POLICY_FOR_ANNOTATION))
            .map(|raw| parse_networks(raw, &namespace))
            .unwrap_or_default();

        Some(Self {
            is_ingress: match spec.policy_types {
                Some(ref v) => v.iter().any(|v| v == "Ingress"),
                // (ref) all policies (whether or not they contain an ingress section) are assumed to affect ingress
                None => true,
            },
            is_egress: match spec.policy_types {
                Some(ref v) => v.iter().any(|v| v == "Egress"),
                // (ref) policies that contain an egress section are assumed to affect egress
                None => spec.egress.is_some(),
            },
            namespace,
            networks,
            pod_selector: spec.pod_selector.clone(),
            ingress: spec.ingress.clone().unwrap_or_default(),
            egress: spec.egress.clone().unwrap_or_default(),
        })
    }
}

fn parse_networks(raw: &str, namespace: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|n| state::qualify_network(n, namespace))
        .collect()
}
