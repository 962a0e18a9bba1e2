use k8s_openapi::api::core::v1 as core;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::watcher::Event;
use serde_json::{Value, json};

use super::*;

// ---------------------------------------------------------------- fixtures

fn add_pod(state: &mut State, pod: Value) {
    let pod: core::Pod = serde_json::from_value(pod).unwrap();
    state.pods.ingest(Event::Apply(pod));
}

fn add_namespace(state: &mut State, name: &str, labels: Value) {
    let ns: core::Namespace = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name, "labels": labels},
    }))
    .unwrap();
    state.nses.ingest(Event::Apply(ns));
}

/// the pod policies apply to: two dual-stack secondary interfaces
fn target_pod() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "target-pod",
            "namespace": "test-ns",
            "labels": {"app": "web"},
            "annotations": {
                "k8s.v1.cni.cncf.io/networks": "net1,net2",
                "k8s.v1.cni.cncf.io/network-status": r#"[{"name":"test-ns/net1","interface":"eth1","ips":["10.0.1.1","2001:db8:1::1"],"dns":{}},{"name":"test-ns/net2","interface":"eth2","ips":["10.0.2.1","2001:db8:2::1"],"dns":{}}]"#,
            },
        },
        "spec": {"hostNetwork": false, "containers": []},
        "status": {"phase": "Running"},
    })
}

fn dual_stack_pod(
    name: &str,
    namespace: &str,
    labels: Value,
    v4net1: &str,
    v4net2: &str,
    v6net1: &str,
    v6net2: &str,
) -> Value {
    let status = format!(
        r#"[{{"name":"test-ns/net1","interface":"eth1","ips":["{v4net1}","{v6net1}"],"dns":{{}}}},{{"name":"test-ns/net2","interface":"eth2","ips":["{v4net2}","{v6net2}"],"dns":{{}}}}]"#
    );
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
            "annotations": {
                "k8s.v1.cni.cncf.io/networks": "net1,net2",
                "k8s.v1.cni.cncf.io/network-status": status,
            },
        },
        "spec": {"hostNetwork": false, "containers": []},
        "status": {"phase": "Running"},
    })
}

fn state_with_target() -> State {
    let mut state = State::new("node1".into());
    add_pod(&mut state, target_pod());
    state
}

/// peer pods and namespaces of the comprehensive scenario
fn comprehensive_state() -> State {
    let mut state = state_with_target();
    add_pod(
        &mut state,
        dual_stack_pod(
            "backend-pod",
            "test-ns",
            json!({"app": "backend", "tier": "api"}),
            "10.0.1.10",
            "10.0.2.10",
            "2001:db8:1::10",
            "2001:db8:2::10",
        ),
    );
    add_pod(
        &mut state,
        dual_stack_pod(
            "frontend-pod1",
            "production",
            json!({"app": "frontend", "role": "web"}),
            "10.0.1.20",
            "10.0.2.20",
            "2001:db8:1::20",
            "2001:db8:2::20",
        ),
    );
    add_pod(
        &mut state,
        dual_stack_pod(
            "frontend-pod2",
            "production",
            json!({"app": "frontend", "role": "logs"}),
            "10.0.1.21",
            "10.0.2.21",
            "2001:db8:1::21",
            "2001:db8:2::21",
        ),
    );
    add_pod(
        &mut state,
        dual_stack_pod(
            "database-pod",
            "development",
            json!({"app": "database", "tier": "data"}),
            "10.0.1.30",
            "10.0.2.30",
            "2001:db8:1::30",
            "2001:db8:2::30",
        ),
    );
    add_namespace(&mut state, "production", json!({"env": "prod"}));
    add_namespace(&mut state, "development", json!({"env": "dev"}));
    state
}

fn label_selector(labels: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            (labels.iter())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        match_expressions: None,
    }
}

fn port_int(port: i32) -> crd::Port {
    crd::Port {
        protocol: None,
        port: Some(IntOrString::Int(port)),
        end_port: None,
    }
}

fn port_named(name: &str) -> crd::Port {
    crd::Port {
        protocol: None,
        port: Some(IntOrString::String(name.to_string())),
        end_port: None,
    }
}

fn port_range(port: i32, end_port: i32) -> crd::Port {
    crd::Port {
        protocol: None,
        port: Some(IntOrString::Int(port)),
        end_port: Some(end_port),
    }
}

fn deny_all_policy() -> Policy {
    Policy {
        namespace: "test-ns".into(),
        networks: vec!["test-ns/net1".into(), "test-ns/net2".into()],
        is_ingress: true,
        is_egress: true,
        pod_selector: label_selector(&[("app", "web")]),
        ingress: vec![],
        egress: vec![],
    }
}

fn accept_all_policy() -> Policy {
    Policy {
        // one empty rule per direction = accept everything
        ingress: vec![crd::IngressRule::default()],
        egress: vec![crd::EgressRule::default()],
        ..deny_all_policy()
    }
}

fn accept_all_with_ports_policy() -> Policy {
    Policy {
        ingress: vec![crd::IngressRule {
            from: None,
            ports: Some(vec![port_int(80), port_named("https"), port_range(8000, 8010)]),
        }],
        egress: vec![crd::EgressRule {
            to: None,
            ports: Some(vec![port_int(443)]),
        }],
        ..deny_all_policy()
    }
}

fn comprehensive_policy() -> Policy {
    Policy {
        ingress: vec![
            crd::IngressRule {
                from: Some(vec![crd::Peer {
                    pod_selector: Some(label_selector(&[("app", "backend")])),
                    ..Default::default()
                }]),
                ports: Some(vec![port_int(80), port_named("https"), port_range(8000, 8010)]),
            },
            crd::IngressRule {
                from: Some(vec![crd::Peer {
                    namespace_selector: Some(label_selector(&[("env", "prod")])),
                    ..Default::default()
                }]),
                ports: None,
            },
            crd::IngressRule {
                from: Some(vec![
                    crd::Peer {
                        ip_block: Some(crd::IpBlock {
                            cidr: "10.0.0.0/8".into(),
                            except: Some(vec!["10.1.0.0/16".into()]),
                        }),
                        ..Default::default()
                    },
                    crd::Peer {
                        ip_block: Some(crd::IpBlock {
                            cidr: "2001:db8::/32".into(),
                            except: Some(vec!["2001:db8:1::/48".into()]),
                        }),
                        ..Default::default()
                    },
                ]),
                ports: Some(vec![port_int(80), port_named("https"), port_range(8000, 8010)]),
            },
        ],
        egress: vec![crd::EgressRule {
            to: Some(vec![crd::Peer {
                namespace_selector: Some(label_selector(&[("env", "prod")])),
                pod_selector: Some(label_selector(&[("app", "frontend"), ("role", "logs")])),
                ip_block: None,
            }]),
            ports: None,
        }],
        ..deny_all_policy()
    }
}

/// what the orchestrator installs: tables for every interface the policy's
/// networks select, in attachment order
fn enforce(state: &State, policy_name: &str, policy: &Policy) -> String {
    enforce_with(state, policy_name, policy, &CommonRules::default())
}

fn enforce_with(
    state: &State,
    policy_name: &str,
    policy: &Policy,
    common: &CommonRules,
) -> String {
    let target = keys::Object::new("test-ns", "target-pod");
    let pod = state.pods.get(&target).unwrap();
    let policy_key = keys::Object::new(policy.namespace.clone(), policy_name);
    (pod.interfaces.iter())
        .filter(|iface| policy.networks.contains(&iface.network))
        .map(|iface| render(state, pod, &policy_key, policy, iface, common))
        .collect()
}

// ------------------------------------------------------------ golden files

#[test]
fn test_deny_all_policy() {
    let state = state_with_target();
    assert_eq!(
        enforce(&state, "deny-all", &deny_all_policy()),
        include_str!("../../../testdata/golden/deny-all-policy.nft")
    );
}

#[test]
fn test_accept_all_policy() {
    let state = state_with_target();
    assert_eq!(
        enforce(&state, "accept-all", &accept_all_policy()),
        include_str!("../../../testdata/golden/accept-all-policy.nft")
    );
}

#[test]
fn test_accept_all_with_ports_policy() {
    // the target pod declares no "https" container port: that element is
    // omitted, the others remain
    let state = state_with_target();
    assert_eq!(
        enforce(&state, "accept-ports", &accept_all_with_ports_policy()),
        include_str!("../../../testdata/golden/accept-all-with-ports-policy.nft")
    );
}

#[test]
fn test_comprehensive_policy() {
    let state = comprehensive_state();
    assert_eq!(
        enforce(&state, "comprehensive", &comprehensive_policy()),
        include_str!("../../../testdata/golden/comprehensive-policy.nft")
    );
}

#[test]
fn test_policy_layering() {
    // two policies on the same pod produce tables with distinct identities;
    // removing one leaves the other's text untouched
    let state = comprehensive_state();

    let deny = enforce(&state, "deny-all", &deny_all_policy());
    let comprehensive = enforce(&state, "comprehensive", &comprehensive_policy());

    let stacked = format!("{deny}{comprehensive}");
    assert!(stacked.contains("table ip mnp-test-ns-deny-all-eth1"));
    assert!(stacked.contains("table ip mnp-test-ns-comprehensive-eth1"));

    // after cleaning up "comprehensive", deny-all alone remains
    assert_eq!(
        deny,
        include_str!("../../../testdata/golden/lifecycle-after-cleanup.nft")
    );
}

#[test]
fn test_multiple_networks() {
    let mut state = State::new("node1".into());
    add_pod(
        &mut state,
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "target-pod",
                "namespace": "test-ns",
                "labels": {"app": "target-pod"},
                "annotations": {
                    "k8s.v1.cni.cncf.io/networks": "red-net,blue-net",
                    "k8s.v1.cni.cncf.io/network-status": r#"[{"name":"test-ns/red-net","interface":"ethred","ips":["10.0.1.1","2001:db8:1::1"],"dns":{}},{"name":"test-ns/blue-net","interface":"ethblue","ips":["10.0.2.1","2001:db8:2::1"],"dns":{}}]"#,
                },
            },
            "spec": {"hostNetwork": false, "containers": []},
            "status": {"phase": "Running"},
        }),
    );
    for (name, network, v4, v6) in [
        ("red-pod-a", "test-ns/red-net", "10.0.1.10", "2001:db8:1::10"),
        ("red-pod-b", "test-ns/red-net", "10.0.1.11", "2001:db8:1::11"),
        ("blue-pod-a", "test-ns/blue-net", "10.0.2.10", "2001:db8:2::10"),
        ("blue-pod-b", "test-ns/blue-net", "10.0.2.11", "2001:db8:2::11"),
    ] {
        let status = format!(
            r#"[{{"name":"{network}","interface":"eth1","ips":["{v4}","{v6}"],"dns":{{}}}}]"#
        );
        add_pod(
            &mut state,
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": name,
                    "namespace": "test-ns",
                    "labels": {"app": name},
                    "annotations": {
                        "k8s.v1.cni.cncf.io/networks": network,
                        "k8s.v1.cni.cncf.io/network-status": status,
                    },
                },
                "spec": {"hostNetwork": false, "containers": []},
                "status": {"phase": "Running"},
            }),
        );
    }

    let peer = |app: &str| crd::Peer {
        pod_selector: Some(label_selector(&[("app", app)])),
        ..Default::default()
    };
    let policy = |network: &str, from: &str, to: &str| Policy {
        namespace: "test-ns".into(),
        networks: vec![network.into()],
        is_ingress: true,
        is_egress: true,
        pod_selector: label_selector(&[("app", "target-pod")]),
        ingress: vec![crd::IngressRule {
            from: Some(vec![peer(from)]),
            ports: None,
        }],
        egress: vec![crd::EgressRule {
            to: Some(vec![peer(to)]),
            ports: None,
        }],
    };

    let red = policy("test-ns/red-net", "red-pod-a", "red-pod-b");
    let blue = policy("test-ns/blue-net", "blue-pod-a", "blue-pod-b");

    // each policy's tables reference only IPs of its own network
    let out = enforce(&state, "red-policy", &red) + &enforce(&state, "blue-policy", &blue);
    assert_eq!(
        out,
        include_str!("../../../testdata/golden/multiple-networks-policy.nft")
    );
}

// ------------------------------------------------------------- properties

#[test]
fn test_enforce_is_deterministic() {
    let state = comprehensive_state();
    let policy = comprehensive_policy();
    assert_eq!(
        enforce(&state, "comprehensive", &policy),
        enforce(&state, "comprehensive", &policy)
    );
}

#[test]
fn test_family_isolation() {
    let out = enforce(&comprehensive_state(), "comprehensive", &comprehensive_policy());

    for block in out.split("table ").filter(|b| !b.is_empty()) {
        if block.starts_with("ip6 ") {
            assert!(!block.contains(" 10."), "IPv4 literal in an IPv6 table:\n{block}");
        } else {
            assert!(!block.contains("2001:"), "IPv6 literal in an IPv4 table:\n{block}");
        }
    }
}

#[test]
fn test_interface_filter() {
    // only interfaces on the policy's networks get tables
    let state = state_with_target();
    let policy = Policy {
        networks: vec!["test-ns/net2".into()],
        ..deny_all_policy()
    };

    let out = enforce(&state, "net2-only", &policy);
    assert!(out.contains("mnp-test-ns-net2-only-eth2"));
    assert!(!out.contains("eth1"));
}

#[test]
fn test_ingress_only_policy_has_no_egress_chain() {
    let state = state_with_target();
    let policy = Policy {
        is_egress: false,
        ..deny_all_policy()
    };

    let out = enforce(&state, "ingress-only", &policy);
    assert!(out.contains("chain ingress"));
    assert!(!out.contains("chain egress"));
}

#[test]
fn test_named_port_resolution() {
    // same policy as the ports scenario, but the target pod declares the
    // "https" container port
    let mut state = State::new("node1".into());
    let mut pod = target_pod();
    pod["spec"]["containers"] = json!([
        {"name": "web", "ports": [{"name": "https", "containerPort": 8443, "protocol": "TCP"}]}
    ]);
    add_pod(&mut state, pod);

    let out = enforce(&state, "accept-ports", &accept_all_with_ports_policy());
    assert!(
        out.contains("meta l4proto . th dport { tcp . 80, tcp . 8443, tcp . 8000-8010 } accept")
    );
}

#[test]
fn test_unresolvable_ports_match_nothing() {
    // a rule whose whole port list fails to resolve must not widen to "any
    // port": it emits nothing
    let state = state_with_target();
    let restricted = Policy {
        ingress: vec![crd::IngressRule {
            from: None,
            ports: Some(vec![port_named("https")]),
        }],
        ..deny_all_policy()
    };

    assert_eq!(
        enforce(&state, "restricted", &restricted),
        enforce(&state, "restricted", &deny_all_policy())
    );
}

#[test]
fn test_ip_block_except_outside_cidr_is_dropped() {
    let state = state_with_target();
    let policy = Policy {
        ingress: vec![crd::IngressRule {
            from: Some(vec![crd::Peer {
                ip_block: Some(crd::IpBlock {
                    cidr: "10.0.0.0/8".into(),
                    except: Some(vec!["192.168.0.0/16".into(), "10.1.0.0/16".into()]),
                }),
                ..Default::default()
            }]),
            ports: None,
        }],
        ..deny_all_policy()
    };

    let out = enforce(&state, "blocks", &policy);
    assert!(out.contains("ip saddr 10.0.0.0/8 ip saddr != { 10.1.0.0/16 } accept"));
    assert!(!out.contains("192.168.0.0/16"));
}

#[test]
fn test_common_rules() {
    let state = state_with_target();
    let policy = Policy {
        networks: vec!["test-ns/net1".into()],
        ..deny_all_policy()
    };
    let common = CommonRules {
        accept_icmp: true,
        accept_icmpv6: true,
        custom_v4_ingress: vec!["tcp dport 22 accept".into()],
        custom_v6_egress: vec!["tcp dport 53 accept".into()],
        ..Default::default()
    };

    assert_eq!(
        enforce_with(&state, "restricted", &policy, &common),
        "table ip mnp-test-ns-restricted-eth1 {
	chain conntrack {
		ct state established,related accept
		ct state invalid drop
	}

	chain ingress {
		type filter hook input priority filter; policy drop;
		iifname != \"eth1\" accept
		ip daddr != { 10.0.1.1 } accept
		jump conntrack
		meta l4proto icmp accept
		tcp dport 22 accept
	}

	chain egress {
		type filter hook output priority filter; policy drop;
		oifname != \"eth1\" accept
		ip saddr != { 10.0.1.1 } accept
		jump conntrack
		meta l4proto icmp accept
	}
}
table ip6 mnp-test-ns-restricted-eth1 {
	chain conntrack {
		ct state established,related accept
		ct state invalid drop
	}

	chain ingress {
		type filter hook input priority filter; policy drop;
		iifname != \"eth1\" accept
		ip6 daddr != { 2001:db8:1::1 } accept
		jump conntrack
		meta l4proto ipv6-icmp accept
	}

	chain egress {
		type filter hook output priority filter; policy drop;
		oifname != \"eth1\" accept
		ip6 saddr != { 2001:db8:1::1 } accept
		jump conntrack
		meta l4proto ipv6-icmp accept
		tcp dport 53 accept
	}
}
"
    );
}

#[test]
fn test_table_names() {
    let policy = keys::Object::new("test-ns", "deny-all");
    assert_eq!(table_name(&policy, "eth1"), "mnp-test-ns-deny-all-eth1");
    assert!(table_name(&policy, "eth1").starts_with(TABLE_PREFIX));
    assert_eq!(policy_table_prefix(&policy), "mnp-test-ns-deny-all-");
}
