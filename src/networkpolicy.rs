//! Translation of `SandboxNetworkPolicy` intent into a concrete
//! `networking.k8s.io/v1` `NetworkPolicy`.
//!
//! Builds `NetworkPolicy`/`NetworkPolicyPeer`/`NetworkPolicyPort` values as
//! pure struct literals rather than `serde_json::json!` templating.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{EgressRuleIntent, NamespacedPodSelector, Protocol, SandboxNetworkPolicy};

/// DNS must always be reachable regardless of `additionalEgressRules` — a
/// network policy must never strand the sandbox without DNS.
fn dns_egress_rule() -> NetworkPolicyEgressRule {
    let mut kube_system_labels = BTreeMap::new();
    kube_system_labels.insert("kubernetes.io/metadata.name".to_string(), "kube-system".to_string());

    let mut dns_pod_labels = BTreeMap::new();
    dns_pod_labels.insert("k8s-app".to_string(), "kube-dns".to_string());

    NetworkPolicyEgressRule {
        to: Some(vec![NetworkPolicyPeer {
            namespace_selector: Some(LabelSelector {
                match_labels: Some(kube_system_labels),
                ..Default::default()
            }),
            pod_selector: Some(LabelSelector {
                match_labels: Some(dns_pod_labels),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ports: Some(vec![
            NetworkPolicyPort {
                protocol: Some("UDP".to_string()),
                port: Some(IntOrString::Int(53)),
                ..Default::default()
            },
            NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(IntOrString::Int(53)),
                ..Default::default()
            },
        ]),
    }
}

fn peer_from_selector(selector: &NamespacedPodSelector) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: if selector.namespace_labels.is_empty() {
            None
        } else {
            Some(LabelSelector {
                match_labels: Some(selector.namespace_labels.clone()),
                ..Default::default()
            })
        },
        pod_selector: if selector.pod_labels.is_empty() {
            None
        } else {
            Some(LabelSelector {
                match_labels: Some(selector.pod_labels.clone()),
                ..Default::default()
            })
        },
        ..Default::default()
    }
}

fn peer_from_cidr(cidr: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        ip_block: Some(IPBlock {
            cidr: cidr.to_string(),
            except: None,
        }),
        ..Default::default()
    }
}

fn egress_peer(rule: &EgressRuleIntent) -> Option<NetworkPolicyPeer> {
    if let Some(block) = &rule.ip_block {
        return Some(NetworkPolicyPeer {
            ip_block: Some(IPBlock {
                cidr: block.cidr.clone(),
                except: if block.except.is_empty() { None } else { Some(block.except.clone()) },
            }),
            ..Default::default()
        });
    }
    rule.namespace_selector.as_ref().map(peer_from_selector)
}

fn protocol_str(p: Protocol) -> String {
    match p {
        Protocol::Tcp => "TCP".to_string(),
        Protocol::Udp => "UDP".to_string(),
    }
}

/// Container ports declared on the sandbox's own pod template, used as the
/// ingress port list when the intent doesn't narrow it further.
fn container_ports(pod_ports: &[i32]) -> Option<Vec<NetworkPolicyPort>> {
    if pod_ports.is_empty() {
        return None;
    }
    Some(
        pod_ports
            .iter()
            .map(|p| NetworkPolicyPort {
                protocol: Some("TCP".to_string()),
                port: Some(IntOrString::Int(*p)),
                ..Default::default()
            })
            .collect(),
    )
}

/// Translate the abstract `intent` into a concrete `NetworkPolicy` selecting
/// pods by `sandbox_name_hash` label, scoped to `namespace`. `pod_ports` are
/// the sandbox's own container ports (used for the ingress port list);
/// returns `None` when the intent is disabled.
pub fn build(
    name: &str,
    namespace: &str,
    sandbox_name_hash: &str,
    intent: &SandboxNetworkPolicy,
    pod_ports: &[i32],
    owner: OwnerReference,
) -> Option<NetworkPolicy> {
    if !intent.enabled {
        return None;
    }

    let mut pod_selector_labels = BTreeMap::new();
    pod_selector_labels.insert(crate::labels::SANDBOX_NAME_HASH.to_string(), sandbox_name_hash.to_string());

    let has_ingress_sources = !intent.ingress_controller_selectors.is_empty()
        || !intent.ingress_from_ip_blocks.is_empty()
        || !intent.additional_ingress_rules.is_empty();

    let mut ingress = Vec::new();
    if has_ingress_sources {
        let mut from = Vec::new();
        from.extend(intent.ingress_controller_selectors.iter().map(peer_from_selector));
        from.extend(intent.ingress_from_ip_blocks.iter().map(|c| peer_from_cidr(c)));
        from.extend(intent.additional_ingress_rules.iter().map(peer_from_selector));

        ingress.push(NetworkPolicyIngressRule {
            from: Some(from),
            ports: container_ports(pod_ports),
        });
    }

    let mut egress = vec![dns_egress_rule()];
    for rule in &intent.additional_egress_rules {
        let Some(peer) = egress_peer(rule) else { continue };
        egress.push(NetworkPolicyEgressRule {
            to: Some(vec![peer]),
            ports: Some(vec![NetworkPolicyPort {
                protocol: Some(protocol_str(rule.protocol)),
                port: Some(IntOrString::Int(rule.port)),
                ..Default::default()
            }]),
        });
    }

    Some(NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(pod_selector_labels),
                ..Default::default()
            },
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            ingress: if ingress.is_empty() { None } else { Some(ingress) },
            egress: Some(egress),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::IpBlockIntent;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "agents.x-k8s.io/v1alpha1".to_string(),
            kind: "SandboxTemplate".to_string(),
            name: "t".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn disabled_intent_produces_nothing() {
        let intent = SandboxNetworkPolicy::default();
        assert!(build("np", "ns", "hash1", &intent, &[8080], owner()).is_none());
    }

    #[test]
    fn enabled_with_no_ingress_sources_has_no_ingress_rules() {
        let intent = SandboxNetworkPolicy {
            enabled: true,
            ..Default::default()
        };
        let np = build("np", "ns", "hash1", &intent, &[8080], owner()).unwrap();
        let spec = np.spec.unwrap();
        assert!(spec.ingress.is_none());
        assert!(spec.egress.is_some());
    }

    #[test]
    fn dns_egress_rule_always_present() {
        let intent = SandboxNetworkPolicy {
            enabled: true,
            ..Default::default()
        };
        let np = build("np", "ns", "hash1", &intent, &[], owner()).unwrap();
        let egress = np.spec.unwrap().egress.unwrap();
        assert_eq!(egress.len(), 1);
        let peer = &egress[0].to.as_ref().unwrap()[0];
        assert_eq!(
            peer.pod_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()
                .get("k8s-app"),
            Some(&"kube-dns".to_string())
        );
    }

    #[test]
    fn ip_block_ingress_produces_ingress_rule() {
        let intent = SandboxNetworkPolicy {
            enabled: true,
            ingress_from_ip_blocks: vec!["10.0.0.0/8".to_string()],
            ..Default::default()
        };
        let np = build("np", "ns", "hash1", &intent, &[8080], owner()).unwrap();
        let ingress = np.spec.unwrap().ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        assert_eq!(ingress[0].from.as_ref().unwrap().len(), 1);
        assert_eq!(
            ingress[0].ports.as_ref().unwrap()[0].port,
            Some(IntOrString::Int(8080))
        );
    }

    #[test]
    fn additional_egress_rule_with_namespace_selector() {
        let mut pod_labels = BTreeMap::new();
        pod_labels.insert("app".to_string(), "registry".to_string());
        let intent = SandboxNetworkPolicy {
            enabled: true,
            additional_egress_rules: vec![EgressRuleIntent {
                ip_block: None,
                namespace_selector: Some(NamespacedPodSelector {
                    namespace_labels: BTreeMap::new(),
                    pod_labels,
                }),
                port: 443,
                protocol: Protocol::Tcp,
            }],
            ..Default::default()
        };
        let np = build("np", "ns", "hash1", &intent, &[], owner()).unwrap();
        let egress = np.spec.unwrap().egress.unwrap();
        assert_eq!(egress.len(), 2);
        assert_eq!(egress[1].ports.as_ref().unwrap()[0].protocol.as_deref(), Some("TCP"));
    }

    #[test]
    fn egress_rule_with_ip_block_and_except() {
        let intent = SandboxNetworkPolicy {
            enabled: true,
            additional_egress_rules: vec![EgressRuleIntent {
                ip_block: Some(IpBlockIntent {
                    cidr: "10.0.0.0/8".to_string(),
                    except: vec!["10.0.1.0/24".to_string()],
                }),
                namespace_selector: None,
                port: 5432,
                protocol: Protocol::Tcp,
            }],
            ..Default::default()
        };
        let np = build("np", "ns", "hash1", &intent, &[], owner()).unwrap();
        let egress = np.spec.unwrap().egress.unwrap();
        let block = egress[1].to.as_ref().unwrap()[0].ip_block.as_ref().unwrap();
        assert_eq!(block.cidr, "10.0.0.0/8");
        assert_eq!(block.except.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn pod_selector_uses_sandbox_name_hash() {
        let intent = SandboxNetworkPolicy {
            enabled: true,
            ..Default::default()
        };
        let np = build("np", "ns", "ab179450", &intent, &[], owner()).unwrap();
        let selector = np.spec.unwrap().pod_selector;
        assert_eq!(
            selector.match_labels.unwrap().get(crate::labels::SANDBOX_NAME_HASH),
            Some(&"ab179450".to_string())
        );
    }
}
