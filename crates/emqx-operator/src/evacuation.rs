//! Evacuation policy for superseded replicant revisions
//!
//! Picks at most one pod of an old revision that may be removed next, based
//! on the cluster's readiness history, recent pod deletions and the session
//! counts the broker reports for each node.

use crate::crd::{condition_types, Emqx, EmqxNode};
use crate::events::reasons;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::ResourceExt;
use tracing::debug;

/// Host part of a node name: the text after `@`, without any `:port` suffix
pub fn node_host(node: &str) -> &str {
    let host = node.split_once('@').map_or(node, |(_, h)| h);
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    host.split(':').next().unwrap_or(host)
}

fn event_time(event: &Event) -> Option<DateTime<Utc>> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .or_else(|| event.first_timestamp.as_ref().map(|t| t.0))
        .or_else(|| event.metadata.creation_timestamp.as_ref().map(|t| t.0))
}

/// Whether any old replicant may be removed right now.
///
/// Requires the cluster to have been Ready for at least
/// `initialDelaySeconds`, and the last pod deletion recorded against the old
/// revision to be at least `waitTakeover` seconds in the past.
pub fn can_be_scaled_down(cluster: &Emqx, events: &[Event], now: DateTime<Utc>) -> bool {
    let Some(status) = cluster.status.as_ref() else {
        return false;
    };
    let Some(ready) = status
        .get_condition(condition_types::READY)
        .filter(|c| c.is_true())
    else {
        return false;
    };

    let strategy = &cluster.spec.update_strategy;
    let initial_delay = Duration::seconds(i64::from(strategy.initial_delay_seconds));
    if now < ready.last_transition_time + initial_delay {
        debug!("Cluster became ready too recently to scale down");
        return false;
    }

    let wait_takeover = Duration::seconds(i64::from(strategy.evacuation_strategy.wait_takeover));
    let last_delete = events
        .iter()
        .filter(|e| e.reason.as_deref() == Some(reasons::SUCCESSFUL_DELETE))
        .filter_map(event_time)
        .max();
    if let Some(last) = last_delete {
        if now < last + wait_takeover {
            debug!(last_delete = %last, "Waiting for session takeover");
            return false;
        }
    }

    true
}

/// Select the pod of an old revision to remove next, if any.
///
/// Live replicant nodes are joined to `pods` on the pod IP. Enterprise nodes
/// still holding sessions are never chosen. Among the rest the pod with the
/// fewest sessions wins, ties broken by pod name.
pub fn select_removable_pod(
    cluster: &Emqx,
    pods: &[Pod],
    events: &[Event],
    now: DateTime<Utc>,
) -> Option<Pod> {
    if !can_be_scaled_down(cluster, events, now) {
        return None;
    }

    let nodes: &[EmqxNode] = cluster
        .status
        .as_ref()
        .and_then(|s| s.replicant_nodes_status.as_ref())
        .map(|s| s.nodes.as_slice())
        .unwrap_or_default();

    let mut candidates: Vec<(&Pod, &EmqxNode)> = nodes
        .iter()
        .flat_map(|node| {
            let host = node_host(&node.node);
            pods.iter()
                .filter(move |p| pod_ip(p) == Some(host))
                .map(move |p| (p, node))
        })
        .filter(|(_, node)| !(node.is_enterprise() && node.session > 0))
        .collect();

    candidates.sort_by(|a, b| {
        a.1.session
            .cmp(&b.1.session)
            .then_with(|| a.0.name_any().cmp(&b.0.name_any()))
    });

    candidates.first().map(|(pod, node)| {
        debug!(pod = %pod.name_any(), node = %node.node, sessions = node.session, "Selected pod for removal");
        (*pod).clone()
    })
}

fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Condition, EmqxNodesStatus, EmqxStatus};
    use crate::testing::{at, delete_event, ready_pod, sample_cluster};
    use std::collections::BTreeMap;

    fn node(name: &str, edition: &str, session: i64) -> EmqxNode {
        EmqxNode {
            node: name.to_string(),
            role: "replicant".to_string(),
            node_status: "running".to_string(),
            edition: edition.to_string(),
            session,
            ..Default::default()
        }
    }

    fn ready_cluster(ready_since: DateTime<Utc>, nodes: Vec<EmqxNode>) -> Emqx {
        let mut cluster = sample_cluster("emqx");
        let mut status = EmqxStatus::default();
        status.set_condition(Condition::new(
            condition_types::READY,
            true,
            "ClusterReady",
            "",
            ready_since,
        ));
        status.replicant_nodes_status = Some(EmqxNodesStatus {
            nodes,
            ..Default::default()
        });
        cluster.status = Some(status);
        cluster
    }

    fn pod(name: &str, ip: &str) -> Pod {
        ready_pod(name, BTreeMap::new(), ip)
    }

    #[test]
    fn test_node_host() {
        assert_eq!(node_host("emqx@10.0.0.7"), "10.0.0.7");
        assert_eq!(node_host("emqx@10.0.0.7:4370"), "10.0.0.7");
        assert_eq!(node_host("emqx@emqx-core-0.emqx-headless"), "emqx-core-0.emqx-headless");
        assert_eq!(node_host("emqx@[fd00::7]"), "fd00::7");
        assert_eq!(node_host("10.0.0.7"), "10.0.0.7");
    }

    #[test]
    fn test_lowest_session_count_wins_regardless_of_edition() {
        let cluster = ready_cluster(
            at(0),
            vec![
                node("emqx@10.0.0.1", "Opensource", 5),
                node("emqx@10.0.0.2", "Enterprise", 0),
            ],
        );
        let pods = vec![pod("old-a", "10.0.0.1"), pod("old-b", "10.0.0.2")];

        let selected = select_removable_pod(&cluster, &pods, &[], at(3600)).unwrap();
        assert_eq!(selected.name_any(), "old-b");
    }

    #[test]
    fn test_enterprise_node_with_sessions_never_selected() {
        let cluster = ready_cluster(at(0), vec![node("emqx@10.0.0.1", "Enterprise", 1)]);
        let pods = vec![pod("old-a", "10.0.0.1")];
        assert!(select_removable_pod(&cluster, &pods, &[], at(3600)).is_none());

        let cluster = ready_cluster(
            at(0),
            vec![
                node("emqx@10.0.0.1", "Enterprise", 1),
                node("emqx@10.0.0.2", "Opensource", 40),
            ],
        );
        let pods = vec![pod("old-a", "10.0.0.1"), pod("old-b", "10.0.0.2")];
        let selected = select_removable_pod(&cluster, &pods, &[], at(3600)).unwrap();
        assert_eq!(selected.name_any(), "old-b");
    }

    #[test]
    fn test_community_node_removable_with_sessions() {
        let cluster = ready_cluster(at(0), vec![node("emqx@10.0.0.1", "Opensource", 100)]);
        let pods = vec![pod("old-a", "10.0.0.1")];
        assert!(select_removable_pod(&cluster, &pods, &[], at(3600)).is_some());
    }

    #[test]
    fn test_ties_broken_by_pod_name() {
        let cluster = ready_cluster(
            at(0),
            vec![
                node("emqx@10.0.0.2", "Opensource", 0),
                node("emqx@10.0.0.1", "Opensource", 0),
            ],
        );
        let pods = vec![pod("old-z", "10.0.0.1"), pod("old-a", "10.0.0.2")];
        let selected = select_removable_pod(&cluster, &pods, &[], at(3600)).unwrap();
        assert_eq!(selected.name_any(), "old-a");
    }

    #[test]
    fn test_unmatched_nodes_are_dropped() {
        let cluster = ready_cluster(at(0), vec![node("emqx@10.9.9.9", "Opensource", 0)]);
        let pods = vec![pod("old-a", "10.0.0.1")];
        assert!(select_removable_pod(&cluster, &pods, &[], at(3600)).is_none());
    }

    #[test]
    fn test_requires_ready_condition() {
        let mut cluster = ready_cluster(at(0), vec![node("emqx@10.0.0.1", "Opensource", 0)]);
        cluster.status = Some(EmqxStatus {
            replicant_nodes_status: cluster
                .status
                .as_ref()
                .and_then(|s| s.replicant_nodes_status.clone()),
            ..Default::default()
        });
        assert!(!can_be_scaled_down(&cluster, &[], at(3600)));

        cluster.status = None;
        assert!(!can_be_scaled_down(&cluster, &[], at(3600)));
    }

    #[test]
    fn test_initial_delay_after_ready() {
        let cluster = ready_cluster(at(0), vec![]);
        // default initialDelaySeconds is 10
        assert!(!can_be_scaled_down(&cluster, &[], at(5)));
        assert!(can_be_scaled_down(&cluster, &[], at(10)));
    }

    #[test]
    fn test_recent_pod_deletion_blocks_scale_down() {
        let cluster = ready_cluster(at(0), vec![]);
        let events = vec![delete_event("emqx-replicant-old", at(100))];
        // default waitTakeover is 10
        assert!(!can_be_scaled_down(&cluster, &events, at(105)));
        assert!(can_be_scaled_down(&cluster, &events, at(110)));
    }

    #[test]
    fn test_other_events_do_not_block() {
        let cluster = ready_cluster(at(0), vec![]);
        let mut event = delete_event("emqx-replicant-old", at(100));
        event.reason = Some("SuccessfulCreate".to_string());
        assert!(can_be_scaled_down(&cluster, &[event], at(101)));
    }
}
