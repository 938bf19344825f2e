//! Expiration across several nodes and topology changes.

use crate::affinity::Affinity;
use crate::bean::{BeanKey, ExpirationMetaData};
use crate::testing::{wait_for, RecordingBean, TestCluster};
use crate::types::{BeanId, GroupId, NodeId};
use std::collections::BTreeSet;
use std::time::Duration;
use test_log::test;

const POLL: Duration = Duration::from_millis(20);

fn bean_owned_by(cluster: &TestCluster<RecordingBean>, node_id: NodeId) -> RecordingBean {
    loop {
        let bean = RecordingBean::new();
        if cluster.topology.primary_owner(&BeanKey::Creation(bean.id)) == Some(node_id) {
            return bean;
        }
    }
}

async fn create_beans(cluster: &TestCluster<RecordingBean>, count: usize) -> Vec<BeanId> {
    let nodes = cluster.nodes();
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let manager = cluster.manager(nodes[i % nodes.len()]).unwrap();
        let bean = RecordingBean::new();
        let id = bean.id;
        let created = manager.create_bean(bean, GroupId::from(id)).await.unwrap();
        created.close().await.unwrap();
        ids.push(id);
    }
    ids
}

/// Every timer sits on the primary owner of its bean, and every bean has one.
fn assert_timers_on_owners(cluster: &TestCluster<RecordingBean>, ids: &[BeanId]) {
    let mut seen = BTreeSet::new();
    for (node_id, scheduled) in cluster.scheduled() {
        for id in scheduled {
            let owner = cluster.topology.primary_owner(&BeanKey::Creation(id));
            assert_eq!(owner, Some(node_id), "timer for {id} on non-owner {node_id}");
            assert!(seen.insert(id), "timer for {id} held twice");
        }
    }
    let expected: BTreeSet<BeanId> = ids.iter().copied().collect();
    assert_eq!(seen, expected);
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_each_bean_expires_once() {
    let mut cluster = TestCluster::<RecordingBean>::new("Cart", Some(Duration::from_millis(300)), 2);
    for node_id in 1..=3 {
        cluster.add_node(node_id).unwrap();
    }

    let ids = create_beans(&cluster, 30).await;
    let expired = wait_for(
        || cluster.expirations.len() >= ids.len(),
        Duration::from_secs(10),
        POLL,
    )
    .await;
    assert!(expired, "only {} of {} beans expired", cluster.expirations.len(), ids.len());

    // Give stray duplicates a chance to show up.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let counts = cluster.expirations.counts();
    assert_eq!(counts.len(), ids.len());
    assert!(counts.values().all(|count| *count == 1));
    assert!(cluster.cache.is_empty());

    cluster.shutdown().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_timers_follow_topology_changes() {
    let mut cluster = TestCluster::<RecordingBean>::new("Cart", Some(Duration::from_secs(2)), 2);
    cluster.add_node(1).unwrap();
    cluster.add_node(2).unwrap();

    let ids = create_beans(&cluster, 24).await;
    assert_timers_on_owners(&cluster, &ids);

    cluster.add_node(3).unwrap();
    assert_timers_on_owners(&cluster, &ids);

    cluster.remove_node(1).await;
    assert_timers_on_owners(&cluster, &ids);

    let expired = wait_for(
        || cluster.expirations.len() >= ids.len(),
        Duration::from_secs(10),
        POLL,
    )
    .await;
    assert!(expired);
    assert!(cluster.expirations.counts().values().all(|count| *count == 1));
    assert!(cluster
        .expirations
        .entries()
        .iter()
        .all(|(node_id, _)| *node_id != 1));

    cluster.shutdown().await;
}

#[test(tokio::test)]
async fn test_close_forwards_schedule_to_owner() {
    let mut cluster = TestCluster::<RecordingBean>::new("Cart", Some(Duration::from_secs(60)), 2);
    let one = cluster.add_node(1).unwrap();
    cluster.add_node(2).unwrap();

    let bean = bean_owned_by(&cluster, 2);
    let id = bean.id;
    one.create_bean(bean, GroupId::from(id)).await.unwrap().close().await.unwrap();

    let scheduled = cluster.scheduled();
    assert!(scheduled[&1].is_empty());
    assert_eq!(scheduled[&2], vec![id]);

    // A lookup on any node cancels the owner's timer.
    let found = one.find_bean(id).await.unwrap().unwrap();
    assert!(cluster.scheduled()[&2].is_empty());
    found.close().await.unwrap();
    assert_eq!(cluster.scheduled()[&2], vec![id]);

    cluster.shutdown().await;
}

#[test(tokio::test)]
async fn test_non_owner_does_not_expire() {
    let mut cluster = TestCluster::<RecordingBean>::new("Cart", Some(Duration::from_secs(60)), 2);
    let one = cluster.add_node(1).unwrap();
    cluster.add_node(2).unwrap();

    let bean = bean_owned_by(&cluster, 2);
    let id = bean.id;
    one.create_bean(bean, GroupId::from(id)).await.unwrap().close().await.unwrap();

    let local = one.local_scheduler().unwrap();
    local.schedule_local(id, ExpirationMetaData::new(Duration::from_millis(1), 0));
    let ran = wait_for(|| !local.contains(&id), Duration::from_secs(5), POLL).await;
    assert!(ran);
    local.run_due().await;

    assert!(cluster.cache.contains_key(&BeanKey::Creation(id)));
    assert!(cluster.expirations.is_empty());

    cluster.shutdown().await;
}

#[test(tokio::test)]
async fn test_restarted_node_picks_up_owned_beans() {
    let mut cluster = TestCluster::<RecordingBean>::new("Cart", Some(Duration::from_secs(60)), 2);
    cluster.add_node(1).unwrap();
    let ids = create_beans(&cluster, 12).await;
    assert_eq!(cluster.scheduled()[&1].len(), ids.len());

    cluster.add_node(2).unwrap();
    cluster.remove_node(1).await;
    assert_eq!(cluster.scheduled()[&2].len(), ids.len());

    cluster.add_node(1).unwrap();
    assert_timers_on_owners(&cluster, &ids);

    cluster.shutdown().await;
}

#[test(tokio::test)]
async fn test_affinity_tracks_ownership() {
    let mut cluster = TestCluster::<RecordingBean>::new("Cart", Some(Duration::from_secs(60)), 2);
    let one = cluster.add_node(1).unwrap();
    cluster.add_node(2).unwrap();

    assert_eq!(one.strong_affinity(), Affinity::Cluster("ejb".to_string()));
    let bean = bean_owned_by(&cluster, 2);
    assert_eq!(one.weak_affinity(bean.id), Affinity::Node(2));

    cluster.remove_node(2).await;
    assert_eq!(one.weak_affinity(bean.id), Affinity::Node(1));

    cluster.shutdown().await;
}
