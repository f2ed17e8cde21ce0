//! Subscription lifecycle against an in-memory ledger and a fake fleet.

mod common;

use chrono::Duration;

use common::{t0, Harness};
use fleet::allocator::list_available_nodes;
use fleet::lifecycle::{CreateRequest, LifecycleError};
use fleet::models::{NewPoolEntry, Strategy};
use fleet::provision::reconcile::{prune_stale, reconcile_node};
use fleet::store::Ledger;

fn request(account_id: i64) -> CreateRequest {
    CreateRequest {
        account_id,
        display_name: Some(format!("user{}", account_id)),
        duration: Duration::days(30),
    }
}

// ── Create ───────────────────────────────────────────────────

#[tokio::test]
async fn test_create_new_account_thirty_days() {
    let h = Harness::new();
    h.add_node("fra-1", 10).await;

    let outcome = h.manager.create(&request(42)).await.unwrap();
    let sub = &outcome.subscription;

    assert!(sub.is_active);
    assert_eq!(sub.created_at, t0());
    assert_eq!(sub.expires_at, t0() + Duration::days(30));
    assert_ne!(sub.access_token, sub.client_id);
    assert!(!sub.access_token.contains(&sub.client_id));
    assert_eq!(outcome.grants.len(), 1);
    assert!(outcome.failures.is_empty());
}

#[tokio::test]
async fn test_create_fans_out_one_id_across_nodes() {
    let h = Harness::new();
    h.add_node("ams-1", 10).await;
    h.add_node("fra-1", 10).await;

    let outcome = h.manager.create(&request(7)).await.unwrap();
    let client_id = outcome.subscription.client_id.clone();

    assert_eq!(outcome.grants.len(), 2);
    for grant in &outcome.grants {
        assert_eq!(grant.client_id, client_id);
        assert_eq!(grant.strategy, Strategy::LiveSync);
        assert!(grant.access_url.starts_with(&format!("vless://{}@", client_id)));
    }
    assert_eq!(h.fleet.client_ids(&Harness::host("ams-1")), vec![client_id.clone()]);
    assert_eq!(h.fleet.client_ids(&Harness::host("fra-1")), vec![client_id]);
}

#[tokio::test]
async fn test_create_selects_only_node_with_room() {
    let h = Harness::new();
    let a = h.add_node("a", 2).await;
    let b = h.add_node("b", 2).await;

    // Fill B while A is out of rotation.
    h.ledger.set_node_active(a.id, false).await.unwrap();
    h.manager.create(&request(1)).await.unwrap();
    h.manager.create(&request(2)).await.unwrap();
    h.ledger.set_node_active(a.id, true).await.unwrap();

    let available = list_available_nodes(h.ledger.as_ref()).await.unwrap();
    assert_eq!(available.iter().map(|n| n.id).collect::<Vec<_>>(), vec![a.id]);

    let outcome = h.manager.create(&request(3)).await.unwrap();
    assert_eq!(outcome.grants.len(), 1);
    assert_eq!(outcome.grants[0].node_id, a.id);
    assert_ne!(outcome.grants[0].node_id, b.id);
}

#[tokio::test]
async fn test_create_records_only_accepting_nodes() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let b = h.add_node("b", 10).await;
    h.add_node("c", 10).await;
    h.fleet.set_unreachable(&Harness::host("a"), true);
    h.fleet.set_restart_fails(&Harness::host("c"), true);

    let outcome = h.manager.create(&request(5)).await.unwrap();

    assert_eq!(outcome.grants.len(), 1);
    assert_eq!(outcome.grants[0].node_id, b.id);
    let mut kinds: Vec<_> = outcome.failures.iter().map(|f| f.kind).collect();
    kinds.sort();
    assert_eq!(kinds, vec!["channel_unreachable", "node_sync_partial"]);

    let stored = h
        .ledger
        .grants_for_subscription(outcome.subscription.id)
        .await
        .unwrap();
    assert_eq!(stored, outcome.grants);
}

#[tokio::test]
async fn test_create_with_no_accepting_node_persists_nothing() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    h.add_node("b", 10).await;
    h.fleet.set_unreachable(&Harness::host("a"), true);
    h.fleet
        .set_document(&Harness::host("b"), b"{ this is not json");

    let err = h.manager.create(&request(9)).await.unwrap_err();
    match err {
        LifecycleError::NoAcceptingNode { failures } => {
            let kinds: Vec<_> = failures.iter().map(|f| f.kind).collect();
            assert_eq!(kinds, vec!["channel_unreachable", "document_parse"]);
        }
        other => panic!("expected NoAcceptingNode, got {:?}", other),
    }

    let stats = h.ledger.stats().await.unwrap();
    assert_eq!(stats.total_accounts, 0);
    assert_eq!(stats.active_subscriptions, 0);
    assert!(h.manager.active_subscription(9).await.unwrap().is_none());
    assert_eq!(h.fleet.snapshot(&Harness::host("b")).document, b"{ this is not json");
}

#[tokio::test]
async fn test_create_without_capacity() {
    let h = Harness::new();
    let err = h.manager.create(&request(1)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NoCapacityAvailable));

    let full = h.add_node("full", 0).await;
    assert_eq!(full.capacity, 0);
    let err = h.manager.create(&request(1)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NoCapacityAvailable));
}

#[tokio::test]
async fn test_create_rejects_non_positive_duration() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let mut req = request(1);
    req.duration = Duration::zero();

    let err = h.manager.create(&req).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidRequest(_)));
    assert_eq!(h.fleet.snapshot(&Harness::host("a")).writes, 0);
}

#[tokio::test]
async fn test_create_rejects_duration_past_calendar_range() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let mut req = request(1);
    req.duration = Duration::days(365 * 300_000);

    let err = h.manager.create(&req).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidRequest(_)));
    assert_eq!(h.fleet.snapshot(&Harness::host("a")).writes, 0);
    assert!(h.fleet.client_ids(&Harness::host("a")).is_empty());
    assert_eq!(h.ledger.stats().await.unwrap().active_subscriptions, 0);
}

#[tokio::test]
async fn test_ledger_failure_releases_provisioned_clients() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    h.add_node("b", 10).await;
    h.ledger.set_fail_writes(true);

    let err = h.manager.create(&request(3)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Ledger(_)));

    assert!(h.fleet.client_ids(&Harness::host("a")).is_empty());
    assert!(h.fleet.client_ids(&Harness::host("b")).is_empty());
    assert_eq!(h.ledger.stats().await.unwrap().active_subscriptions, 0);
}

#[tokio::test]
async fn test_accounts_are_reused_across_subscriptions() {
    let h = Harness::new();
    h.add_node("a", 10).await;

    let first = h.manager.create(&request(11)).await.unwrap();
    h.advance(Duration::days(1));
    let second = h.manager.create(&request(11)).await.unwrap();

    assert_eq!(first.subscription.account_id, second.subscription.account_id);
    assert_ne!(first.subscription.access_token, second.subscription.access_token);
    assert_eq!(h.ledger.stats().await.unwrap().total_accounts, 1);

    let (active, grants) = h.manager.active_subscription(11).await.unwrap().unwrap();
    assert_eq!(active.id, second.subscription.id);
    assert_eq!(grants.len(), 1);
}

// ── Revoke ───────────────────────────────────────────────────

#[tokio::test]
async fn test_revoke_removes_client_from_nodes() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    h.add_node("b", 10).await;
    let outcome = h.manager.create(&request(1)).await.unwrap();
    let id = outcome.subscription.id;

    let revoked = h.manager.revoke(id).await.unwrap();

    assert!(revoked.deactivated);
    assert_eq!(revoked.released, 2);
    assert!(revoked.failures.is_empty());
    assert!(h.fleet.client_ids(&Harness::host("a")).is_empty());
    assert!(h.fleet.client_ids(&Harness::host("b")).is_empty());
    assert!(!h.ledger.get_subscription(id).await.unwrap().unwrap().is_active);
}

#[tokio::test]
async fn test_revoke_with_every_node_unreachable_still_deactivates() {
    let h = Harness::new();
    let a = h.add_node("a", 10).await;
    h.add_node("b", 10).await;
    let outcome = h.manager.create(&request(1)).await.unwrap();
    let id = outcome.subscription.id;
    let client_id = outcome.subscription.client_id.clone();
    h.fleet.set_unreachable(&Harness::host("a"), true);
    h.fleet.set_unreachable(&Harness::host("b"), true);

    let revoked = h.manager.revoke(id).await.unwrap();

    assert!(revoked.deactivated);
    assert_eq!(revoked.released, 0);
    assert_eq!(revoked.failures.len(), 2);
    assert!(!h.ledger.get_subscription(id).await.unwrap().unwrap().is_active);

    // The node comes back still serving the id; reconciliation finds and prunes it.
    h.fleet.set_unreachable(&Harness::host("a"), false);
    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &a).await.unwrap();
    assert_eq!(report.stale_on_node, vec![client_id]);
    assert!(!report.is_consistent());

    prune_stale(&h.sync, &a, &report).await.unwrap();
    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &a).await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_revoked_id_left_by_partial_sync_is_pruned() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let c = h.add_node("c", 10).await;
    h.fleet.set_restart_fails(&Harness::host("c"), true);

    let outcome = h.manager.create(&request(1)).await.unwrap();
    let client_id = outcome.subscription.client_id.clone();
    assert!(outcome.grants.iter().all(|g| g.node_id != c.id));
    assert_eq!(outcome.failures[0].kind, "node_sync_partial");
    // Written before the restart failed, so c serves an id it holds no grant for.
    assert_eq!(h.fleet.client_ids(&Harness::host("c")), vec![client_id.clone()]);

    h.fleet.set_restart_fails(&Harness::host("c"), false);
    h.manager.revoke(outcome.subscription.id).await.unwrap();
    assert!(h.fleet.client_ids(&Harness::host("a")).is_empty());

    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &c).await.unwrap();
    assert_eq!(report.stale_on_node, vec![client_id]);
    assert!(report.unknown_on_node.is_empty());

    prune_stale(&h.sync, &c, &report).await.unwrap();
    assert!(h.fleet.client_ids(&Harness::host("c")).is_empty());
    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &c).await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_partial_sync_of_active_subscription_is_not_stale() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let c = h.add_node("c", 10).await;
    h.fleet.set_restart_fails(&Harness::host("c"), true);
    h.manager.create(&request(1)).await.unwrap();
    h.fleet.set_restart_fails(&Harness::host("c"), false);

    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &c).await.unwrap();
    assert!(report.stale_on_node.is_empty());
    assert!(!report.is_consistent());
}

#[tokio::test]
async fn test_revoke_twice_is_noop() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let id = h.manager.create(&request(1)).await.unwrap().subscription.id;

    assert!(h.manager.revoke(id).await.unwrap().deactivated);
    let restarts = h.fleet.snapshot(&Harness::host("a")).restarts;

    let again = h.manager.revoke(id).await.unwrap();
    assert!(!again.deactivated);
    assert_eq!(again.released, 0);
    assert_eq!(h.fleet.snapshot(&Harness::host("a")).restarts, restarts);
}

#[tokio::test]
async fn test_revoke_unknown_subscription() {
    let h = Harness::new();
    let err = h.manager.revoke(404).await.unwrap_err();
    assert!(matches!(err, LifecycleError::SubscriptionNotFound(404)));
}

#[tokio::test]
async fn test_revoked_grants_free_capacity() {
    let h = Harness::new();
    h.add_node("a", 1).await;
    let id = h.manager.create(&request(1)).await.unwrap().subscription.id;
    assert!(matches!(
        h.manager.create(&request(2)).await.unwrap_err(),
        LifecycleError::NoCapacityAvailable
    ));

    h.manager.revoke(id).await.unwrap();
    assert!(h.manager.create(&request(2)).await.is_ok());
}

// ── Sweep ────────────────────────────────────────────────────

#[tokio::test]
async fn test_sweep_twice_second_returns_zero() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    let mut short = request(1);
    short.duration = Duration::days(1);
    h.manager.create(&short).await.unwrap();
    h.manager.create(&request(2)).await.unwrap();

    h.advance(Duration::days(2));
    assert_eq!(h.manager.sweep_expired().await.unwrap(), 1);
    let active = h.ledger.stats().await.unwrap().active_subscriptions;
    assert_eq!(active, 1);

    assert_eq!(h.manager.sweep_expired().await.unwrap(), 0);
    assert_eq!(h.ledger.stats().await.unwrap().active_subscriptions, active);
}

#[tokio::test]
async fn test_sweep_leaves_unexpired_subscriptions() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    h.manager.create(&request(1)).await.unwrap();

    h.advance(Duration::days(29));
    assert_eq!(h.manager.sweep_expired().await.unwrap(), 0);
    h.advance(Duration::days(2));
    assert_eq!(h.manager.sweep_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn test_concurrent_sweeps_count_each_subscription_once() {
    let h = Harness::new();
    h.add_node("a", 10).await;
    h.add_node("b", 10).await;
    for account in 1..=4 {
        let mut req = request(account);
        req.duration = Duration::hours(1);
        h.manager.create(&req).await.unwrap();
    }
    h.advance(Duration::hours(2));

    let (first, second) = tokio::join!(h.manager.sweep_expired(), h.manager.sweep_expired());
    assert_eq!(first.unwrap() + second.unwrap(), 4);
    assert_eq!(h.ledger.stats().await.unwrap().active_subscriptions, 0);
    assert!(h.fleet.client_ids(&Harness::host("a")).is_empty());
}

// ── Pooled draw ──────────────────────────────────────────────

async fn seed_pool(h: &Harness, node_id: i64, ids: &[&str]) {
    let entries: Vec<NewPoolEntry> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| NewPoolEntry {
            client_id: id.to_string(),
            label: format!("pool_{:04}", i + 1),
        })
        .collect();
    h.ledger.import_pool_entries(node_id, &entries).await.unwrap();
}

#[tokio::test]
async fn test_pooled_node_draws_without_touching_node() {
    let h = Harness::with_default_strategy(Strategy::PooledDraw);
    let a = h.add_node("a", 10).await;
    seed_pool(&h, a.id, &["p-1", "p-2"]).await;

    let outcome = h.manager.create(&request(1)).await.unwrap();

    assert_eq!(outcome.grants.len(), 1);
    let grant = &outcome.grants[0];
    assert_eq!(grant.strategy, Strategy::PooledDraw);
    assert_eq!(grant.client_id, "p-1");
    assert_ne!(grant.client_id, outcome.subscription.client_id);
    assert!(grant.access_url.starts_with("vless://p-1@a.fleet.test:443?"));
    let node = h.fleet.snapshot(&Harness::host("a"));
    assert_eq!((node.writes, node.restarts), (0, 0));

    let revoked = h.manager.revoke(outcome.subscription.id).await.unwrap();
    assert_eq!(revoked.released, 1);
    let pool = h.ledger.pool_entries(a.id).await.unwrap();
    assert!(pool.iter().all(|e| !e.is_used));
}

#[tokio::test]
async fn test_pool_entry_is_reused_after_revoke() {
    let h = Harness::with_default_strategy(Strategy::PooledDraw);
    let a = h.add_node("a", 10).await;
    seed_pool(&h, a.id, &["only"]).await;

    let first = h.manager.create(&request(1)).await.unwrap();
    assert!(matches!(
        h.manager.create(&request(2)).await.unwrap_err(),
        LifecycleError::NoAcceptingNode { .. }
    ));

    h.manager.revoke(first.subscription.id).await.unwrap();
    let second = h.manager.create(&request(2)).await.unwrap();
    assert_eq!(second.grants[0].client_id, "only");
}

#[tokio::test]
async fn test_ledger_failure_returns_claimed_pool_entry() {
    let h = Harness::with_default_strategy(Strategy::PooledDraw);
    let a = h.add_node("a", 10).await;
    seed_pool(&h, a.id, &["only"]).await;
    h.ledger.set_fail_writes(true);

    let err = h.manager.create(&request(1)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Ledger(_)));
    let pool = h.ledger.pool_entries(a.id).await.unwrap();
    assert!(pool.iter().all(|e| !e.is_used));

    h.ledger.set_fail_writes(false);
    let outcome = h.manager.create(&request(1)).await.unwrap();
    assert_eq!(outcome.grants[0].client_id, "only");
}

#[tokio::test]
async fn test_mixed_fleet_uses_each_nodes_strategy() {
    let h = Harness::new();
    let live = h.add_node("live", 10).await;
    let pooled = h.add_node_with("pooled", 10, Some(Strategy::PooledDraw)).await;
    let empty = h.add_node_with("empty", 10, Some(Strategy::PooledDraw)).await;
    seed_pool(&h, pooled.id, &["pool-a"]).await;

    let outcome = h.manager.create(&request(1)).await.unwrap();

    let by_node = |id: i64| outcome.grants.iter().find(|g| g.node_id == id);
    assert_eq!(by_node(live.id).unwrap().strategy, Strategy::LiveSync);
    assert_eq!(by_node(pooled.id).unwrap().client_id, "pool-a");
    assert!(by_node(empty.id).is_none());
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].kind, "pool_exhausted");
}

#[tokio::test]
async fn test_reconcile_reports_pool_entries_missing_on_node() {
    let h = Harness::new();
    let a = h.add_node("a", 10).await;
    seed_pool(&h, a.id, &["ghost"]).await;

    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &a).await.unwrap();
    assert_eq!(report.pool_missing_on_node, vec!["ghost".to_string()]);
    assert!(!report.is_consistent());

    let entry = h.sync.client_entry("ghost", "pool_0001");
    h.sync.add_client(&a, &entry).await.unwrap();
    let report = reconcile_node(h.ledger.as_ref(), &h.sync, &a).await.unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.live_clients, 1);
}
