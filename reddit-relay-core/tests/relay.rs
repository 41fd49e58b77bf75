mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::{tempdir, TempDir};

use reddit_relay_core::config::RelayConfig;
use reddit_relay_core::contract::{DedupStore, MockDedupStore, MockDestination, MockMediaPreparer, MockSourceClient};
use reddit_relay_core::error::DedupUnavailable;
use reddit_relay_core::model::{Decision, MediaType, PostState};
use reddit_relay_core::relay::{Relay, RelayCollaborators, RelayError, RelayStores};
use reddit_relay_core::store::MemoryStore;

use common::{
    eventually, item, new_rule, ADMIN, FakePreparer, FixedSource, RecordingDestination, RecordingNotifier,
};

struct Setup {
    _dir: TempDir,
    config: RelayConfig,
    stores: RelayStores,
    source: Arc<FixedSource>,
    notifier: Arc<RecordingNotifier>,
    preparer: Arc<FakePreparer>,
    destination: Arc<RecordingDestination>,
}

impl Setup {
    fn new(source: FixedSource) -> Self {
        let dir = tempdir().unwrap();
        let mut config = RelayConfig::default();
        config.pipeline.work_dir = dir.path().join("temp");
        config.pipeline.assets_dir = dir.path().join("assets");
        config.pipeline.max_concurrent_jobs = 4;
        config.lifecycle.sweep_interval = Duration::from_millis(50);
        config.scheduler.shutdown_grace = Duration::from_millis(200);
        config.delivery.retry_delay = Duration::ZERO;
        let preparer = FakePreparer::new(config.pipeline.assets_dir.clone(), Duration::from_millis(20));
        Setup {
            _dir: dir,
            config,
            stores: RelayStores::memory(),
            source: Arc::new(source),
            notifier: Arc::new(RecordingNotifier::default()),
            preparer: Arc::new(preparer),
            destination: Arc::new(RecordingDestination::default()),
        }
    }

    async fn relay(&self) -> Relay {
        let collaborators = RelayCollaborators {
            source: self.source.clone(),
            destination: self.destination.clone(),
            notifier: self.notifier.clone(),
            preparer: self.preparer.clone(),
        };
        Relay::new(self.config.clone(), self.stores.clone(), collaborators)
            .await
            .unwrap()
    }
}

async fn count(relay: &Relay, state: PostState) -> u64 {
    relay.status().await.unwrap().posts_by_state[state.as_str()]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approved_post_is_prepared_and_delivered_exactly_once() {
    let setup = Setup::new(FixedSource::new(vec![
        item("a", MediaType::Video),
        item("b", MediaType::Image),
        item("c", MediaType::Image),
        item("t", MediaType::Text),
    ]));
    let relay = setup.relay().await;
    let rule = relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();
    // "c" was forwarded in an earlier life.
    assert!(setup.stores.dedup.is_new(rule.id, "c", Utc::now()).await.unwrap());

    relay.start().await.unwrap();
    let r = &relay;
    eventually("two posts pending", || async move { count(r, PostState::PendingApproval).await == 2 }).await;

    let presented = setup.notifier.presented();
    assert_eq!(presented.len(), 2);
    relay.resolve(ADMIN, &presented[0], Decision::Approved).await.unwrap();
    relay.resolve(ADMIN, &presented[1], Decision::Rejected).await.unwrap();

    eventually("post forwarded", || async move { count(r, PostState::Forwarded).await == 1 }).await;
    relay.stop().await.unwrap();

    assert_eq!(setup.preparer.calls(), 1);
    let delivered = setup.destination.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "@relay_out");
    assert!(delivered[0].1.files[0].ends_with("encoded.mp4"));
    // Delivered assets are removed.
    assert!(!delivered[0].1.root.exists());

    let status = relay.status().await.unwrap();
    assert_eq!(status.posts_by_state["rejected"], 1);
    assert_eq!(status.per_rule[&rule.id].posts["forwarded"], 1);
    // One cycle only: the interval is five minutes.
    assert_eq!(setup.source.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_rule_never_processes_two_posts_at_once() {
    let ids = ["p1", "p2", "p3"];
    let mut setup = Setup::new(FixedSource::new(ids.iter().map(|id| item(id, MediaType::Video)).collect()));
    setup.config.lifecycle.per_rule_processing_limit = 1;
    setup.preparer = Arc::new(FakePreparer::new(setup.config.pipeline.assets_dir.clone(), Duration::from_millis(80)));
    let relay = setup.relay().await;
    relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();

    relay.start().await.unwrap();
    let r = &relay;
    eventually("three posts pending", || async move { count(r, PostState::PendingApproval).await == 3 }).await;
    for post_id in setup.notifier.presented() {
        relay.resolve(ADMIN, &post_id, Decision::Approved).await.unwrap();
    }

    eventually("all forwarded", || async move { count(r, PostState::Forwarded).await == 3 }).await;
    relay.stop().await.unwrap();

    assert_eq!(setup.preparer.max_running.load(Ordering::SeqCst), 1);
    assert_eq!(setup.destination.delivered().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_fetch_failures_degrade_the_rule_and_tell_its_admin() {
    let mut setup = Setup::new(FixedSource::failing());
    setup.config.scheduler.degraded_after_failures = 3;
    let relay = setup.relay().await;
    let rule = relay.add_rule(new_rule("pics", Duration::from_millis(30))).await.unwrap();

    relay.start().await.unwrap();
    let notifier = Arc::clone(&setup.notifier);
    eventually("admin told about degradation", || {
        let notifier = Arc::clone(&notifier);
        async move { notifier.messages().iter().any(|m| m.contains("degraded")) }
    })
    .await;

    let status = relay.status().await.unwrap();
    relay.stop().await.unwrap();

    let health = &status.per_rule[&rule.id].health;
    assert!(health.degraded);
    assert!(health.consecutive_failures >= 3);
    assert!(health.last_error.as_deref().unwrap().starts_with("FetchError"));
    let degraded: Vec<String> = setup.notifier.messages().into_iter().filter(|m| m.contains("degraded")).collect();
    assert_eq!(degraded.len(), 1);
    assert!(degraded[0].contains("FetchError"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_rule_stops_while_others_keep_running() {
    let setup = Setup::new(FixedSource::new(Vec::new()));
    let relay = setup.relay().await;
    let first = relay.add_rule(new_rule("pics", Duration::from_millis(40))).await.unwrap();
    let second = relay.add_rule(new_rule("aww", Duration::from_millis(40))).await.unwrap();

    relay.start().await.unwrap();
    let source = Arc::clone(&setup.source);
    eventually("several cycles", || {
        let source = Arc::clone(&source);
        async move { source.calls() >= 4 }
    })
    .await;

    relay.set_rule_enabled(first.id, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frozen = relay
        .rules()
        .into_iter()
        .find(|r| r.id == first.id)
        .unwrap()
        .last_checked_at;

    let before = relay.rules().into_iter().find(|r| r.id == second.id).unwrap().last_checked_at;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let rules = relay.rules();
    relay.stop().await.unwrap();

    let first_now = rules.iter().find(|r| r.id == first.id).unwrap();
    let second_now = rules.iter().find(|r| r.id == second.id).unwrap();
    assert!(!first_now.enabled);
    assert_eq!(first_now.last_checked_at, frozen);
    assert!(second_now.last_checked_at > before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_rolls_unfinished_jobs_back_to_approved() {
    let mut setup = Setup::new(FixedSource::new(vec![item("slow", MediaType::Video)]));
    setup.preparer = Arc::new(FakePreparer::new(setup.config.pipeline.assets_dir.clone(), Duration::from_secs(30)));
    let relay = setup.relay().await;
    relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();

    relay.start().await.unwrap();
    let r = &relay;
    eventually("post pending", || async move { count(r, PostState::PendingApproval).await == 1 }).await;
    let post_id = setup.notifier.presented()[0].clone();
    relay.resolve(ADMIN, &post_id, Decision::Approved).await.unwrap();
    eventually("post processing", || async move { count(r, PostState::Processing).await == 1 }).await;

    tokio::time::timeout(Duration::from_secs(5), relay.stop())
        .await
        .expect("stop within grace period")
        .unwrap();

    assert_eq!(relay.admin().post(&post_id).await.unwrap().state, PostState::Approved);
    assert!(setup.destination.delivered().is_empty());
    assert!(matches!(relay.stop().await, Err(RelayError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_delivery_notifies_admin_and_retry_delivers() {
    let mut setup = Setup::new(FixedSource::new(vec![item("x", MediaType::Image)]));
    setup.destination = Arc::new(RecordingDestination {
        permanent_failure: true,
        ..RecordingDestination::default()
    });
    let relay = setup.relay().await;
    relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();

    relay.start().await.unwrap();
    let r = &relay;
    eventually("post pending", || async move { count(r, PostState::PendingApproval).await == 1 }).await;
    let post_id = setup.notifier.presented()[0].clone();
    relay.resolve(ADMIN, &post_id, Decision::Approved).await.unwrap();
    eventually("delivery failed", || async move { count(r, PostState::DeliveryFailed).await == 1 }).await;
    relay.stop().await.unwrap();

    let post = relay.admin().post(&post_id).await.unwrap();
    assert!(post.error.as_deref().unwrap().starts_with("DeliveryFailed"));
    let messages = setup.notifier.messages();
    assert!(messages.iter().any(|m| m.contains("DeliveryFailed") && m.contains("Post x")));

    // Fix the destination and retry on a fresh relay over the same stores.
    setup.destination = Arc::new(RecordingDestination::default());
    let relay = setup.relay().await;
    relay.retry(&post_id).await.unwrap();
    relay.start().await.unwrap();
    let r = &relay;
    eventually("post forwarded", || async move { count(r, PostState::Forwarded).await == 1 }).await;
    relay.stop().await.unwrap();
    assert_eq!(setup.destination.delivered().len(), 1);
}

#[tokio::test]
async fn clear_history_forgets_posts_and_dedup_but_keeps_rules() {
    let setup = Setup::new(FixedSource::new(vec![item("a", MediaType::Image)]));
    let relay = setup.relay().await;
    let rule = relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();
    assert!(setup.stores.dedup.is_new(rule.id, "a", Utc::now()).await.unwrap());
    std::fs::create_dir_all(setup.config.pipeline.assets_dir.join("leftover")).unwrap();
    std::fs::create_dir_all(setup.config.pipeline.work_dir.join("job-old-1234")).unwrap();

    let report = relay.clear_history().await.unwrap();

    assert_eq!(report.dedup_records, 1);
    assert_eq!(report.workspaces, 1);
    assert!(!setup.config.pipeline.assets_dir.exists());
    assert!(setup.stores.dedup.is_new(rule.id, "a", Utc::now()).await.unwrap());
    assert_eq!(relay.rules().len(), 1);
    assert!(relay.rules()[0].last_checked_at.is_none());
}

#[tokio::test]
async fn status_reports_every_state_per_rule() {
    let setup = Setup::new(FixedSource::new(Vec::new()));
    let relay = setup.relay().await;
    let rule = relay.add_rule(new_rule("r/pics", Duration::from_secs(3600))).await.unwrap();

    let status = relay.status().await.unwrap();

    assert!(!status.running);
    assert_eq!(status.rules, 1);
    assert_eq!(status.enabled_rules, 1);
    assert_eq!(status.posts_by_state.len(), PostState::ALL.len());
    assert!(status.posts_by_state.values().all(|n| *n == 0));
    assert_eq!(status.per_rule[&rule.id].subreddit, "pics");
    assert!(!status.per_rule[&rule.id].health.degraded);
}

#[tokio::test]
async fn starting_twice_is_refused() {
    let setup = Setup::new(FixedSource::new(Vec::new()));
    let relay = setup.relay().await;
    relay.start().await.unwrap();
    assert!(matches!(relay.start().await, Err(RelayError::AlreadyRunning)));
    relay.stop().await.unwrap();
    // And it can be started again after a stop.
    relay.start().await.unwrap();
    relay.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_cap_of_one_serialises_posts_from_different_rules() {
    let mut setup = Setup::new(FixedSource::new(vec![item("v", MediaType::Video)]));
    setup.config.pipeline.max_concurrent_jobs = 1;
    setup.preparer = Arc::new(FakePreparer::new(setup.config.pipeline.assets_dir.clone(), Duration::from_millis(80)));
    let relay = setup.relay().await;
    relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();
    relay.add_rule(new_rule("aww", Duration::from_secs(300))).await.unwrap();

    relay.start().await.unwrap();
    let r = &relay;
    // The same item is new for each rule.
    eventually("one post per rule pending", || async move { count(r, PostState::PendingApproval).await == 2 }).await;
    for post_id in setup.notifier.presented() {
        relay.resolve(ADMIN, &post_id, Decision::Approved).await.unwrap();
    }

    eventually("both forwarded", || async move { count(r, PostState::Forwarded).await == 2 }).await;
    relay.stop().await.unwrap();

    assert_eq!(setup.preparer.calls(), 2);
    assert_eq!(setup.preparer.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cycle_ceiling_limits_concurrent_fetches() {
    let mut setup = Setup::new(FixedSource::slow(Vec::new(), Duration::from_millis(100)));
    setup.config.scheduler.max_concurrent_cycles = 1;
    let relay = setup.relay().await;
    for subreddit in ["pics", "aww", "earthporn"] {
        relay.add_rule(new_rule(subreddit, Duration::from_secs(300))).await.unwrap();
    }

    relay.start().await.unwrap();
    let source = Arc::clone(&setup.source);
    eventually("every rule checked", || {
        let source = Arc::clone(&source);
        async move { source.calls() == 3 }
    })
    .await;
    let r = &relay;
    eventually("every check recorded", || async move {
        r.rules().iter().all(|rule| rule.last_checked_at.is_some())
    })
    .await;
    relay.stop().await.unwrap();

    assert_eq!(setup.source.max_running.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dedup_outage_aborts_only_the_affected_rule() {
    let setup = Setup::new(FixedSource::new(Vec::new()));
    let memory = Arc::new(MemoryStore::new());

    let mut dedup = MockDedupStore::new();
    dedup.expect_is_new().returning(|rule, _, _| {
        if rule == 1 {
            Err(DedupUnavailable("database is locked".to_string()))
        } else {
            Ok(true)
        }
    });
    dedup.expect_purge_older_than().returning(|_| Ok(0));
    let stores = RelayStores {
        dedup: Arc::new(dedup),
        posts: memory.clone(),
        rules: memory,
    };

    let mut source = MockSourceClient::new();
    source
        .expect_fetch_candidates()
        .returning(|_| Ok(vec![item("a", MediaType::Image)]));
    let mut preparer = MockMediaPreparer::new();
    preparer.expect_prepare().never();
    let mut destination = MockDestination::new();
    destination.expect_deliver().never();

    let collaborators = RelayCollaborators {
        source: Arc::new(source),
        destination: Arc::new(destination),
        notifier: setup.notifier.clone(),
        preparer: Arc::new(preparer),
    };
    let relay = Relay::new(setup.config.clone(), stores, collaborators).await.unwrap();
    let broken = relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();
    let healthy = relay.add_rule(new_rule("aww", Duration::from_secs(300))).await.unwrap();
    let (broken, healthy) = (broken.id, healthy.id);
    assert_eq!(broken, 1);

    relay.start().await.unwrap();
    let r = &relay;
    eventually("broken rule failed and healthy rule presented", || async move {
        let status = r.status().await.unwrap();
        status.per_rule[&broken].health.consecutive_failures == 1
            && status.per_rule[&healthy].posts["pending_approval"] == 1
    })
    .await;
    let status = relay.status().await.unwrap();
    relay.stop().await.unwrap();

    let broken_status = &status.per_rule[&broken];
    assert!(broken_status.health.last_error.as_deref().unwrap().starts_with("DedupUnavailable"));
    assert!(broken_status.posts.values().all(|n| *n == 0));
    assert!(status.per_rule[&healthy].health.last_error.is_none());
    assert_eq!(setup.notifier.presented().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn re_enabling_a_rule_mid_cycle_does_not_start_a_second_cycle() {
    let setup = Setup::new(FixedSource::slow(Vec::new(), Duration::from_millis(300)));
    let relay = setup.relay().await;
    let rule = relay.add_rule(new_rule("pics", Duration::from_secs(300))).await.unwrap();

    relay.start().await.unwrap();
    let source = Arc::clone(&setup.source);
    eventually("first fetch under way", || {
        let source = Arc::clone(&source);
        async move { source.calls() == 1 }
    })
    .await;

    relay.set_rule_enabled(rule.id, false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    relay.set_rule_enabled(rule.id, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let checked = relay.rules()[0].last_checked_at;
    relay.stop().await.unwrap();

    assert_eq!(setup.source.calls(), 1);
    assert_eq!(setup.source.max_running.load(Ordering::SeqCst), 1);
    assert!(checked.is_some());
}

#[tokio::test]
async fn zero_sweep_interval_is_refused() {
    let mut setup = Setup::new(FixedSource::new(Vec::new()));
    setup.config.lifecycle.sweep_interval = Duration::ZERO;
    let collaborators = RelayCollaborators {
        source: setup.source.clone(),
        destination: setup.destination.clone(),
        notifier: setup.notifier.clone(),
        preparer: setup.preparer.clone(),
    };

    let refused = Relay::new(setup.config.clone(), setup.stores.clone(), collaborators).await;

    match refused {
        Err(RelayError::Config(e)) => assert_eq!(e.field, "lifecycle.sweep_interval_secs"),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("relay accepted a zero sweep interval"),
    }
}
