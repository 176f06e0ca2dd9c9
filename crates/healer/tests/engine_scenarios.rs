//! End-to-end invocations against the simulated cloud.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use healer::config::ResourceBaseline;
use healer::retry::RetryPolicy;
use healer::store::{keys, MetadataSnapshot};
use healer::{
    ActionKind, Engine, FileStore, HealError, HealerConfig, InvocationStatus, MemoryStore,
    MetadataStore, ResourceTagStore, StoreError, TriggerEvent,
};
use healer::types::FailureSeverity;
use healer_cloud::memory::{compute_instance, database_instance, SimulatedCloud};
use healer_cloud::{attributes, AttributeValue, CloudProvider, ResourceKind};
use healer_notify::{ChannelError, HealingMessage, Notifier, NotifyChannel, Outcome};
use mockall::mock;
use serde_json::json;

mock! {
    Channel {}

    #[async_trait]
    impl NotifyChannel for Channel {
        fn name(&self) -> &'static str;
        fn enabled(&self) -> bool;
        async fn send(&self, message: &HealingMessage) -> Result<(), ChannelError>;
    }
}

type Sent = Arc<Mutex<Vec<HealingMessage>>>;

fn recording_notifier() -> (Notifier, Sent) {
    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let sink = sent.clone();

    let mut channel = MockChannel::new();
    channel.expect_name().return_const("recorder");
    channel.expect_enabled().return_const(true);
    channel.expect_send().returning(move |message| {
        sink.lock().unwrap().push(message.clone());
        Ok(())
    });

    let notifier = Notifier::with_channels(vec![Arc::new(channel)]).with_retry_delay(Duration::ZERO);
    (notifier, sent)
}

fn outcomes(sent: &Sent) -> Vec<Outcome> {
    sent.lock().unwrap().iter().map(|m| m.outcome).collect()
}

fn compute_baseline(id: &str) -> ResourceBaseline {
    let mut desired = BTreeMap::new();
    desired.insert(attributes::INSTANCE_TYPE.to_string(), AttributeValue::from("t3.micro"));
    desired.insert(attributes::IMAGE_ID.to_string(), AttributeValue::from("ami-1"));
    ResourceBaseline {
        resource_id: id.to_string(),
        resource_kind: ResourceKind::Compute,
        desired_state: desired,
    }
}

fn database_baseline(id: &str, storage_gb: i64) -> ResourceBaseline {
    let mut desired = BTreeMap::new();
    desired.insert(attributes::INSTANCE_CLASS.to_string(), AttributeValue::from("db.t3.micro"));
    desired.insert(attributes::ALLOCATED_STORAGE.to_string(), AttributeValue::Number(storage_gb));
    ResourceBaseline {
        resource_id: id.to_string(),
        resource_kind: ResourceKind::Database,
        desired_state: desired,
    }
}

fn config(resources: Vec<ResourceBaseline>) -> HealerConfig {
    HealerConfig {
        healing_timeout_seconds: 5,
        poll_interval_seconds: 0,
        retry: RetryPolicy {
            attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        resources,
        ..HealerConfig::default()
    }
}

struct Harness {
    cloud: Arc<SimulatedCloud>,
    store: Arc<MemoryStore>,
    sent: Sent,
    engine: Engine,
}

fn harness(cloud: SimulatedCloud, config: HealerConfig) -> Harness {
    let cloud = Arc::new(cloud);
    let store = Arc::new(MemoryStore::new());
    let (notifier, sent) = recording_notifier();
    let engine = Engine::new(config, cloud.clone(), store.clone(), notifier);
    Harness {
        cloud,
        store,
        sent,
        engine,
    }
}

fn health_check(id: &str, severity: FailureSeverity) -> TriggerEvent {
    TriggerEvent::HealthCheckFailure {
        resource_id: id.to_string(),
        severity,
    }
}

fn drift_check(id: &str) -> TriggerEvent {
    TriggerEvent::ScheduledDriftCheck {
        resource_id: id.to_string(),
    }
}

fn seeded_record(count: u32, action: ActionKind) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(keys::ATTEMPTS.to_string(), count.to_string());
    tags.insert(keys::LAST_ACTION.to_string(), action.as_str().to_string());
    tags.insert(keys::LAST_OUTCOME.to_string(), "failed".to_string());
    tags.insert(keys::LAST_TRIGGER.to_string(), "health_check".to_string());
    tags.insert(
        keys::LAST_HEALED.to_string(),
        (Utc::now() - chrono::Duration::minutes(2)).to_rfc3339(),
    );
    tags
}

#[tokio::test]
async fn test_ceiling_scenario_compute() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    h.store.seed("i-1", seeded_record(2, ActionKind::StopStart));

    let report = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::High))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::GivenUp);
    assert_eq!(report.action, Some(ActionKind::Recreate));
    assert_eq!(report.attempt_count, 3);
    assert!(report.detail.starts_with("healing ceiling reached"));
    assert_eq!(h.cloud.call_count("replace_root_volume"), 1);

    let tags = h.store.snapshot("i-1").tags;
    assert_eq!(tags.get(keys::ATTEMPTS).map(String::as_str), Some("3"));
    assert_eq!(tags.get(keys::LAST_OUTCOME).map(String::as_str), Some("given_up"));
    assert!(!tags.contains_key(keys::LEASE_UNTIL));

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].outcome, Outcome::GivenUp);
    assert_eq!(sent[0].action, "recreate");
    assert!(sent[0].detail.contains("healing ceiling reached"));
}

#[tokio::test]
async fn test_ceiling_scenario_database_without_standby() {
    let h = harness(
        SimulatedCloud::new().with_resource(database_instance("orders-db", "db.t3.micro", 20)),
        config(vec![database_baseline("orders-db", 20)]),
    );
    h.store.seed("orders-db", seeded_record(2, ActionKind::Reboot));

    let report = h
        .engine
        .handle(&health_check("orders-db", FailureSeverity::High))
        .await
        .unwrap();

    assert_eq!(report.action, Some(ActionKind::RestoreFromSnapshot));
    assert_eq!(report.status, InvocationStatus::GivenUp);
    assert!(h.cloud.resource("orders-db-restored").is_some());
    assert_eq!(h.cloud.call_count("reboot_db_instance"), 0);
}

#[tokio::test]
async fn test_given_up_resource_is_never_mutated() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    let mut tags = seeded_record(3, ActionKind::Recreate);
    tags.insert(keys::LAST_OUTCOME.to_string(), "given_up".to_string());
    h.store.seed("i-1", tags);

    for _ in 0..2 {
        let report = h
            .engine
            .handle(&health_check("i-1", FailureSeverity::Low))
            .await
            .unwrap();
        assert_eq!(report.status, InvocationStatus::GivenUp);
        assert_eq!(report.attempt_count, 3);
    }

    let mutating: Vec<String> = h
        .cloud
        .calls()
        .into_iter()
        .filter(|c| !c.starts_with("describe:"))
        .collect();
    assert!(mutating.is_empty(), "unexpected calls: {mutating:?}");
    assert_eq!(h.store.write_count(), 0);
    assert!(h.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_given_up_holds_when_ceiling_is_raised() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        HealerConfig {
            max_healing_attempts: 5,
            ..config(vec![compute_baseline("i-1")])
        },
    );
    let mut tags = seeded_record(3, ActionKind::Recreate);
    tags.insert(keys::LAST_OUTCOME.to_string(), "given_up".to_string());
    h.store.seed("i-1", tags);

    let report = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::GivenUp);
    assert_eq!(report.action, None);
    assert_eq!(report.attempt_count, 3);
    assert_eq!(h.cloud.calls(), vec!["describe:i-1".to_string()]);
    assert_eq!(h.store.write_count(), 0);
    assert!(h.sent.lock().unwrap().is_empty());

    // Only a reset lets healing resume.
    h.engine.reset("i-1").await.unwrap();
    let resumed = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();
    assert_eq!(resumed.status, InvocationStatus::Healed);
    assert_eq!(resumed.action, Some(ActionKind::Reboot));
}

#[tokio::test]
async fn test_lowered_ceiling_marks_given_up_once() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        HealerConfig {
            max_healing_attempts: 1,
            ..config(vec![compute_baseline("i-1")])
        },
    );
    h.store.seed("i-1", seeded_record(2, ActionKind::StopStart));

    let first = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();
    let second = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();

    assert_eq!(first.status, InvocationStatus::GivenUp);
    assert_eq!(second.status, InvocationStatus::GivenUp);
    assert_eq!(outcomes(&h.sent), vec![Outcome::GivenUp]);
    assert_eq!(
        h.store.snapshot("i-1").tags.get(keys::ATTEMPTS).map(String::as_str),
        Some("2")
    );
}

#[tokio::test]
async fn test_escalation_across_invocations() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    h.cloud.fail_next("reboot_instance", 1, 400);

    let event = health_check("i-1", FailureSeverity::Low);

    let first = h.engine.handle(&event).await.unwrap();
    assert_eq!(first.action, Some(ActionKind::Reboot));
    assert_eq!(first.status, InvocationStatus::Failed);
    assert_eq!(first.attempt_count, 1);

    let second = h.engine.handle(&event).await.unwrap();
    assert_eq!(second.action, Some(ActionKind::StopStart));
    assert_eq!(second.status, InvocationStatus::Healed);
    assert_eq!(second.attempt_count, 2);

    let third = h.engine.handle(&event).await.unwrap();
    assert_eq!(third.action, Some(ActionKind::Recreate));
    assert_eq!(third.status, InvocationStatus::GivenUp);
    assert_eq!(third.attempt_count, 3);

    assert_eq!(
        outcomes(&h.sent),
        vec![Outcome::Failed, Outcome::Success, Outcome::GivenUp]
    );
    let counts: Vec<u32> = h.sent.lock().unwrap().iter().map(|m| m.attempt_count).collect();
    assert_eq!(counts, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_storage_scenario() {
    let h = harness(
        SimulatedCloud::new().with_resource(database_instance("orders-db", "db.t3.micro", 20)),
        config(vec![database_baseline("orders-db", 20)]),
    );

    let observed_free = 4.0;
    let report = h
        .engine
        .handle(&TriggerEvent::PerformanceAlarm {
            resource_id: "orders-db".to_string(),
            metric_name: "FreeStorageSpace".to_string(),
            observed_value: observed_free,
            threshold: 5.0,
        })
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::Healed);
    assert_eq!(report.action, Some(ActionKind::IncreaseStorage));

    let db = h.cloud.resource("orders-db").unwrap();
    let allocated = db
        .attributes
        .get(attributes::ALLOCATED_STORAGE)
        .and_then(AttributeValue::as_number)
        .unwrap();
    assert_eq!(allocated, 40);
    let free_after = observed_free + (allocated - 20) as f64;
    assert!(free_after > 5.0);

    // The new allocation becomes the baseline, so the next drift check is quiet.
    let tags = h.store.snapshot("orders-db").tags;
    assert_eq!(
        tags.get(&keys::desired(attributes::ALLOCATED_STORAGE)).map(String::as_str),
        Some("40")
    );

    let writes = h.store.write_count();
    let drift = h.engine.handle(&drift_check("orders-db")).await.unwrap();
    assert_eq!(drift.status, InvocationStatus::NoAction);
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn test_equal_state_writes_nothing() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );

    let report = h.engine.handle(&drift_check("i-1")).await.unwrap();

    assert_eq!(report.status, InvocationStatus::NoAction);
    assert_eq!(report.action, None);
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.cloud.calls(), vec!["describe:i-1".to_string()]);
    assert!(h.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_drift_is_reverted_once() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    h.cloud
        .set_attribute("i-1", attributes::INSTANCE_TYPE, AttributeValue::from("t3.xlarge"));

    let report = h.engine.handle(&drift_check("i-1")).await.unwrap();
    assert_eq!(report.status, InvocationStatus::Healed);
    assert_eq!(report.action, Some(ActionKind::RevertConfig));
    assert_eq!(
        h.cloud.resource("i-1").unwrap().attributes.get(attributes::INSTANCE_TYPE),
        Some(&AttributeValue::from("t3.micro"))
    );
    assert_eq!(outcomes(&h.sent), vec![Outcome::DriftDetected]);

    let again = h.engine.handle(&drift_check("i-1")).await.unwrap();
    assert_eq!(again.status, InvocationStatus::NoAction);
    assert_eq!(h.cloud.call_count("modify_instance_type"), 1);
}

#[tokio::test]
async fn test_unrevertible_drift_fails_and_counts() {
    let h = harness(
        SimulatedCloud::new().with_resource(database_instance("orders-db", "db.t3.micro", 20)),
        config(vec![database_baseline("orders-db", 20)]),
    );
    h.store.seed("orders-db", {
        let mut tags = BTreeMap::new();
        tags.insert(
            keys::desired(attributes::ENGINE_VERSION),
            serde_json::to_string(&AttributeValue::from("14.9")).unwrap(),
        );
        tags
    });

    let report = h.engine.handle(&drift_check("orders-db")).await.unwrap();

    assert_eq!(report.status, InvocationStatus::Failed);
    assert_eq!(report.attempt_count, 1);
    assert!(report.detail.contains("engineVersion"));
    assert_eq!(h.cloud.call_count("modify_db_instance"), 0);
}

#[tokio::test]
async fn test_held_lease_skips_without_acting() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    let mut tags = BTreeMap::new();
    tags.insert(
        keys::LEASE_UNTIL.to_string(),
        (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339(),
    );
    h.store.seed("i-1", tags);

    let report = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::Skipped);
    assert_eq!(h.cloud.call_count("reboot_instance"), 0);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    let mut tags = BTreeMap::new();
    tags.insert(
        keys::LEASE_UNTIL.to_string(),
        (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339(),
    );
    h.store.seed("i-1", tags);

    let report = h
        .engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::Healed);
    assert_eq!(h.cloud.call_count("reboot_instance"), 1);
}

#[tokio::test]
async fn test_notification_failure_does_not_block_healing() {
    let cloud = Arc::new(SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")));
    let store = Arc::new(MemoryStore::new());

    let mut channel = MockChannel::new();
    channel.expect_name().return_const("broken");
    channel.expect_enabled().return_const(true);
    channel
        .expect_send()
        .times(2)
        .returning(|_| Err(ChannelError::Other("endpoint down".to_string())));
    let notifier = Notifier::with_channels(vec![Arc::new(channel)]).with_retry_delay(Duration::ZERO);

    let engine = Engine::new(config(vec![compute_baseline("i-1")]), cloud.clone(), store.clone(), notifier);
    let report = engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::Healed);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(
        store.snapshot("i-1").tags.get(keys::LAST_OUTCOME).map(String::as_str),
        Some("success")
    );
}

#[tokio::test]
async fn test_missing_resource_reports_not_found() {
    let h = harness(SimulatedCloud::new(), config(vec![compute_baseline("i-gone")]));

    let report = h
        .engine
        .handle(&health_check("i-gone", FailureSeverity::High))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::NotFound);
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(outcomes(&h.sent), vec![Outcome::NotFound]);
}

#[tokio::test]
async fn test_transient_describe_errors_are_retried_then_surface() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );

    h.cloud.fail_next("describe", 2, 503);
    let report = h.engine.handle(&drift_check("i-1")).await.unwrap();
    assert_eq!(report.status, InvocationStatus::NoAction);

    h.cloud.fail_next("describe", 5, 503);
    let err = h.engine.handle(&drift_check("i-1")).await.unwrap_err();
    assert!(matches!(err, HealError::TransientApi(_)));
    assert_eq!(h.store.write_count(), 0);

    let sent = h.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].outcome, Outcome::Failed);
    assert!(sent[0].detail.contains("could not be read"));
}

#[tokio::test]
async fn test_database_cpu_alarm_is_a_notice() {
    let h = harness(
        SimulatedCloud::new().with_resource(database_instance("orders-db", "db.t3.micro", 20)),
        config(vec![database_baseline("orders-db", 20)]),
    );

    let report = h
        .engine
        .handle(&TriggerEvent::PerformanceAlarm {
            resource_id: "orders-db".to_string(),
            metric_name: "CPUUtilization".to_string(),
            observed_value: 97.0,
            threshold: 80.0,
        })
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::NoAction);
    assert_eq!(outcomes(&h.sent), vec![Outcome::NoActionNeeded]);
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn test_eventbridge_payloads_end_to_end() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-0abc", "t3.micro", "ami-1")),
        HealerConfig {
            default_resource_id: Some("i-0abc".to_string()),
            ..config(vec![compute_baseline("i-0abc")])
        },
    );

    let alarm = |state: &str| {
        json!({
            "source": "aws.cloudwatch",
            "detail-type": "CloudWatch Alarm State Change",
            "detail": {
                "alarmName": "web-status-check",
                "state": { "value": state, "reasonData": "{}" },
                "configuration": {
                    "metrics": [{ "metricStat": { "metric": {
                        "name": "StatusCheckFailed",
                        "dimensions": { "InstanceId": "i-0abc" }
                    } } }]
                }
            }
        })
    };

    let ok = h.engine.handle_payload(&alarm("OK")).await.unwrap();
    assert_eq!(ok.status, InvocationStatus::NoAction);
    assert_eq!(h.cloud.call_count("describe"), 0);

    let fired = h.engine.handle_payload(&alarm("ALARM")).await.unwrap();
    assert_eq!(fired.status, InvocationStatus::Healed);
    assert_eq!(fired.action, Some(ActionKind::Reboot));

    let scheduled = json!({ "source": "aws.events", "detail-type": "Scheduled Event", "detail": {} });
    let drift = h.engine.handle_payload(&scheduled).await.unwrap();
    assert_eq!(drift.status, InvocationStatus::NoAction);
    assert_eq!(drift.resource_id, "i-0abc");
}

#[tokio::test]
async fn test_file_store_carries_history_between_engines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let cloud = Arc::new(SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")));
    cloud.fail_next("reboot_instance", 1, 400);

    let engine = |cloud: Arc<SimulatedCloud>| {
        let store: Arc<dyn MetadataStore> = Arc::new(FileStore::new(path.clone()));
        let provider: Arc<dyn CloudProvider> = cloud;
        Engine::new(config(vec![compute_baseline("i-1")]), provider, store, Notifier::disabled())
    };

    let event = health_check("i-1", FailureSeverity::Low);
    let first = engine(cloud.clone()).handle(&event).await.unwrap();
    assert_eq!(first.status, InvocationStatus::Failed);

    let second = engine(cloud.clone()).handle(&event).await.unwrap();
    assert_eq!(second.action, Some(ActionKind::StopStart));
    assert_eq!(second.attempt_count, 2);

    let fresh = engine(cloud.clone());
    let record = fresh.status("i-1").await.unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.last_action, Some(ActionKind::StopStart));

    fresh.reset("i-1").await.unwrap();
    assert_eq!(fresh.status("i-1").await.unwrap().attempt_count, 0);
}

#[tokio::test]
async fn test_preview_never_acts() {
    let h = harness(
        SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")),
        config(vec![compute_baseline("i-1")]),
    );
    h.cloud
        .set_attribute("i-1", attributes::INSTANCE_TYPE, AttributeValue::from("t3.xlarge"));

    let preview = h.engine.preview(&drift_check("i-1")).await.unwrap();

    assert_eq!(preview.drift.fields(), vec!["instanceType"]);
    assert!(preview.detail.starts_with("would execute revert_config"));
    assert_eq!(h.cloud.call_count("modify_instance_type"), 0);
    assert_eq!(h.store.write_count(), 0);
}

/// Memory store whose Nth write fails with an I/O error.
struct FailingStore {
    inner: MemoryStore,
    fail_on: u64,
    writes: AtomicU64,
}

impl FailingStore {
    fn failing_write(fail_on: u64) -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_on,
            writes: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl MetadataStore for FailingStore {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn read(&self, resource_id: &str, kind: ResourceKind) -> Result<MetadataSnapshot, StoreError> {
        self.inner.read(resource_id, kind).await
    }

    async fn write(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        expected_revision: u64,
        updates: &BTreeMap<String, String>,
        removals: &[String],
    ) -> Result<u64, StoreError> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner
            .write(resource_id, kind, expected_revision, updates, removals)
            .await
    }
}

#[tokio::test]
async fn test_unrecorded_attempt_is_still_reported() {
    let cloud = Arc::new(SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")));
    // Write 1 claims the lease, write 2 records the attempt.
    let store = Arc::new(FailingStore::failing_write(2));
    let (notifier, sent) = recording_notifier();
    let engine = Engine::new(config(vec![compute_baseline("i-1")]), cloud.clone(), store, notifier);

    let err = engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap_err();

    assert!(matches!(err, HealError::Store(StoreError::Io(_))));
    assert_eq!(cloud.call_count("reboot_instance"), 1);

    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].outcome, Outcome::Failed);
    assert_eq!(sent[0].action, "reboot");
    assert_eq!(sent[0].attempt_count, 1);
    assert!(sent[0].detail.contains("could not be recorded"));
}

fn tag_engine(cloud: &Arc<SimulatedCloud>, config: HealerConfig) -> (Engine, Sent) {
    let store = Arc::new(ResourceTagStore::new(cloud.clone()).with_retry(config.retry.clone()));
    let (notifier, sent) = recording_notifier();
    (Engine::new(config, cloud.clone(), store, notifier), sent)
}

#[tokio::test]
async fn test_tag_backed_heal_writes_record_to_resource() {
    let cloud = Arc::new(SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")));
    let (engine, sent) = tag_engine(&cloud, config(vec![compute_baseline("i-1")]));

    let quiet = engine.handle(&drift_check("i-1")).await.unwrap();
    assert_eq!(quiet.status, InvocationStatus::NoAction);
    // Attributes and tags come from one describe.
    assert_eq!(cloud.calls(), vec!["describe:i-1".to_string()]);

    let report = engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();
    assert_eq!(report.status, InvocationStatus::Healed);
    assert_eq!(report.action, Some(ActionKind::Reboot));

    let tags = cloud.resource("i-1").unwrap().tags;
    assert_eq!(tags.get(keys::ATTEMPTS).map(String::as_str), Some("1"));
    assert_eq!(tags.get(keys::LAST_OUTCOME).map(String::as_str), Some("success"));
    assert_eq!(tags.get(keys::REVISION).map(String::as_str), Some("2"));
    assert!(!tags.contains_key(keys::LEASE_UNTIL));
    assert_eq!(outcomes(&sent), vec![Outcome::Success]);
}

#[tokio::test]
async fn test_tag_backed_writes_back_off_on_throttling() {
    let cloud = Arc::new(SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")));
    let (engine, sent) = tag_engine(&cloud, config(vec![compute_baseline("i-1")]));
    cloud.fail_next("create_tags", 1, 503);
    cloud.fail_next("delete_tags", 2, 429);

    let report = engine
        .handle(&health_check("i-1", FailureSeverity::Low))
        .await
        .unwrap();

    assert_eq!(report.status, InvocationStatus::Healed);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(cloud.call_count("reboot_instance"), 1);
    // Two tag writes (lease, record), plus one retried create and two retried deletes.
    assert_eq!(cloud.call_count("create_tags"), 3);
    assert_eq!(cloud.call_count("delete_tags"), 4);
    assert_eq!(
        cloud.resource("i-1").unwrap().tags.get(keys::ATTEMPTS).map(String::as_str),
        Some("1")
    );
    assert_eq!(outcomes(&sent), vec![Outcome::Success]);
}

#[tokio::test]
async fn test_tag_backed_history_survives_new_engines() {
    let cloud = Arc::new(SimulatedCloud::new().with_resource(compute_instance("i-1", "t3.micro", "ami-1")));
    cloud.fail_next("reboot_instance", 1, 400);
    let event = health_check("i-1", FailureSeverity::Low);

    let (first_engine, _) = tag_engine(&cloud, config(vec![compute_baseline("i-1")]));
    let first = first_engine.handle(&event).await.unwrap();
    assert_eq!(first.status, InvocationStatus::Failed);
    drop(first_engine);

    let (second_engine, _) = tag_engine(&cloud, config(vec![compute_baseline("i-1")]));
    let second = second_engine.handle(&event).await.unwrap();
    assert_eq!(second.action, Some(ActionKind::StopStart));
    assert_eq!(second.attempt_count, 2);

    let tags = cloud.resource("i-1").unwrap().tags;
    assert_eq!(tags.get(keys::REVISION).map(String::as_str), Some("4"));

    let (third_engine, _) = tag_engine(&cloud, config(vec![compute_baseline("i-1")]));
    let record = third_engine.status("i-1").await.unwrap();
    assert_eq!(record.attempt_count, 2);
    assert_eq!(record.last_action, Some(ActionKind::StopStart));

    third_engine.reset("i-1").await.unwrap();
    let tags = cloud.resource("i-1").unwrap().tags;
    assert!(!tags.contains_key(keys::ATTEMPTS));
    assert_eq!(third_engine.status("i-1").await.unwrap().attempt_count, 0);
}
