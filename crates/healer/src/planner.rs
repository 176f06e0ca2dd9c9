//! Remediation Planner.
//!
//! A pure function of the event, the resource snapshot, its drift, its
//! healing record, the policy and the clock. Rules are evaluated in order and
//! the first match wins.

use chrono::{DateTime, Utc};
use healer_cloud::{attributes, ResourceKind};

use crate::config::{HealerConfig, StorageGrowth, StoragePolicy, Thresholds};
use crate::error::{HealError, Result};
use crate::types::{
    Decision, DriftDiff, FailureSeverity, HealingAttemptRecord, ManagedResource, MetricKind,
    RemediationAction, TriggerEvent, TriggerKind,
};

/// Statuses during which the provider is already changing the resource.
const TRANSITIONAL_STATUSES: &[&str] = &[
    "pending",
    "stopping",
    "shutting-down",
    "rebooting",
    "modifying",
    "backing-up",
    "creating",
    "deleting",
    "starting",
    "upgrading",
    "storage-optimization",
    "maintenance",
    "failing-over",
    "resetting-master-credentials",
    "renaming",
];

const TERMINAL_STATUSES: &[&str] = &["terminated", "deleted"];

/// Highest rung of the escalation ladder.
const TOP_TIER: u8 = 3;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Inputs to the decision table that come from configuration.
#[derive(Debug, Clone)]
pub struct PlannerPolicy {
    pub ceiling: u32,
    pub cycle_window: chrono::Duration,
    pub thresholds: Thresholds,
    pub storage: StoragePolicy,
}

impl PlannerPolicy {
    pub fn from_config(config: &HealerConfig) -> Self {
        Self {
            ceiling: config.max_healing_attempts,
            cycle_window: config.cycle_window(),
            thresholds: config.thresholds.clone(),
            storage: config.storage.clone(),
        }
    }
}

/// Decide what to do. Returns [`HealError::CeilingReached`] when the
/// ceiling is already reached or healing was given up. Given up is terminal
/// until a reset, whatever the current ceiling.
pub fn plan(
    event: &TriggerEvent,
    resource: &ManagedResource,
    diff: &DriftDiff,
    record: &HealingAttemptRecord,
    policy: &PlannerPolicy,
    now: DateTime<Utc>,
) -> Result<Decision> {
    if record.is_given_up() || record.attempt_count >= policy.ceiling {
        return Err(HealError::CeilingReached {
            attempts: record.attempt_count,
            ceiling: policy.ceiling,
        });
    }

    if event.is_drift_check() && diff.is_empty() {
        return Ok(Decision::NoActionNeeded { notice: None });
    }

    let status = resource.status.as_str();
    if TRANSITIONAL_STATUSES.contains(&status) || TERMINAL_STATUSES.contains(&status) {
        return Ok(notice(format!(
            "resource is {status}, no healing action taken"
        )));
    }

    let trigger = event.kind();
    let kind = resource.resource_kind;

    let decision = match event {
        TriggerEvent::HealthCheckFailure { severity, .. } => {
            let start = match severity {
                FailureSeverity::Low => 1,
                FailureSeverity::High => 2,
            };
            Decision::Act(ladder(resource, trigger, start, record, policy, now))
        }

        TriggerEvent::PerformanceAlarm {
            metric_name,
            observed_value,
            threshold,
            ..
        } => match (MetricKind::classify(metric_name), kind) {
            (MetricKind::Cpu, ResourceKind::Database) => notice(format!(
                "{metric_name} at {observed_value} (threshold {threshold}) on database needs manual investigation"
            )),
            (MetricKind::FreeStorage, ResourceKind::Database) => {
                storage_decision(resource, *observed_value, *threshold, policy)
            }
            (MetricKind::FreeStorage, ResourceKind::Compute) => notice(format!(
                "{metric_name} at {observed_value} on compute instance needs manual intervention"
            )),
            (MetricKind::Connections, _) => notice(format!(
                "{metric_name} at {observed_value} (threshold {threshold}); connection pressure is not healed automatically"
            )),
            (MetricKind::Cpu | MetricKind::Other, _) => {
                Decision::Act(ladder(resource, trigger, 1, record, policy, now))
            }
        },

        TriggerEvent::ScheduledDriftCheck { .. } => {
            Decision::Act(RemediationAction::RevertConfig { diff: diff.clone() })
        }
    };

    Ok(decision)
}

fn notice(text: String) -> Decision {
    Decision::NoActionNeeded { notice: Some(text) }
}

/// Tier for this trigger, escalating past the last ladder action when the
/// same trigger repeats within the cycle window.
pub fn ladder_tier(
    trigger: TriggerKind,
    start_tier: u8,
    record: &HealingAttemptRecord,
    cycle_window: chrono::Duration,
    now: DateTime<Utc>,
) -> u8 {
    let repeated = record.last_trigger == Some(trigger)
        && record
            .last_attempt_at
            .is_some_and(|at| now.signed_duration_since(at) <= cycle_window);

    let escalated = record
        .last_action
        .and_then(|a| a.ladder_tier())
        .filter(|_| repeated)
        .map_or(start_tier, |last| start_tier.max(last + 1));

    escalated.clamp(1, TOP_TIER)
}

fn ladder(
    resource: &ManagedResource,
    trigger: TriggerKind,
    start_tier: u8,
    record: &HealingAttemptRecord,
    policy: &PlannerPolicy,
    now: DateTime<Utc>,
) -> RemediationAction {
    let mut tier = ladder_tier(trigger, start_tier, record, policy.cycle_window, now);

    match resource.resource_kind {
        ResourceKind::Compute => {
            if tier == 1 && resource.is_stopped() {
                tier = 2;
            }
            match tier {
                1 => RemediationAction::Reboot,
                2 => RemediationAction::StopStart,
                _ => RemediationAction::Recreate,
            }
        }
        ResourceKind::Database => {
            if tier == 2 && !resource.is_multi_az() {
                tier = 3;
            }
            match tier {
                1 => RemediationAction::Reboot,
                2 => RemediationAction::FailoverToStandby,
                _ => RemediationAction::RestoreFromSnapshot,
            }
        }
    }
}

/// CloudWatch reports free storage in bytes; small values are already GB.
fn to_gb(value: f64) -> f64 {
    if value >= 1_000_000.0 {
        value / BYTES_PER_GB
    } else {
        value
    }
}

#[allow(clippy::cast_precision_loss)]
fn storage_decision(
    resource: &ManagedResource,
    observed_free: f64,
    alarm_threshold: f64,
    policy: &PlannerPolicy,
) -> Decision {
    let Some(allocated) = resource.current_number(attributes::ALLOCATED_STORAGE) else {
        return notice("allocated storage unknown; manual intervention required".to_string());
    };

    let free = to_gb(observed_free);
    let threshold = if alarm_threshold > 0.0 {
        to_gb(alarm_threshold)
    } else {
        policy.thresholds.free_storage_gb
    };

    let cap = policy.storage.max_allocated_gb;
    let beyond_cap = || {
        notice(format!(
            "storage at {allocated} GB cannot grow enough within the {cap} GB cap; manual intervention required"
        ))
    };

    // Float to int casts saturate; anything at or past the cap never fits.
    let shortfall = (threshold - free).max(0.0).ceil();
    if !shortfall.is_finite() || shortfall >= cap as f64 {
        return beyond_cap();
    }
    let needed = allocated.saturating_add(shortfall as i64).saturating_add(1);
    let min_step = allocated.saturating_add((allocated as f64 * 0.1).ceil() as i64);
    let grown = match policy.storage.growth {
        StorageGrowth::Double => allocated.saturating_mul(2),
        StorageGrowth::Increment { gb } => allocated.saturating_add(gb),
    };

    let target = grown.max(needed).max(min_step).min(cap);
    if target < needed || target <= allocated {
        return beyond_cap();
    }

    Decision::Act(RemediationAction::IncreaseStorage { target_gb: target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, AttemptOutcome};
    use healer_cloud::AttributeValue;
    use std::collections::BTreeMap;

    fn policy() -> PlannerPolicy {
        PlannerPolicy::from_config(&HealerConfig::default())
    }

    fn compute(status: &str) -> ManagedResource {
        ManagedResource {
            resource_id: "i-1".to_string(),
            resource_kind: ResourceKind::Compute,
            status: status.to_string(),
            current_state: BTreeMap::new(),
            desired_state: BTreeMap::new(),
            tags: BTreeMap::new(),
            tag_revision: 0,
        }
    }

    fn database(allocated: i64, multi_az: bool) -> ManagedResource {
        let mut current = BTreeMap::new();
        current.insert(
            attributes::ALLOCATED_STORAGE.to_string(),
            AttributeValue::Number(allocated),
        );
        current.insert(attributes::MULTI_AZ.to_string(), AttributeValue::Flag(multi_az));
        ManagedResource {
            resource_id: "db-1".to_string(),
            resource_kind: ResourceKind::Database,
            status: "available".to_string(),
            current_state: current,
            desired_state: BTreeMap::new(),
            tags: BTreeMap::new(),
            tag_revision: 0,
        }
    }

    fn health(severity: FailureSeverity) -> TriggerEvent {
        TriggerEvent::HealthCheckFailure {
            resource_id: "i-1".to_string(),
            severity,
        }
    }

    fn alarm(metric: &str, observed: f64, threshold: f64) -> TriggerEvent {
        TriggerEvent::PerformanceAlarm {
            resource_id: "db-1".to_string(),
            metric_name: metric.to_string(),
            observed_value: observed,
            threshold,
        }
    }

    fn after(action: ActionKind, count: u32, trigger: TriggerKind, at: DateTime<Utc>) -> HealingAttemptRecord {
        HealingAttemptRecord {
            attempt_count: count,
            last_attempt_at: Some(at),
            last_action: Some(action),
            last_outcome: Some(AttemptOutcome::Failed),
            last_trigger: Some(trigger),
            lease_expires_at: None,
        }
    }

    fn act(decision: Decision) -> RemediationAction {
        match decision {
            Decision::Act(action) => action,
            other => panic!("expected an action, got {other:?}"),
        }
    }

    #[test]
    fn test_ceiling_wins_over_everything() {
        let record = HealingAttemptRecord {
            attempt_count: 3,
            ..HealingAttemptRecord::default()
        };
        let result = plan(
            &health(FailureSeverity::High),
            &compute("running"),
            &DriftDiff::default(),
            &record,
            &policy(),
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(HealError::CeilingReached {
                attempts: 3,
                ceiling: 3
            })
        ));
    }

    #[test]
    fn test_given_up_holds_after_ceiling_is_raised() {
        let mut record = after(ActionKind::StopStart, 3, TriggerKind::HealthCheck, Utc::now());
        record.last_outcome = Some(AttemptOutcome::GivenUp);
        let mut p = policy();
        p.ceiling = 5;

        let result = plan(
            &health(FailureSeverity::Low),
            &compute("running"),
            &DriftDiff::default(),
            &record,
            &p,
            Utc::now(),
        );
        assert!(matches!(
            result,
            Err(HealError::CeilingReached {
                attempts: 3,
                ceiling: 5
            })
        ));
    }

    #[test]
    fn test_empty_drift_check_is_silent() {
        let event = TriggerEvent::ScheduledDriftCheck {
            resource_id: "i-1".to_string(),
        };
        let decision = plan(
            &event,
            &compute("rebooting"),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &policy(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(decision, Decision::NoActionNeeded { notice: None });
    }

    #[test]
    fn test_transitional_status_is_left_alone() {
        let decision = plan(
            &health(FailureSeverity::High),
            &compute("stopping"),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &policy(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            decision,
            Decision::NoActionNeeded {
                notice: Some("resource is stopping, no healing action taken".to_string())
            }
        );
    }

    #[test]
    fn test_escalation_is_monotonic() {
        let now = Utc::now();
        let p = policy();
        let r = compute("running");
        let e = health(FailureSeverity::Low);
        let diff = DriftDiff::default();

        let first = act(plan(&e, &r, &diff, &HealingAttemptRecord::default(), &p, now).unwrap());
        assert_eq!(first, RemediationAction::Reboot);

        let record = after(ActionKind::Reboot, 1, TriggerKind::HealthCheck, now);
        let second = act(plan(&e, &r, &diff, &record, &p, now).unwrap());
        assert_eq!(second, RemediationAction::StopStart);

        let record = after(ActionKind::StopStart, 2, TriggerKind::HealthCheck, now);
        let third = act(plan(&e, &r, &diff, &record, &p, now).unwrap());
        assert_eq!(third, RemediationAction::Recreate);
    }

    #[test]
    fn test_ceiling_scenario_high_severity_after_stop_start() {
        let now = Utc::now();
        let record = after(ActionKind::StopStart, 2, TriggerKind::HealthCheck, now);
        let action = act(plan(
            &health(FailureSeverity::High),
            &compute("running"),
            &DriftDiff::default(),
            &record,
            &policy(),
            now,
        )
        .unwrap());
        assert_eq!(action, RemediationAction::Recreate);
    }

    #[test]
    fn test_escalation_resets_outside_window_or_on_other_trigger() {
        let now = Utc::now();
        let p = policy();
        let stale = after(
            ActionKind::StopStart,
            1,
            TriggerKind::HealthCheck,
            now - chrono::Duration::minutes(90),
        );
        assert_eq!(
            ladder_tier(TriggerKind::HealthCheck, 1, &stale, p.cycle_window, now),
            1
        );

        let other = after(ActionKind::Reboot, 1, TriggerKind::Metric(MetricKind::Cpu), now);
        assert_eq!(
            ladder_tier(TriggerKind::HealthCheck, 1, &other, p.cycle_window, now),
            1
        );

        let top = after(ActionKind::Recreate, 1, TriggerKind::HealthCheck, now);
        assert_eq!(ladder_tier(TriggerKind::HealthCheck, 1, &top, p.cycle_window, now), 3);
    }

    #[test]
    fn test_stopped_instance_skips_reboot() {
        let action = act(plan(
            &health(FailureSeverity::Low),
            &compute("stopped"),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &policy(),
            Utc::now(),
        )
        .unwrap());
        assert_eq!(action, RemediationAction::StopStart);
    }

    #[test]
    fn test_database_ladder_needs_standby_for_failover() {
        let e = TriggerEvent::HealthCheckFailure {
            resource_id: "db-1".to_string(),
            severity: FailureSeverity::High,
        };
        let diff = DriftDiff::default();
        let record = HealingAttemptRecord::default();
        let now = Utc::now();

        let multi = act(plan(&e, &database(20, true), &diff, &record, &policy(), now).unwrap());
        assert_eq!(multi, RemediationAction::FailoverToStandby);

        let single = act(plan(&e, &database(20, false), &diff, &record, &policy(), now).unwrap());
        assert_eq!(single, RemediationAction::RestoreFromSnapshot);
    }

    #[test]
    fn test_storage_scenario() {
        let action = act(plan(
            &alarm("FreeStorageSpace", 4.0, 5.0),
            &database(20, false),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &policy(),
            Utc::now(),
        )
        .unwrap());

        let RemediationAction::IncreaseStorage { target_gb } = action else {
            panic!("expected IncreaseStorage, got {action:?}");
        };
        let free_after = 4 + (target_gb - 20);
        assert!(free_after > 5);
        assert_eq!(target_gb, 40);
    }

    #[test]
    fn test_storage_in_bytes_and_increment_policy() {
        let mut p = policy();
        p.storage.growth = StorageGrowth::Increment { gb: 1 };
        let four_gb = 4.0 * BYTES_PER_GB;
        let five_gb = 5.0 * BYTES_PER_GB;

        let action = act(plan(
            &alarm("FreeStorageSpace", four_gb, five_gb),
            &database(100, false),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &p,
            Utc::now(),
        )
        .unwrap());
        // The 10 % minimum step dominates a 1 GB increment.
        assert_eq!(action, RemediationAction::IncreaseStorage { target_gb: 110 });
    }

    #[test]
    fn test_storage_cap_requires_manual_intervention() {
        let mut p = policy();
        p.storage.max_allocated_gb = 21;
        let decision = plan(
            &alarm("FreeStorageSpace", 1.0, 5.0),
            &database(20, false),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &p,
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(decision, Decision::NoActionNeeded { notice: Some(n) } if n.contains("manual intervention")));
    }

    #[test]
    fn test_storage_with_absurd_threshold_asks_for_intervention() {
        for (observed, threshold) in [(0.0, 1e30), (-1e300, 5.0), (0.0, f64::INFINITY)] {
            let decision = plan(
                &alarm("FreeStorageSpace", observed, threshold),
                &database(20, false),
                &DriftDiff::default(),
                &HealingAttemptRecord::default(),
                &policy(),
                Utc::now(),
            )
            .unwrap();
            assert!(
                matches!(decision, Decision::NoActionNeeded { notice: Some(ref n) } if n.contains("manual intervention")),
                "threshold {threshold}, observed {observed}: {decision:?}"
            );
        }
    }

    #[test]
    fn test_storage_near_integer_limit_does_not_overflow() {
        let mut p = policy();
        p.storage.max_allocated_gb = i64::MAX;
        let action = act(plan(
            &alarm("FreeStorageSpace", 1.0, 5.0),
            &database(i64::MAX - 2, false),
            &DriftDiff::default(),
            &HealingAttemptRecord::default(),
            &p,
            Utc::now(),
        )
        .unwrap());
        assert_eq!(action, RemediationAction::IncreaseStorage { target_gb: i64::MAX });
    }

    #[test]
    fn test_metric_routing() {
        let now = Utc::now();
        let record = HealingAttemptRecord::default();
        let diff = DriftDiff::default();

        let db_cpu = plan(&alarm("CPUUtilization", 95.0, 80.0), &database(20, false), &diff, &record, &policy(), now).unwrap();
        assert!(matches!(db_cpu, Decision::NoActionNeeded { notice: Some(_) }));

        let mut r = compute("running");
        r.resource_id = "db-1".to_string();
        let compute_cpu = act(plan(&alarm("CPUUtilization", 95.0, 80.0), &r, &diff, &record, &policy(), now).unwrap());
        assert_eq!(compute_cpu, RemediationAction::Reboot);

        let conns = plan(&alarm("DatabaseConnections", 150.0, 100.0), &database(20, false), &diff, &record, &policy(), now).unwrap();
        assert!(matches!(conns, Decision::NoActionNeeded { notice: Some(_) }));

        let other = act(plan(&alarm("ReadLatency", 2.0, 1.0), &database(20, false), &diff, &record, &policy(), now).unwrap());
        assert_eq!(other, RemediationAction::Reboot);
    }

    #[test]
    fn test_drift_becomes_revert() {
        let diff = DriftDiff(vec![crate::types::DriftEntry {
            field: attributes::INSTANCE_TYPE.to_string(),
            desired: "t3.micro".into(),
            current: Some("t3.large".into()),
        }]);
        let event = TriggerEvent::ScheduledDriftCheck {
            resource_id: "i-1".to_string(),
        };
        let action = act(plan(
            &event,
            &compute("running"),
            &diff,
            &HealingAttemptRecord::default(),
            &policy(),
            Utc::now(),
        )
        .unwrap());
        assert_eq!(action, RemediationAction::RevertConfig { diff });
    }
}
