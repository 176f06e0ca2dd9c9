//! Invocation payload parsing.
//!
//! Two shapes are accepted: the engine's own event
//! (`{resourceId, triggerKind, ...}`) and raw EventBridge envelopes as
//! delivered by alarm state changes and schedules.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{HealError, Result};
use crate::types::{FailureSeverity, TriggerEvent};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectEvent {
    resource_id: Option<String>,
    trigger_kind: String,
    severity: Option<String>,
    metric_name: Option<String>,
    observed_value: Option<f64>,
    threshold: Option<f64>,
}

/// Parse an invocation payload.
///
/// Returns `Ok(None)` for events that need no handling (alarm transitions
/// back to `OK` or to insufficient data).
pub fn parse_event(payload: &Value, default_resource_id: Option<&str>) -> Result<Option<TriggerEvent>> {
    if payload.get("triggerKind").is_some() {
        let direct: DirectEvent = serde_json::from_value(payload.clone())
            .map_err(|e| HealError::InvalidEvent(e.to_string()))?;
        return parse_direct(direct, default_resource_id).map(Some);
    }

    let detail_type = payload.get("detail-type").and_then(Value::as_str);
    if detail_type == Some("CloudWatch Alarm State Change") {
        return parse_alarm(payload, default_resource_id);
    }

    let resource_id = payload
        .get("resourceId")
        .and_then(Value::as_str)
        .or(default_resource_id)
        .ok_or_else(|| HealError::InvalidEvent("no resource id in event or configuration".to_string()))?;

    debug!(detail_type = detail_type.unwrap_or("none"), "Treating event as a scheduled drift check");
    Ok(Some(TriggerEvent::ScheduledDriftCheck {
        resource_id: resource_id.to_string(),
    }))
}

fn resolve_id(id: Option<String>, default_resource_id: Option<&str>) -> Result<String> {
    id.filter(|s| !s.is_empty())
        .or_else(|| default_resource_id.map(str::to_string))
        .ok_or_else(|| HealError::InvalidEvent("no resource id in event or configuration".to_string()))
}

fn parse_direct(event: DirectEvent, default_resource_id: Option<&str>) -> Result<TriggerEvent> {
    let resource_id = resolve_id(event.resource_id, default_resource_id)?;

    match event.trigger_kind.as_str() {
        "health_check_failure" => {
            let severity = match event.severity {
                Some(s) => s.parse().map_err(HealError::InvalidEvent)?,
                None => FailureSeverity::Low,
            };
            Ok(TriggerEvent::HealthCheckFailure {
                resource_id,
                severity,
            })
        }
        "performance_alarm" => {
            let metric_name = event.metric_name.ok_or_else(|| {
                HealError::InvalidEvent("performance_alarm requires metricName".to_string())
            })?;
            let observed_value = event.observed_value.ok_or_else(|| {
                HealError::InvalidEvent("performance_alarm requires observedValue".to_string())
            })?;
            Ok(TriggerEvent::PerformanceAlarm {
                resource_id,
                metric_name,
                observed_value,
                threshold: event.threshold.unwrap_or(0.0),
            })
        }
        "scheduled_drift_check" => Ok(TriggerEvent::ScheduledDriftCheck { resource_id }),
        other => Err(HealError::InvalidEvent(format!("unknown triggerKind: {other}"))),
    }
}

/// First metric of the alarm configuration, if any.
fn alarm_metric(detail: &Value) -> Option<&Value> {
    detail
        .pointer("/configuration/metrics/0/metricStat/metric")
        .filter(|m| m.is_object())
}

fn parse_alarm(payload: &Value, default_resource_id: Option<&str>) -> Result<Option<TriggerEvent>> {
    let detail = payload
        .get("detail")
        .ok_or_else(|| HealError::InvalidEvent("alarm event without detail".to_string()))?;

    let state = detail
        .pointer("/state/value")
        .and_then(Value::as_str)
        .unwrap_or("ALARM");
    let alarm_name = detail
        .get("alarmName")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if state != "ALARM" {
        debug!(alarm_name, state, "Alarm not in ALARM state, ignoring");
        return Ok(None);
    }

    let metric = alarm_metric(detail);
    let metric_name = metric
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or(alarm_name)
        .to_string();

    let dimension_id = metric
        .and_then(|m| m.get("dimensions"))
        .and_then(|d| d.get("InstanceId").or_else(|| d.get("DBInstanceIdentifier")))
        .and_then(Value::as_str)
        .map(str::to_string);
    let resource_id = resolve_id(dimension_id, default_resource_id)?;

    let lowered = format!("{alarm_name} {metric_name}").to_ascii_lowercase();

    if lowered.contains("statuscheck") || lowered.contains("status-check") || lowered.contains("health") {
        let severity = if lowered.contains("system") || lowered.contains("critical") {
            FailureSeverity::High
        } else {
            FailureSeverity::Low
        };
        return Ok(Some(TriggerEvent::HealthCheckFailure {
            resource_id,
            severity,
        }));
    }

    // reasonData is itself a JSON document encoded as a string.
    let reason: Value = detail
        .pointer("/state/reasonData")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or(Value::Null);

    let observed_value = reason
        .pointer("/recentDatapoints/0")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let threshold = reason
        .get("threshold")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let metric_name = if lowered.contains("cpu") && !metric_name.to_ascii_lowercase().contains("cpu") {
        "CPUUtilization".to_string()
    } else if lowered.contains("storage") && !metric_name.to_ascii_lowercase().contains("storage") {
        "FreeStorageSpace".to_string()
    } else if lowered.contains("connection") && !metric_name.to_ascii_lowercase().contains("connection") {
        "DatabaseConnections".to_string()
    } else {
        metric_name
    };

    Ok(Some(TriggerEvent::PerformanceAlarm {
        resource_id,
        metric_name,
        observed_value,
        threshold,
    }))
}
