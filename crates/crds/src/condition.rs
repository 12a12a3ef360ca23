//! Conditions for VMops CRDs
//!
//! A condition is a named, timestamped health signal recorded on a
//! resource's status. Controllers mark conditions true or false as they
//! observe the world; the last transition time only moves when the
//! boolean status actually changes, so `lastTransitionTime` answers
//! "since when has this been true/false".

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type marking backend (vCenter) reachability.
pub const BACKEND_AVAILABLE_CONDITION: &str = "BackendAvailable";

/// Reason used when an authenticated backend session cannot be created.
pub const BACKEND_UNREACHABLE_REASON: &str = "BackendUnreachable";

/// Summary condition computed from the component conditions on every
/// status flush.
pub const READY_CONDITION: &str = "Ready";

/// Observed status of a condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition is known to hold.
    True,
    /// The condition is known not to hold.
    False,
    /// The controller cannot tell either way.
    #[default]
    Unknown,
}

/// Severity classifies a false condition for operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConditionSeverity {
    /// Expected, transient state (waiting on a dependency).
    Info,
    /// Degraded but recoverable without intervention.
    Warning,
    /// Requires a spec change or external fix.
    Error,
}

/// A named health signal with reason, message and transition time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "VMProvisioned".
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown.
    pub status: ConditionStatus,

    /// Severity of a false condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When `status` last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A condition that holds, with no reason required.
    pub fn true_(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        }
    }

    /// A condition that does not hold, with reason and severity.
    pub fn false_(type_: &str, reason: &str, severity: ConditionSeverity, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: if message.is_empty() {
                None
            } else {
                Some(message.to_string())
            },
            last_transition_time: Some(Utc::now()),
        }
    }
}

/// Returns the condition of the given type, if recorded.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Returns true when the condition exists and its status is True.
pub fn is_true(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Returns true when a condition of the given type is recorded at all.
pub fn has_condition(conditions: &[Condition], type_: &str) -> bool {
    get_condition(conditions, type_).is_some()
}

/// Inserts or replaces the condition of `new.type_`.
///
/// The transition time is preserved from the existing condition when
/// the boolean status did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status == new.status {
                new.last_transition_time = existing.last_transition_time;
            }
            *existing = new;
        }
        None => conditions.push(new),
    }
}

/// Marks the condition of the given type as True.
pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set_condition(conditions, Condition::true_(type_));
}

/// Marks the condition of the given type as False.
pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: &str,
) {
    set_condition(conditions, Condition::false_(type_, reason, severity, message));
}

/// Recomputes the `Ready` summary from the listed component conditions.
///
/// Any False component makes the summary False, carrying the reason and
/// the highest severity among the false components. With no False
/// components, an Unknown component makes the summary Unknown.
/// Components that were never recorded are skipped, so a resource that
/// has no use for one signal still summarizes cleanly.
pub fn set_summary(conditions: &mut Vec<Condition>, component_types: &[&str]) {
    let mut worst: Option<Condition> = None;
    let mut unknown = false;

    for type_ in component_types {
        match get_condition(conditions, type_) {
            Some(c) if c.status == ConditionStatus::False => {
                let replace = match &worst {
                    Some(w) => c.severity > w.severity,
                    None => true,
                };
                if replace {
                    worst = Some(c.clone());
                }
            }
            Some(c) if c.status == ConditionStatus::Unknown => unknown = true,
            _ => {}
        }
    }

    let summary = match worst {
        Some(w) => Condition {
            type_: READY_CONDITION.to_string(),
            status: ConditionStatus::False,
            severity: w.severity,
            reason: w.reason,
            message: w.message,
            last_transition_time: Some(Utc::now()),
        },
        None if unknown => Condition {
            type_: READY_CONDITION.to_string(),
            status: ConditionStatus::Unknown,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: Some(Utc::now()),
        },
        None => Condition::true_(READY_CONDITION),
    };
    set_condition(conditions, summary);
}

/// Aggregates child Ready conditions into one parent condition with a
/// step-counter message ("N of M completed").
///
/// Only meaningful when every child exposes a Ready condition; callers
/// fall back to their own approximation otherwise.
pub fn aggregate_ready(
    parent_type: &str,
    children: &[&[Condition]],
) -> Condition {
    let total = children.len();
    let ready = children
        .iter()
        .filter(|c| is_true(c, READY_CONDITION))
        .count();

    if ready == total {
        let mut c = Condition::true_(parent_type);
        c.message = Some(format!("{ready} of {total} completed"));
        return c;
    }

    // Carry the worst severity and first reason among unready children.
    let mut severity = ConditionSeverity::Info;
    let mut reason = None;
    for child in children {
        if let Some(c) = get_condition(child, READY_CONDITION) {
            if c.status != ConditionStatus::True {
                if let Some(s) = c.severity {
                    severity = severity.max(s);
                }
                if reason.is_none() {
                    reason = c.reason.clone();
                }
            }
        } else {
            severity = severity.max(ConditionSeverity::Info);
        }
    }

    Condition {
        type_: parent_type.to_string(),
        status: ConditionStatus::False,
        severity: Some(severity),
        reason,
        message: Some(format!("{ready} of {total} completed")),
        last_transition_time: Some(Utc::now()),
    }
}
