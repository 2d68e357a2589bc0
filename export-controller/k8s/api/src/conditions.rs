//! Helpers for maintaining `metav1.Condition` lists on resource statuses.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// The current wall-clock time as a Kubernetes timestamp.
pub fn now() -> Time {
    Time(chrono::Utc::now())
}

/// Builds a condition carrying the given transition timestamp.
pub fn new_condition(
    type_: impl ToString,
    status: impl ToString,
    reason: impl ToString,
    message: impl ToString,
    observed_generation: Option<i64>,
    timestamp: Time,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: timestamp,
    }
}

/// Upserts `new` into `conditions`, keyed by condition type.
///
/// Returns true iff the list changed. The stored transition timestamp is
/// replaced only when the condition's status flips; updates that touch only
/// the reason, message, or observed generation keep the original timestamp.
/// This mirrors how `apimachinery`'s `SetStatusCondition` behaves, so status
/// patches stay no-ops when nothing meaningful changed.
pub fn set_status_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };

    let mut changed = false;
    if existing.status != new.status {
        existing.status = new.status;
        existing.last_transition_time = new.last_transition_time;
        changed = true;
    }
    if existing.reason != new.reason {
        existing.reason = new.reason;
        changed = true;
    }
    if existing.message != new.message {
        existing.message = new.message;
        changed = true;
    }
    if existing.observed_generation != new.observed_generation {
        existing.observed_generation = new.observed_generation;
        changed = true;
    }
    changed
}

/// Looks up a condition by type.
pub fn find_condition<'c>(conditions: &'c [Condition], type_: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is present with status `True`.
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status == STATUS_TRUE)
}
