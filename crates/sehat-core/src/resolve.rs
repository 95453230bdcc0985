//! Conflict resolution
//!
//! A pure decision function invoked by the sync engine when the server
//! reports that a record diverged. Last-write-wins is deliberately not
//! offered: silently dropping a reported outbreak because another
//! device's clock was ahead is unacceptable for health data. The
//! default policy merges edits that touch disjoint fields and defers
//! same-field divergence to a human.

use serde_json::{Map, Value};

/// How conflicts are handled for a given record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Merge disjoint field edits automatically; same-field divergence
    /// requires manual resolution
    #[default]
    MergeDisjoint,
    /// Local edits always win; resubmit against the server's version
    KeepLocal,
    /// The server always wins (e.g. raw sensor readings)
    KeepRemote,
    /// Every conflict goes to a human
    Manual,
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Resubmit the local payload with the server's version as the new base
    KeepLocal,
    /// Discard the local pending change and adopt the server payload
    KeepRemote,
    /// Resubmit a merged payload with the server's version as the new base
    Merge(Value),
    /// Defer to the UI collaborator; the record parks in `Conflicted`
    ManualResolutionRequired,
}

/// Decide what to do with a diverged record.
///
/// Pure: no IO, no clock, no randomness. The version numbers are
/// available to policies but the shipped ones only need the payloads.
#[must_use]
pub fn resolve(
    policy: ConflictPolicy,
    local_payload: &Value,
    server_payload: &Value,
    _local_version: i64,
    _server_version: i64,
) -> Decision {
    match policy {
        ConflictPolicy::KeepLocal => Decision::KeepLocal,
        ConflictPolicy::KeepRemote => Decision::KeepRemote,
        ConflictPolicy::Manual => Decision::ManualResolutionRequired,
        ConflictPolicy::MergeDisjoint => merge_disjoint(local_payload, server_payload),
    }
}

/// Field-wise merge of two payload objects.
///
/// Fields present on only one side are unioned in; fields present on
/// both sides must agree, otherwise the divergence is real and a human
/// has to look at it. Non-object payloads cannot be merged field-wise.
fn merge_disjoint(local: &Value, server: &Value) -> Decision {
    let (Some(local_map), Some(server_map)) = (local.as_object(), server.as_object()) else {
        return Decision::ManualResolutionRequired;
    };

    let mut merged: Map<String, Value> = server_map.clone();
    for (key, local_value) in local_map {
        match server_map.get(key) {
            Some(server_value) if server_value != local_value => {
                return Decision::ManualResolutionRequired;
            }
            _ => {
                merged.insert(key.clone(), local_value.clone());
            }
        }
    }

    Decision::Merge(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn disjoint_fields_merge_both_sides() {
        let local = json!({"symptoms": "fever", "temperature": "101"});
        let server = json!({"symptoms": "fever", "status": "reviewed"});

        let decision = resolve(ConflictPolicy::MergeDisjoint, &local, &server, 2, 3);
        assert_eq!(
            decision,
            Decision::Merge(json!({
                "symptoms": "fever",
                "temperature": "101",
                "status": "reviewed"
            }))
        );
    }

    #[test]
    fn same_field_divergence_requires_a_human() {
        let local = json!({"diagnosis": "cholera suspected"});
        let server = json!({"diagnosis": "gastroenteritis"});

        let decision = resolve(ConflictPolicy::MergeDisjoint, &local, &server, 2, 4);
        assert_eq!(decision, Decision::ManualResolutionRequired);
    }

    #[test]
    fn identical_payloads_merge_cleanly() {
        let payload = json!({"ph": "7.1", "turbidity": "12"});
        let decision = resolve(ConflictPolicy::MergeDisjoint, &payload, &payload, 1, 2);
        assert_eq!(decision, Decision::Merge(payload));
    }

    #[test]
    fn non_object_payloads_cannot_auto_merge() {
        let decision = resolve(
            ConflictPolicy::MergeDisjoint,
            &json!({"a": 1}),
            &json!([1, 2, 3]),
            1,
            2,
        );
        assert_eq!(decision, Decision::ManualResolutionRequired);
    }

    #[test]
    fn keep_remote_policy_always_adopts_server() {
        let decision = resolve(
            ConflictPolicy::KeepRemote,
            &json!({"ph": "6.0"}),
            &json!({"ph": "7.5"}),
            3,
            5,
        );
        assert_eq!(decision, Decision::KeepRemote);
    }

    #[test]
    fn keep_local_policy_always_resubmits() {
        let decision = resolve(
            ConflictPolicy::KeepLocal,
            &json!({"a": 1}),
            &json!({"a": 2}),
            3,
            5,
        );
        assert_eq!(decision, Decision::KeepLocal);
    }

    #[test]
    fn manual_policy_never_decides() {
        let payload = json!({"a": 1});
        let decision = resolve(ConflictPolicy::Manual, &payload, &payload, 1, 1);
        assert_eq!(decision, Decision::ManualResolutionRequired);
    }
}
