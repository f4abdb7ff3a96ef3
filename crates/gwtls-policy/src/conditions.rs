//! Status derivation for TLSPolicy and Gateway
//!
//! Pure functions from reconcile outcomes to conditions. Re-deriving from an
//! unchanged snapshot yields identical conditions, so callers can skip the
//! status write entirely.

use gwtls_common::crd::{set_condition, Condition, ConditionStatus, Gateway, TLSPolicyStatus};

use crate::backref::BackRefs;
use crate::certificates::SyncSummary;
use crate::error::PolicyError;

/// Condition type on TLSPolicy
pub const READY: &str = "Ready";

/// Condition type written on the Gateway
pub const POLICY_AFFECTED: &str = "PolicyAffected";

/// Reason on `PolicyAffected=True`
///
/// Condition reasons must be CamelCase identifiers and cannot carry a
/// `namespace/name` key, so the reason stays fixed and the effective policy
/// is named in the message instead.
pub const REASON_ACCEPTED: &str = "Accepted";

/// Reason on `PolicyAffected=False`
pub const REASON_NO_POLICY: &str = "NoPolicyAttached";

/// Policy `Ready` condition for a reconcile outcome
pub fn ready_condition(
    outcome: &Result<SyncSummary, PolicyError>,
    generation: Option<i64>,
) -> Condition {
    let condition = match outcome {
        Ok(summary) => Condition::new(
            READY,
            ConditionStatus::True,
            READY,
            format!(
                "TLSPolicy is in effect, {} certificate(s) reconciled",
                summary.reconciled
            ),
        ),
        Err(e) => Condition::new(READY, ConditionStatus::False, e.reason(), e.to_string()),
    };
    condition.observed_generation(generation)
}

/// New policy status with `ready` applied, `None` when nothing changed
pub fn policy_status(
    current: Option<&TLSPolicyStatus>,
    ready: Condition,
    generation: Option<i64>,
) -> Option<TLSPolicyStatus> {
    let mut status = current.cloned().unwrap_or_default();
    let conditions_changed = set_condition(&mut status.conditions, ready);
    let generation_changed = status.observed_generation != generation;
    status.observed_generation = generation;
    (conditions_changed || generation_changed).then_some(status)
}

/// Gateway `PolicyAffected` condition for its current back-references
///
/// The reason is always [`REASON_ACCEPTED`] while any policy is attached;
/// the message names the policy in effect as `TLSPolicy <namespace>/<name> is
/// in effect`, so the condition also answers "which policy governs this
/// gateway". With no effective policy the message counts the references.
pub fn policy_affected_condition(refs: &BackRefs, generation: Option<i64>) -> Condition {
    let condition = if refs.all.is_empty() {
        Condition::new(
            POLICY_AFFECTED,
            ConditionStatus::False,
            REASON_NO_POLICY,
            "no TLSPolicy targets this gateway",
        )
    } else {
        let message = match &refs.effective {
            Some(key) => format!("TLSPolicy {} is in effect", key),
            None => format!("{} TLSPolicy reference(s) attached", refs.all.len()),
        };
        Condition::new(
            POLICY_AFFECTED,
            ConditionStatus::True,
            REASON_ACCEPTED,
            message,
        )
    };
    condition.observed_generation(generation)
}

/// Gateway condition list after applying `PolicyAffected`, `None` when unchanged
///
/// Derived from the annotations as stored, stamped with the gateway generation
/// seen by this reconcile.
pub fn gateway_conditions(gateway: &Gateway) -> Option<Vec<Condition>> {
    let refs = BackRefs::from_gateway(gateway);
    let mut conditions = gateway.conditions().to_vec();
    let changed = set_condition(
        &mut conditions,
        policy_affected_condition(&refs, gateway.metadata.generation),
    );
    changed.then_some(conditions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwtls_common::crd::{find_condition, GatewaySpec, GatewayStatus};
    use gwtls_common::{PolicyKey, POLICIES_BACK_REF_ANNOTATION, POLICY_BACK_REF_ANNOTATION};
    use std::collections::BTreeMap;

    fn summary(reconciled: usize) -> SyncSummary {
        SyncSummary {
            reconciled,
            ..Default::default()
        }
    }

    fn attached_gateway(generation: i64) -> Gateway {
        let mut gw = Gateway::new("g1", GatewaySpec::default());
        gw.metadata.namespace = Some("ns".to_string());
        gw.metadata.generation = Some(generation);
        gw.metadata.annotations = Some(BTreeMap::from([
            (POLICY_BACK_REF_ANNOTATION.to_string(), "ns/p1".to_string()),
            (
                POLICIES_BACK_REF_ANNOTATION.to_string(),
                r#"["ns/p1","ns/p2"]"#.to_string(),
            ),
        ]));
        gw
    }

    #[test]
    fn ready_true_even_with_zero_certificates() {
        let cond = ready_condition(&Ok(summary(0)), Some(3));
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, READY);
        assert_eq!(cond.observed_generation, Some(3));
    }

    #[test]
    fn ready_false_carries_failing_reason() {
        let err = PolicyError::Conflicted {
            effective: PolicyKey::new("ns", "p1"),
            target: "g1".to_string(),
        };
        let cond = ready_condition(&Err(err), Some(1));
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, "Conflicted");
        assert!(cond.message.contains("ns/p1"));
    }

    #[test]
    fn unchanged_policy_status_is_suppressed() {
        let first = policy_status(None, ready_condition(&Ok(summary(1)), Some(2)), Some(2))
            .expect("first write");
        let again = policy_status(
            Some(&first),
            ready_condition(&Ok(summary(1)), Some(2)),
            Some(2),
        );
        assert_eq!(again, None);
    }

    #[test]
    fn new_generation_rewrites_status() {
        let first =
            policy_status(None, ready_condition(&Ok(summary(1)), Some(2)), Some(2)).unwrap();
        let next = policy_status(
            Some(&first),
            ready_condition(&Ok(summary(1)), Some(3)),
            Some(3),
        )
        .expect("generation bump");
        assert_eq!(next.observed_generation, Some(3));
        // status unchanged, so the transition time is kept
        assert_eq!(
            next.conditions[0].last_transition_time,
            first.conditions[0].last_transition_time
        );
    }

    #[test]
    fn policy_affected_names_effective_policy() {
        let gw = attached_gateway(7);
        let conditions = gateway_conditions(&gw).expect("condition added");
        let cond = find_condition(&conditions, POLICY_AFFECTED).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.reason, REASON_ACCEPTED);
        assert_eq!(cond.message, "TLSPolicy ns/p1 is in effect");
        assert_eq!(cond.observed_generation, Some(7));
    }

    #[test]
    fn gateway_condition_tracks_generation() {
        let mut gw = attached_gateway(1);
        gw.status = Some(GatewayStatus {
            conditions: gateway_conditions(&gw).unwrap(),
        });
        assert_eq!(gateway_conditions(&gw), None);

        gw.metadata.generation = Some(2);
        let conditions = gateway_conditions(&gw).expect("stale generation");
        assert_eq!(
            find_condition(&conditions, POLICY_AFFECTED)
                .unwrap()
                .observed_generation,
            Some(2)
        );
    }

    #[test]
    fn detached_gateway_reports_no_policy() {
        let mut gw = Gateway::new("g1", GatewaySpec::default());
        gw.metadata.generation = Some(1);
        let conditions = gateway_conditions(&gw).unwrap();
        let cond = find_condition(&conditions, POLICY_AFFECTED).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
        assert_eq!(cond.reason, REASON_NO_POLICY);
    }

    #[test]
    fn foreign_gateway_conditions_are_preserved() {
        let mut gw = attached_gateway(1);
        gw.status = Some(GatewayStatus {
            conditions: vec![Condition::new(
                "Programmed",
                ConditionStatus::True,
                "Programmed",
                "",
            )],
        });
        let conditions = gateway_conditions(&gw).unwrap();
        assert_eq!(conditions.len(), 2);
        assert!(find_condition(&conditions, "Programmed").is_some());
    }
}
