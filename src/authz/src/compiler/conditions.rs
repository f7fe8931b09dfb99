//! Compile-time evaluation of policy conditions

use super::SubjectContext;
use crate::policy::{Condition, FieldOperator, Policy, PolicyEffect, SubjectField};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// How a policy's conditions affect its application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// Apply the policy; `own_only` caps allow data scopes at `own`
    Apply { own_only: bool },
    /// A condition does not hold
    Skip,
}

/// Evaluate every condition of `policy` (conjunctively) for `subject` at `now`
pub fn evaluate(policy: &Policy, subject: &SubjectContext, now: DateTime<Utc>) -> ConditionOutcome {
    let mut own_only = false;

    for condition in &policy.conditions {
        let holds = match condition {
            Condition::Field { field, operator, values } => {
                field_matches(subject, *field, *operator, values)
            }
            Condition::Time { not_before, not_after } => {
                not_before.map_or(true, |start| now >= start) && not_after.map_or(true, |end| now < end)
            }
            Condition::Role { role_ids } => role_ids.iter().any(|r| subject.roles.contains(r)),
            Condition::Ownership => {
                own_only = true;
                true
            }
            Condition::Custom { expression } => {
                warn!(
                    policy_id = %policy.id,
                    expression = %expression,
                    "custom conditions are not supported"
                );
                // Never let an unevaluable condition grant; a deny still applies
                policy.effect == PolicyEffect::Deny
            }
        };

        if !holds {
            debug!(policy_id = %policy.id, ?condition, "condition not met, skipping policy");
            return ConditionOutcome::Skip;
        }
    }

    ConditionOutcome::Apply { own_only }
}

fn field_matches(subject: &SubjectContext, field: SubjectField, operator: FieldOperator, values: &[String]) -> bool {
    let actual = match field {
        SubjectField::UserId => &subject.user_id,
        SubjectField::OrganizationId => &subject.organization_id,
        SubjectField::BusinessUnitId => &subject.business_unit_id,
    };
    let listed = values.iter().any(|v| v == actual);

    match operator {
        FieldOperator::Eq | FieldOperator::In => listed,
        FieldOperator::Neq | FieldOperator::NotIn => !listed,
    }
}
