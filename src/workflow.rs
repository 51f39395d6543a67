use serde_json::json;

use crate::aggregate::EngineError;

/// Subject grade record lifecycle. `Finalized` freezes the record; the only
/// way out of `Approved`/`Finalized` is the audited administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeStatus {
    Draft,
    Submitted,
    Approved,
    Finalized,
}

impl GradeStatus {
    pub fn parse(s: &str) -> Option<GradeStatus> {
        match s {
            "draft" => Some(GradeStatus::Draft),
            "submitted" => Some(GradeStatus::Submitted),
            "approved" => Some(GradeStatus::Approved),
            "finalized" => Some(GradeStatus::Finalized),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::Draft => "draft",
            GradeStatus::Submitted => "submitted",
            GradeStatus::Approved => "approved",
            GradeStatus::Finalized => "finalized",
        }
    }
}

/// Per-period raw score lifecycle. `Approved` is terminal; `Returned` is a
/// recoverable dead-end that only leads back to `Draft` via an explicit
/// reopen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreStatus {
    Draft,
    Submitted,
    Validated,
    Approved,
    Returned,
}

impl ScoreStatus {
    pub fn parse(s: &str) -> Option<ScoreStatus> {
        match s {
            "draft" => Some(ScoreStatus::Draft),
            "submitted" => Some(ScoreStatus::Submitted),
            "validated" => Some(ScoreStatus::Validated),
            "approved" => Some(ScoreStatus::Approved),
            "returned" => Some(ScoreStatus::Returned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScoreStatus::Draft => "draft",
            ScoreStatus::Submitted => "submitted",
            ScoreStatus::Validated => "validated",
            ScoreStatus::Approved => "approved",
            ScoreStatus::Returned => "returned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffRole {
    Instructor,
    Approver,
    Admin,
}

impl StaffRole {
    pub fn parse(s: &str) -> Option<StaffRole> {
        match s {
            "instructor" => Some(StaffRole::Instructor),
            "approver" => Some(StaffRole::Approver),
            "admin" => Some(StaffRole::Admin),
            _ => None,
        }
    }

    pub fn can_approve(self) -> bool {
        matches!(self, StaffRole::Approver | StaffRole::Admin)
    }

    pub fn can_administer(self) -> bool {
        matches!(self, StaffRole::Admin)
    }
}

fn invalid_transition(entity: &str, from: &str, to: &str) -> EngineError {
    EngineError::validation(format!("cannot move {} from {} to {}", entity, from, to))
        .with_details(json!({ "from": from, "to": to }))
}

/// draft -> submitted, gated on a computed overall grade. A record whose
/// components are all absent has no overall grade and can never be submitted.
pub fn guard_grade_submit(status: GradeStatus, overall: Option<f64>) -> Result<(), EngineError> {
    if status != GradeStatus::Draft {
        return Err(invalid_transition("grade", status.as_str(), "submitted"));
    }
    if overall.is_none() {
        return Err(EngineError::validation(
            "overall grade is not computed; record required components first",
        ));
    }
    Ok(())
}

pub fn can_submit_grade(status: GradeStatus, overall: Option<f64>) -> bool {
    status == GradeStatus::Draft && overall.is_some()
}

/// submitted -> approved. The submitting instructor can never approve their
/// own submission; the capability and the identity check both happen here so
/// the caller can run them inside the updating transaction.
pub fn guard_grade_approve(
    status: GradeStatus,
    actor_id: &str,
    actor_role: StaffRole,
    submitted_by: Option<&str>,
) -> Result<(), EngineError> {
    if status != GradeStatus::Submitted {
        return Err(invalid_transition("grade", status.as_str(), "approved"));
    }
    if !actor_role.can_approve() {
        return Err(EngineError::new(
            "role_separation",
            "actor lacks the approval capability",
        ));
    }
    if submitted_by == Some(actor_id) {
        return Err(EngineError::new(
            "role_separation",
            "an instructor cannot approve their own submission",
        ));
    }
    Ok(())
}

/// submitted -> draft, with a mandatory reason (audited by the caller).
pub fn guard_grade_return(status: GradeStatus, reason: &str) -> Result<(), EngineError> {
    if status != GradeStatus::Submitted {
        return Err(invalid_transition("grade", status.as_str(), "draft"));
    }
    if reason.trim().is_empty() {
        return Err(EngineError::validation("return requires a reason"));
    }
    Ok(())
}

/// approved -> finalized.
pub fn guard_grade_finalize(status: GradeStatus) -> Result<(), EngineError> {
    if status != GradeStatus::Approved {
        return Err(invalid_transition("grade", status.as_str(), "finalized"));
    }
    Ok(())
}

/// Administrative reset to draft. Not part of the normal machine: admin-only,
/// mandatory reason, always audited.
pub fn guard_grade_admin_reset(actor_role: StaffRole, reason: &str) -> Result<(), EngineError> {
    if !actor_role.can_administer() {
        return Err(EngineError::new(
            "role_separation",
            "administrative reset requires the admin role",
        ));
    }
    if reason.trim().is_empty() {
        return Err(EngineError::validation(
            "administrative reset requires a reason",
        ));
    }
    Ok(())
}

/// Period-score forward transitions.
pub fn guard_score_transition(from: ScoreStatus, to: ScoreStatus) -> Result<(), EngineError> {
    let ok = matches!(
        (from, to),
        (ScoreStatus::Draft, ScoreStatus::Submitted)
            | (ScoreStatus::Submitted, ScoreStatus::Validated)
            | (ScoreStatus::Validated, ScoreStatus::Approved)
            | (ScoreStatus::Submitted, ScoreStatus::Returned)
            | (ScoreStatus::Validated, ScoreStatus::Returned)
            | (ScoreStatus::Returned, ScoreStatus::Draft)
    );
    if ok {
        Ok(())
    } else {
        Err(invalid_transition("score", from.as_str(), to.as_str()))
    }
}
