//! Job status workflow.
//!
//! The status graph is a static table of edges, each guarded by the set of
//! roles allowed to take it. [`check_transition`] validates an edge in
//! isolation; [`transition`] applies it to a stored job inside one
//! `BEGIN IMMEDIATE` transaction that re-reads the current status, checks
//! the edge, the role and the approval gates, then writes the new status and
//! its history row together.
//!
//! **Graph:**
//! - open -> awaiting_quotation_approval -> awaiting_parts -> in_progress
//! - in_progress -> with_subcontractor -> completed, or in_progress -> completed
//! - completed -> invoiced -> closed, or completed -> closed
//! - awaiting_quotation_approval -> open when the quotation is turned down
//! - any status before completed -> closed (cancel, director only)

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::activity::log_activity;
use crate::auth::{RequestContext, Role};
use crate::db::{with_immediate_tx, DbState};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Open,
    AwaitingQuotationApproval,
    AwaitingParts,
    InProgress,
    WithSubcontractor,
    Completed,
    Invoiced,
    Closed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Open,
        JobStatus::AwaitingQuotationApproval,
        JobStatus::AwaitingParts,
        JobStatus::InProgress,
        JobStatus::WithSubcontractor,
        JobStatus::Completed,
        JobStatus::Invoiced,
        JobStatus::Closed,
    ];

    /// Statuses counted as "open" work on the dashboard.
    pub const OPEN_SET: [JobStatus; 5] = [
        JobStatus::Open,
        JobStatus::AwaitingQuotationApproval,
        JobStatus::AwaitingParts,
        JobStatus::InProgress,
        JobStatus::WithSubcontractor,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Open => "open",
            JobStatus::AwaitingQuotationApproval => "awaiting_quotation_approval",
            JobStatus::AwaitingParts => "awaiting_parts",
            JobStatus::InProgress => "in_progress",
            JobStatus::WithSubcontractor => "with_subcontractor",
            JobStatus::Completed => "completed",
            JobStatus::Invoiced => "invoiced",
            JobStatus::Closed => "closed",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Open => "Open",
            JobStatus::AwaitingQuotationApproval => "Awaiting quotation approval",
            JobStatus::AwaitingParts => "Awaiting parts",
            JobStatus::InProgress => "In progress",
            JobStatus::WithSubcontractor => "With subcontractor",
            JobStatus::Completed => "Completed",
            JobStatus::Invoiced => "Invoiced",
            JobStatus::Closed => "Closed",
        }
    }

    pub fn is_open(self) -> bool {
        Self::OPEN_SET.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        self == JobStatus::Closed
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| AppError::Validation(format!("Unknown job status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// One edge of the status graph and the roles allowed to take it.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub roles: &'static [Role],
}

const ANY_ROLE: &[Role] = &[Role::Director, Role::ProcurementOfficer, Role::Staff];
const APPROVERS: &[Role] = &[Role::Director, Role::ProcurementOfficer];
const DIRECTOR_ONLY: &[Role] = &[Role::Director];

const fn edge(from: JobStatus, to: JobStatus, roles: &'static [Role]) -> Transition {
    Transition { from, to, roles }
}

use JobStatus::*;

pub const TRANSITIONS: &[Transition] = &[
    edge(Open, AwaitingQuotationApproval, ANY_ROLE),
    edge(AwaitingQuotationApproval, AwaitingParts, APPROVERS),
    edge(AwaitingQuotationApproval, Open, APPROVERS),
    edge(AwaitingParts, InProgress, ANY_ROLE),
    edge(InProgress, WithSubcontractor, ANY_ROLE),
    edge(InProgress, Completed, ANY_ROLE),
    edge(WithSubcontractor, Completed, ANY_ROLE),
    edge(Completed, Invoiced, APPROVERS),
    edge(Completed, Closed, DIRECTOR_ONLY),
    edge(Invoiced, Closed, DIRECTOR_ONLY),
    // Cancellation
    edge(Open, Closed, DIRECTOR_ONLY),
    edge(AwaitingQuotationApproval, Closed, DIRECTOR_ONLY),
    edge(AwaitingParts, Closed, DIRECTOR_ONLY),
    edge(InProgress, Closed, DIRECTOR_ONLY),
    edge(WithSubcontractor, Closed, DIRECTOR_ONLY),
];

pub fn find_transition(from: JobStatus, to: JobStatus) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == from && t.to == to)
}

/// Targets reachable in one step from `from` for `role`.
pub fn allowed_targets(from: JobStatus, role: Role) -> Vec<JobStatus> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == from && t.roles.contains(&role))
        .map(|t| t.to)
        .collect()
}

/// Validate an edge and its role guard without touching storage.
pub fn check_transition(from: JobStatus, to: JobStatus, role: Role) -> AppResult<()> {
    let edge = find_transition(from, to).ok_or(AppError::InvalidTransition {
        from: from.as_str(),
        to: to.as_str(),
    })?;
    if !edge.roles.contains(&role) {
        return Err(AppError::Unauthorized(format!(
            "{} may not move a job from {} to {}",
            role.label(),
            from.label(),
            to.label()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Approval gates
// ---------------------------------------------------------------------------

fn count_with_status(
    conn: &Connection,
    table: &str,
    job_id: &str,
    status: &str,
) -> AppResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE job_id = ?1 AND status = ?2");
    Ok(conn.query_row(&sql, params![job_id, status], |row| row.get(0))?)
}

/// Approval and billing prerequisites for forward progress.
fn check_prerequisites(
    conn: &Connection,
    job_id: &str,
    from: JobStatus,
    to: JobStatus,
) -> AppResult<()> {
    match (from, to) {
        (AwaitingQuotationApproval, AwaitingParts) => {
            if count_with_status(conn, "quotations", job_id, "approved")? == 0 {
                return Err(AppError::PrerequisiteNotMet(
                    "an approved quotation is required before ordering parts".into(),
                ));
            }
        }
        (WithSubcontractor, Completed) => {
            if count_with_status(conn, "subcontract_works", job_id, "pending_approval")? > 0 {
                return Err(AppError::PrerequisiteNotMet(
                    "subcontract work is still awaiting approval".into(),
                ));
            }
            if count_with_status(conn, "subcontract_works", job_id, "approved")? == 0 {
                return Err(AppError::PrerequisiteNotMet(
                    "an approved subcontract work is required".into(),
                ));
            }
        }
        (_, Invoiced) => {
            let invoices: i64 = conn.query_row(
                "SELECT COUNT(*) FROM customer_invoices WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )?;
            if invoices == 0 {
                return Err(AppError::PrerequisiteNotMet(
                    "the job has no customer invoice".into(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Applying transitions
// ---------------------------------------------------------------------------

pub(crate) fn current_status(conn: &Connection, job_id: &str) -> AppResult<JobStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()?;
    status
        .ok_or_else(|| AppError::NotFound(format!("Job {job_id}")))?
        .parse()
}

/// Write a history row. Part of the status write; failures propagate.
pub(crate) fn record_history(
    conn: &Connection,
    job_id: &str,
    from: Option<JobStatus>,
    to: JobStatus,
    changed_by: &str,
    note: &str,
) -> AppResult<()> {
    conn.execute(
        "INSERT INTO job_status_history (job_id, from_status, to_status, changed_by, note, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job_id,
            from.map(JobStatus::as_str),
            to.as_str(),
            changed_by,
            note,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Apply a transition on a connection that already holds a write
/// transaction. Used directly by approvals and billing so their own write
/// and the resulting status change commit together.
pub(crate) fn apply_transition(
    conn: &Connection,
    job_id: &str,
    to: JobStatus,
    ctx: &RequestContext,
    note: &str,
) -> AppResult<JobStatus> {
    let from = current_status(conn, job_id)?;
    check_transition(from, to, ctx.role)?;
    check_prerequisites(conn, job_id, from, to)?;

    let updated = conn.execute(
        "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), Utc::now().to_rfc3339(), job_id, from.as_str()],
    )?;
    if updated != 1 {
        // Status moved under us; treat as the edge no longer being valid.
        return Err(AppError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        });
    }

    record_history(conn, job_id, Some(from), to, &ctx.user_id, note)?;
    log_activity(
        conn,
        Some(&ctx.user_id),
        "job_status_changed",
        &format!("job={job_id} {from} -> {to}"),
    );
    info!(
        job_id = %job_id,
        from = %from,
        to = %to,
        user = %ctx.username,
        "job status changed"
    );
    Ok(from)
}

/// Move a job to `to` on behalf of `ctx`.
///
/// Fails with `InvalidTransition` when the edge is not in the graph,
/// `Unauthorized` when the role is not allowed on it, and
/// `PrerequisiteNotMet` when an approval gate is closed. Nothing is written
/// on failure.
pub fn transition(
    db: &DbState,
    job_id: &str,
    to: JobStatus,
    ctx: &RequestContext,
    note: &str,
) -> AppResult<JobStatus> {
    let conn = db.lock()?;
    let result = with_immediate_tx(&conn, |tx| apply_transition(tx, job_id, to, ctx, note));
    if let Err(ref e) = result {
        warn!(job_id = %job_id, to = %to, error = %e, "job transition rejected");
    }
    result.map(|_| to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::seed_user;
    use crate::db;
    use crate::jobs::tests::seed_job;

    fn status_of(db: &DbState, job_id: &str) -> JobStatus {
        let conn = db.lock().expect("db lock");
        current_status(&conn, job_id).expect("status")
    }

    fn force_status(db: &DbState, job_id: &str, status: JobStatus) {
        let conn = db.lock().expect("db lock");
        conn.execute(
            "UPDATE jobs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), job_id],
        )
        .expect("force status");
    }

    fn history_len(db: &DbState, job_id: &str) -> i64 {
        let conn = db.lock().expect("db lock");
        conn.query_row(
            "SELECT COUNT(*) FROM job_status_history WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .expect("count history")
    }

    #[test]
    fn test_only_declared_edges_are_valid() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let declared = find_transition(from, to).is_some();
                let result = check_transition(from, to, Role::Director);
                if declared {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                } else {
                    assert!(
                        matches!(result, Err(AppError::InvalidTransition { .. })),
                        "{from} -> {to} should be invalid"
                    );
                }
            }
        }
    }

    #[test]
    fn test_forward_path_is_monotonic_except_branches() {
        let rank = |s: JobStatus| JobStatus::ALL.iter().position(|x| *x == s).unwrap();
        for t in TRANSITIONS {
            let rejection = t.from == AwaitingQuotationApproval && t.to == Open;
            assert!(
                rejection || rank(t.to) > rank(t.from),
                "{} -> {} moves backwards",
                t.from,
                t.to
            );
        }
    }

    #[test]
    fn test_skipping_steps_is_invalid() {
        for (from, to) in [
            (Open, AwaitingParts),
            (Open, InProgress),
            (AwaitingParts, Completed),
            (Open, Invoiced),
            (Invoiced, Completed),
            (Closed, Open),
        ] {
            assert!(matches!(
                check_transition(from, to, Role::Director),
                Err(AppError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_role_guards() {
        assert!(matches!(
            check_transition(AwaitingQuotationApproval, AwaitingParts, Role::Staff),
            Err(AppError::Unauthorized(_))
        ));
        assert!(
            check_transition(AwaitingQuotationApproval, AwaitingParts, Role::ProcurementOfficer)
                .is_ok()
        );
        assert!(matches!(
            check_transition(InProgress, Closed, Role::ProcurementOfficer),
            Err(AppError::Unauthorized(_))
        ));
        assert_eq!(
            allowed_targets(InProgress, Role::Staff),
            vec![WithSubcontractor, Completed]
        );
        assert!(allowed_targets(Closed, Role::Director).is_empty());
    }

    #[test]
    fn test_transition_writes_status_and_history() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &staff, "KAA 123A");

        transition(&db, &job_id, AwaitingQuotationApproval, &staff, "needs brakes")
            .expect("open -> awaiting quotation");
        assert_eq!(status_of(&db, &job_id), AwaitingQuotationApproval);
        // creation row + transition row
        assert_eq!(history_len(&db, &job_id), 2);
    }

    #[test]
    fn test_failed_transition_commits_nothing() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &staff, "KAA 123A");

        let err = transition(&db, &job_id, Completed, &staff, "").expect_err("skip");
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(status_of(&db, &job_id), Open);
        assert_eq!(history_len(&db, &job_id), 1);
    }

    #[test]
    fn test_quotation_gate_blocks_ordering_parts() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KBB 456B");
        force_status(&db, &job_id, AwaitingQuotationApproval);

        let err = transition(&db, &job_id, AwaitingParts, &director, "")
            .expect_err("no approved quotation");
        assert!(matches!(err, AppError::PrerequisiteNotMet(_)));
        assert_eq!(status_of(&db, &job_id), AwaitingQuotationApproval);
    }

    #[test]
    fn test_subcontract_gate_blocks_completion() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KCC 789C");
        force_status(&db, &job_id, WithSubcontractor);

        let err = transition(&db, &job_id, Completed, &director, "")
            .expect_err("no approved subcontract");
        assert!(matches!(err, AppError::PrerequisiteNotMet(_)));
    }

    #[test]
    fn test_manual_invoiced_requires_invoice() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KDD 111D");
        force_status(&db, &job_id, Completed);

        let err = transition(&db, &job_id, Invoiced, &director, "").expect_err("no invoice");
        assert!(matches!(err, AppError::PrerequisiteNotMet(_)));
    }

    #[test]
    fn test_director_can_cancel_open_work() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &staff, "KEE 222E");
        force_status(&db, &job_id, InProgress);

        let err = transition(&db, &job_id, Closed, &staff, "").expect_err("staff cannot cancel");
        assert!(matches!(err, AppError::Unauthorized(_)));
        transition(&db, &job_id, Closed, &director, "customer withdrew").expect("cancel");
        assert_eq!(status_of(&db, &job_id), Closed);
    }

    #[test]
    fn test_unknown_job_is_not_found() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let err = transition(&db, "missing", Closed, &director, "").expect_err("missing job");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
