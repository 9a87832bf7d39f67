//! Approval queue for quotations and subcontract work.
//!
//! Items start `pending_approval`; a director either approves or rejects
//! them and the decision is final. Both item kinds share one code path,
//! parameterised by [`ApprovalKind`].
//!
//! **Rules:**
//! - Only directors decide; anyone else gets `Unauthorized`
//! - Deciding an already-decided item fails with `InvalidTransition`
//! - Rejection requires a reason
//! - Submitting a quotation on an `open` job moves it to
//!   `awaiting_quotation_approval`; approving a quotation on such a job
//!   moves it to `awaiting_parts`, in the same transaction as the decision

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::activity::log_activity;
use crate::auth::{Permission, RequestContext, Role};
use crate::db::{with_immediate_tx, DbState};
use crate::error::{parse_column, AppError, AppResult};
use crate::workflow::{self, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    PendingApproval,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::PendingApproval => "pending_approval",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ApprovalStatus::PendingApproval => "Pending approval",
            ApprovalStatus::Approved => "Approved",
            ApprovalStatus::Rejected => "Rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending_approval" => Ok(ApprovalStatus::PendingApproval),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(AppError::Validation(format!("Unknown approval status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Quotation,
    Subcontract,
}

impl ApprovalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalKind::Quotation => "quotation",
            ApprovalKind::Subcontract => "subcontract",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ApprovalKind::Quotation => "Quotation",
            ApprovalKind::Subcontract => "Subcontract work",
        }
    }

    fn table(self) -> &'static str {
        match self {
            ApprovalKind::Quotation => "quotations",
            ApprovalKind::Subcontract => "subcontract_works",
        }
    }

    /// Column naming the counterparty: supplier for quotations,
    /// subcontractor for subcontract work.
    fn party_sql(self) -> &'static str {
        match self {
            ApprovalKind::Quotation => {
                "(SELECT s.name FROM suppliers s WHERE s.id = t.supplier_id)"
            }
            ApprovalKind::Subcontract => "t.subcontractor_name",
        }
    }

    fn amount_column(self) -> &'static str {
        match self {
            ApprovalKind::Quotation => "amount",
            ApprovalKind::Subcontract => "cost",
        }
    }
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "quotation" | "quotations" => Ok(ApprovalKind::Quotation),
            "subcontract" | "subcontracts" => Ok(ApprovalKind::Subcontract),
            other => Err(AppError::NotFound(format!("Approval kind {other}"))),
        }
    }
}

/// A quotation or subcontract work item as shown in the queue.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalItem {
    pub id: String,
    pub kind: ApprovalKind,
    pub job_id: String,
    pub number_plate: String,
    pub party: Option<String>,
    pub description: String,
    pub amount: f64,
    pub status: ApprovalStatus,
    pub submitted_by: Option<String>,
    pub decided_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: String,
    pub decided_at: Option<String>,
}

fn select_sql(kind: ApprovalKind) -> String {
    format!(
        "SELECT t.id, t.job_id, v.number_plate, {party}, t.description, t.{amount}, t.status,
                su.username, du.username, t.rejection_reason, t.created_at, t.decided_at
         FROM {table} t
         JOIN jobs j ON j.id = t.job_id
         JOIN vehicles v ON v.id = j.vehicle_id
         LEFT JOIN users su ON su.id = t.submitted_by
         LEFT JOIN users du ON du.id = t.decided_by",
        party = kind.party_sql(),
        amount = kind.amount_column(),
        table = kind.table(),
    )
}

fn map_item_row(kind: ApprovalKind, row: &rusqlite::Row) -> rusqlite::Result<ApprovalItem> {
    Ok(ApprovalItem {
        id: row.get(0)?,
        kind,
        job_id: row.get(1)?,
        number_plate: row.get(2)?,
        party: row.get(3)?,
        description: row.get(4)?,
        amount: row.get(5)?,
        status: parse_column(row, 6)?,
        submitted_by: row.get(7)?,
        decided_by: row.get(8)?,
        rejection_reason: row.get(9)?,
        created_at: row.get(10)?,
        decided_at: row.get(11)?,
    })
}

fn validate_amount(amount: f64, label: &str) -> AppResult<()> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(AppError::Validation(format!("{label} cannot be negative")));
    }
    Ok(())
}

fn ensure_job_accepts_submissions(conn: &Connection, job_id: &str) -> AppResult<JobStatus> {
    let status = workflow::current_status(conn, job_id)?;
    if matches!(
        status,
        JobStatus::Completed | JobStatus::Invoiced | JobStatus::Closed
    ) {
        return Err(AppError::Validation(format!(
            "Job is {} and no longer accepts submissions",
            status.label().to_lowercase()
        )));
    }
    Ok(status)
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

/// Submit a supplier quotation for a job.
pub fn submit_quotation(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    supplier_id: Option<&str>,
    description: &str,
    amount: f64,
) -> AppResult<ApprovalItem> {
    ctx.require(Permission::SubmitQuotations)?;
    let description = description.trim();
    if description.is_empty() {
        return Err(AppError::Validation("Quotation description is required".into()));
    }
    validate_amount(amount, "Quotation amount")?;
    let supplier_id = supplier_id.map(str::trim).filter(|s| !s.is_empty());

    let conn = db.lock()?;
    let id = with_immediate_tx(&conn, |tx| {
        let status = ensure_job_accepts_submissions(tx, job_id)?;
        if let Some(sid) = supplier_id {
            let known: Option<String> = tx
                .query_row("SELECT id FROM suppliers WHERE id = ?1", params![sid], |row| {
                    row.get(0)
                })
                .optional()?;
            if known.is_none() {
                return Err(AppError::Validation("Unknown supplier".into()));
            }
        }

        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO quotations (id, job_id, supplier_id, description, amount, submitted_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                job_id,
                supplier_id,
                description,
                amount,
                ctx.user_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "quotation_submitted",
            &format!("job={job_id} quotation={id} amount={amount:.2}"),
        );

        if status == JobStatus::Open {
            workflow::apply_transition(
                tx,
                job_id,
                JobStatus::AwaitingQuotationApproval,
                ctx,
                "quotation submitted",
            )?;
        }
        Ok(id)
    })?;

    info!(quotation_id = %id, job_id = %job_id, "quotation submitted");
    get_item_conn(&conn, ApprovalKind::Quotation, &id)
}

/// Submit subcontracted work for a job.
pub fn submit_subcontract(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    subcontractor_name: &str,
    description: &str,
    cost: f64,
) -> AppResult<ApprovalItem> {
    ctx.require(Permission::SubmitQuotations)?;
    let subcontractor_name = subcontractor_name.trim();
    let description = description.trim();
    if subcontractor_name.is_empty() || description.is_empty() {
        return Err(AppError::Validation(
            "Subcontractor and description are required".into(),
        ));
    }
    validate_amount(cost, "Subcontract cost")?;

    let conn = db.lock()?;
    let id = with_immediate_tx(&conn, |tx| {
        ensure_job_accepts_submissions(tx, job_id)?;
        let id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO subcontract_works
                (id, job_id, subcontractor_name, description, cost, submitted_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                job_id,
                subcontractor_name,
                description,
                cost,
                ctx.user_id,
                Utc::now().to_rfc3339()
            ],
        )?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "subcontract_submitted",
            &format!("job={job_id} subcontract={id} cost={cost:.2}"),
        );
        Ok(id)
    })?;

    info!(subcontract_id = %id, job_id = %job_id, "subcontract work submitted");
    get_item_conn(&conn, ApprovalKind::Subcontract, &id)
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

fn require_director(ctx: &RequestContext) -> AppResult<()> {
    if ctx.role != Role::Director {
        return Err(AppError::Unauthorized(
            "only a director may approve or reject".into(),
        ));
    }
    ctx.require(Permission::DecideApprovals)
}

fn decide(
    db: &DbState,
    ctx: &RequestContext,
    kind: ApprovalKind,
    item_id: &str,
    decision: ApprovalStatus,
    reason: Option<&str>,
) -> AppResult<ApprovalItem> {
    require_director(ctx)?;

    let conn = db.lock()?;
    with_immediate_tx(&conn, |tx| {
        let (job_id, current): (String, String) = tx
            .query_row(
                &format!("SELECT job_id, status FROM {} WHERE id = ?1", kind.table()),
                params![item_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("{} {item_id}", kind.label())))?;

        let current: ApprovalStatus = current.parse()?;
        if current != ApprovalStatus::PendingApproval {
            return Err(AppError::InvalidTransition {
                from: current.as_str(),
                to: decision.as_str(),
            });
        }

        let updated = tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, decided_by = ?2, decided_at = ?3, rejection_reason = ?4
                 WHERE id = ?5 AND status = 'pending_approval'",
                kind.table()
            ),
            params![
                decision.as_str(),
                ctx.user_id,
                Utc::now().to_rfc3339(),
                reason,
                item_id
            ],
        )?;
        if updated != 1 {
            return Err(AppError::InvalidTransition {
                from: current.as_str(),
                to: decision.as_str(),
            });
        }

        log_activity(
            tx,
            Some(&ctx.user_id),
            &format!("{}_{}", kind.as_str(), decision.as_str()),
            &format!("job={job_id} item={item_id}"),
        );

        if kind == ApprovalKind::Quotation
            && decision == ApprovalStatus::Approved
            && workflow::current_status(tx, &job_id)? == JobStatus::AwaitingQuotationApproval
        {
            workflow::apply_transition(
                tx,
                &job_id,
                JobStatus::AwaitingParts,
                ctx,
                "quotation approved",
            )?;
        }
        Ok(())
    })?;

    info!(
        kind = %kind,
        item_id = %item_id,
        decision = decision.as_str(),
        user = %ctx.username,
        "approval decided"
    );
    get_item_conn(&conn, kind, item_id)
}

/// Approve a pending item (directors only).
pub fn approve(
    db: &DbState,
    ctx: &RequestContext,
    kind: ApprovalKind,
    item_id: &str,
) -> AppResult<ApprovalItem> {
    decide(db, ctx, kind, item_id, ApprovalStatus::Approved, None)
}

/// Reject a pending item with a reason (directors only).
pub fn reject(
    db: &DbState,
    ctx: &RequestContext,
    kind: ApprovalKind,
    item_id: &str,
    reason: &str,
) -> AppResult<ApprovalItem> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::Validation("A rejection reason is required".into()));
    }
    decide(db, ctx, kind, item_id, ApprovalStatus::Rejected, Some(reason))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

fn get_item_conn(conn: &Connection, kind: ApprovalKind, item_id: &str) -> AppResult<ApprovalItem> {
    conn.query_row(
        &format!("{} WHERE t.id = ?1", select_sql(kind)),
        params![item_id],
        |row| map_item_row(kind, row),
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("{} {item_id}", kind.label())))
}

pub fn get_item(db: &DbState, kind: ApprovalKind, item_id: &str) -> AppResult<ApprovalItem> {
    let conn = db.lock()?;
    get_item_conn(&conn, kind, item_id)
}

fn query_items(
    conn: &Connection,
    kind: ApprovalKind,
    filter: &str,
    value: &str,
) -> AppResult<Vec<ApprovalItem>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE {filter} = ?1 ORDER BY t.created_at, t.id",
        select_sql(kind)
    ))?;
    let rows = stmt.query_map(params![value], |row| map_item_row(kind, row))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// All quotations and subcontract works for a job.
pub fn list_for_job(db: &DbState, job_id: &str) -> AppResult<Vec<ApprovalItem>> {
    let conn = db.lock()?;
    let mut items = query_items(&conn, ApprovalKind::Quotation, "t.job_id", job_id)?;
    items.extend(query_items(&conn, ApprovalKind::Subcontract, "t.job_id", job_id)?);
    Ok(items)
}

/// Every item still waiting for a decision, oldest first.
pub fn list_pending(db: &DbState) -> AppResult<Vec<ApprovalItem>> {
    let conn = db.lock()?;
    let status = ApprovalStatus::PendingApproval.as_str();
    let mut items = query_items(&conn, ApprovalKind::Quotation, "t.status", status)?;
    items.extend(query_items(&conn, ApprovalKind::Subcontract, "t.status", status)?);
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(items)
}

/// All items of one kind, newest first.
pub fn list_all(db: &DbState, kind: ApprovalKind) -> AppResult<Vec<ApprovalItem>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "{} ORDER BY t.created_at DESC, t.id",
        select_sql(kind)
    ))?;
    let rows = stmt.query_map([], |row| map_item_row(kind, row))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Pending quotations plus pending subcontract works.
pub fn pending_count(conn: &Connection) -> AppResult<i64> {
    Ok(conn.query_row(
        "SELECT (SELECT COUNT(*) FROM quotations WHERE status = 'pending_approval')
              + (SELECT COUNT(*) FROM subcontract_works WHERE status = 'pending_approval')",
        [],
        |row| row.get(0),
    )?)
}
