//! Repair jobs and their cost lines.
//!
//! A job belongs to one vehicle and carries part and labor lines. Part
//! lines move stock: adding a line takes the quantity out of
//! `inventory_parts` and removing it puts the quantity back, both inside a
//! single write transaction. Status changes go through [`crate::workflow`].

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::activity::log_activity;
use crate::auth::{Permission, RequestContext};
use crate::db::{with_immediate_tx, DbState};
use crate::error::{parse_column, AppError, AppResult};
use crate::vehicles::{self, VehicleDetails};
use crate::workflow::{self, JobStatus};

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub vehicle_id: String,
    pub number_plate: String,
    pub description: String,
    pub status: JobStatus,
    pub created_by: Option<String>,
    pub created_by_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPart {
    pub id: String,
    pub part_id: String,
    pub part_number: String,
    pub part_name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub line_total: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobLabor {
    pub id: String,
    pub description: String,
    pub hours: f64,
    pub hourly_rate: f64,
    pub line_total: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusChange {
    pub from_status: Option<String>,
    pub to_status: String,
    pub changed_by: Option<String>,
    pub note: String,
    pub changed_at: String,
}

/// Input for [`create_job`].
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub number_plate: String,
    pub description: String,
    pub vehicle: VehicleDetails,
}

const JOB_SELECT: &str = "SELECT j.id, j.vehicle_id, v.number_plate, j.description, j.status,
            j.created_by, u.username, j.created_at, j.updated_at
     FROM jobs j
     JOIN vehicles v ON v.id = j.vehicle_id
     LEFT JOIN users u ON u.id = j.created_by";

fn map_job_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        vehicle_id: row.get(1)?,
        number_plate: row.get(2)?,
        description: row.get(3)?,
        status: parse_column(row, 4)?,
        created_by: row.get(5)?,
        created_by_name: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Parts and labor can only change while the job has not been billed.
fn ensure_editable(status: JobStatus) -> AppResult<()> {
    if matches!(status, JobStatus::Invoiced | JobStatus::Closed) {
        return Err(AppError::Validation(format!(
            "Job is {} and can no longer be changed",
            status.label().to_lowercase()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Open a new job for a vehicle, registering the vehicle on first sight.
pub fn create_job(db: &DbState, ctx: &RequestContext, input: &NewJob) -> AppResult<Job> {
    ctx.require(Permission::ManageJobs)?;
    let description = input.description.trim();
    if description.is_empty() {
        return Err(AppError::Validation("Job description is required".into()));
    }

    let conn = db.lock()?;
    let job_id = with_immediate_tx(&conn, |tx| {
        let vehicle = vehicles::find_or_create(tx, &input.number_plate, &input.vehicle)?;
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO jobs (id, vehicle_id, description, status, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?5, ?5)",
            params![job_id, vehicle.id, description, ctx.user_id, now],
        )?;
        workflow::record_history(tx, &job_id, None, JobStatus::Open, &ctx.user_id, "created")?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "job_created",
            &format!("job={job_id} plate={}", vehicle.number_plate),
        );
        Ok(job_id)
    })?;

    info!(job_id = %job_id, user = %ctx.username, "job created");
    get_job_conn(&conn, &job_id)
}

pub(crate) fn get_job_conn(conn: &Connection, job_id: &str) -> AppResult<Job> {
    conn.query_row(
        &format!("{JOB_SELECT} WHERE j.id = ?1"),
        params![job_id],
        map_job_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Job {job_id}")))
}

pub fn get_job(db: &DbState, job_id: &str) -> AppResult<Job> {
    let conn = db.lock()?;
    get_job_conn(&conn, job_id)
}

/// List jobs, newest first, optionally restricted to one status.
pub fn list_jobs(db: &DbState, status: Option<JobStatus>) -> AppResult<Vec<Job>> {
    let conn = db.lock()?;
    list_jobs_conn(&conn, status)
}

pub(crate) fn list_jobs_conn(conn: &Connection, status: Option<JobStatus>) -> AppResult<Vec<Job>> {
    let mut stmt = conn.prepare(&format!(
        "{JOB_SELECT} WHERE (?1 IS NULL OR j.status = ?1) ORDER BY j.created_at DESC, j.id"
    ))?;
    let rows = stmt.query_map(params![status.map(JobStatus::as_str)], map_job_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn update_description(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    description: &str,
) -> AppResult<()> {
    ctx.require(Permission::ManageJobs)?;
    let description = description.trim();
    if description.is_empty() {
        return Err(AppError::Validation("Job description is required".into()));
    }
    let conn = db.lock()?;
    let status = workflow::current_status(&conn, job_id)?;
    ensure_editable(status)?;
    conn.execute(
        "UPDATE jobs SET description = ?1, updated_at = ?2 WHERE id = ?3",
        params![description, Utc::now().to_rfc3339(), job_id],
    )?;
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "job_updated",
        &format!("job={job_id}"),
    );
    Ok(())
}

/// Delete a job. Part lines are removed by cascade; their stock is put back
/// first so the inventory stays consistent.
pub fn delete_job(db: &DbState, ctx: &RequestContext, job_id: &str) -> AppResult<()> {
    ctx.require(Permission::DeleteJobs)?;
    let conn = db.lock()?;
    with_immediate_tx(&conn, |tx| {
        let status = workflow::current_status(tx, job_id)?;
        if status == JobStatus::Invoiced {
            return Err(AppError::Validation(
                "Invoiced jobs cannot be deleted; close them instead".into(),
            ));
        }
        let invoice_number: Option<String> = tx
            .query_row(
                "SELECT invoice_number FROM customer_invoices WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(number) = invoice_number {
            return Err(AppError::Validation(format!(
                "Job has been billed on invoice {number} and cannot be deleted"
            )));
        }
        tx.execute(
            "UPDATE inventory_parts SET
                quantity_in_stock = quantity_in_stock + (
                    SELECT COALESCE(SUM(jp.quantity), 0) FROM job_parts jp
                    WHERE jp.part_id = inventory_parts.id AND jp.job_id = ?1
                ),
                updated_at = ?2
             WHERE id IN (SELECT part_id FROM job_parts WHERE job_id = ?1)",
            params![job_id, Utc::now().to_rfc3339()],
        )?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![job_id])?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "job_deleted",
            &format!("job={job_id}"),
        );
        Ok(())
    })?;
    info!(job_id = %job_id, user = %ctx.username, "job deleted");
    Ok(())
}

pub fn status_history(db: &DbState, job_id: &str) -> AppResult<Vec<StatusChange>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT h.from_status, h.to_status, u.username, h.note, h.changed_at
         FROM job_status_history h
         LEFT JOIN users u ON u.id = h.changed_by
         WHERE h.job_id = ?1
         ORDER BY h.id",
    )?;
    let rows = stmt.query_map(params![job_id], |row| {
        Ok(StatusChange {
            from_status: row.get(0)?,
            to_status: row.get(1)?,
            changed_by: row.get(2)?,
            note: row.get(3)?,
            changed_at: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Part lines
// ---------------------------------------------------------------------------

/// Use `quantity` of an inventory part on a job at the part's current price.
pub fn add_part(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    part_id: &str,
    quantity: i64,
) -> AppResult<JobPart> {
    ctx.require(Permission::ManageJobs)?;
    if quantity <= 0 {
        return Err(AppError::Validation("Quantity must be positive".into()));
    }

    let conn = db.lock()?;
    let line_id = with_immediate_tx(&conn, |tx| {
        ensure_editable(workflow::current_status(tx, job_id)?)?;

        let (part_name, unit_price, in_stock): (String, f64, i64) = tx
            .query_row(
                "SELECT name, unit_price, quantity_in_stock FROM inventory_parts WHERE id = ?1",
                params![part_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("Part {part_id}")))?;

        if quantity > in_stock {
            return Err(AppError::Validation(format!(
                "Only {in_stock} of {part_name} in stock"
            )));
        }

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "UPDATE inventory_parts SET quantity_in_stock = quantity_in_stock - ?1, updated_at = ?2
             WHERE id = ?3",
            params![quantity, now, part_id],
        )?;

        let line_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO job_parts (id, job_id, part_id, quantity, unit_price, added_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![line_id, job_id, part_id, quantity, unit_price, ctx.user_id, now],
        )?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "job_part_added",
            &format!("job={job_id} part={part_id} qty={quantity}"),
        );
        Ok(line_id)
    })?;

    list_parts_conn(&conn, job_id)?
        .into_iter()
        .find(|line| line.id == line_id)
        .ok_or_else(|| AppError::Internal("inserted part line missing".into()))
}

/// Remove a part line and return its quantity to stock.
pub fn remove_part(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    line_id: &str,
) -> AppResult<()> {
    ctx.require(Permission::ManageJobs)?;
    let conn = db.lock()?;
    with_immediate_tx(&conn, |tx| {
        ensure_editable(workflow::current_status(tx, job_id)?)?;
        let (part_id, quantity): (String, i64) = tx
            .query_row(
                "SELECT part_id, quantity FROM job_parts WHERE id = ?1 AND job_id = ?2",
                params![line_id, job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| AppError::NotFound(format!("Part line {line_id}")))?;

        tx.execute("DELETE FROM job_parts WHERE id = ?1", params![line_id])?;
        tx.execute(
            "UPDATE inventory_parts SET quantity_in_stock = quantity_in_stock + ?1, updated_at = ?2
             WHERE id = ?3",
            params![quantity, Utc::now().to_rfc3339(), part_id],
        )?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "job_part_removed",
            &format!("job={job_id} part={part_id} qty={quantity}"),
        );
        Ok(())
    })
}

pub fn list_parts(db: &DbState, job_id: &str) -> AppResult<Vec<JobPart>> {
    let conn = db.lock()?;
    list_parts_conn(&conn, job_id)
}

fn list_parts_conn(conn: &Connection, job_id: &str) -> AppResult<Vec<JobPart>> {
    let mut stmt = conn.prepare(
        "SELECT jp.id, jp.part_id, p.part_number, p.name, jp.quantity, jp.unit_price, jp.created_at
         FROM job_parts jp
         JOIN inventory_parts p ON p.id = jp.part_id
         WHERE jp.job_id = ?1
         ORDER BY jp.created_at, jp.id",
    )?;
    let rows = stmt.query_map(params![job_id], |row| {
        let quantity: i64 = row.get(4)?;
        let unit_price: f64 = row.get(5)?;
        Ok(JobPart {
            id: row.get(0)?,
            part_id: row.get(1)?,
            part_number: row.get(2)?,
            part_name: row.get(3)?,
            quantity,
            unit_price,
            line_total: quantity as f64 * unit_price,
            created_at: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Labor lines
// ---------------------------------------------------------------------------

pub fn add_labor(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    description: &str,
    hours: f64,
    hourly_rate: f64,
) -> AppResult<JobLabor> {
    ctx.require(Permission::ManageJobs)?;
    let description = description.trim();
    if description.is_empty() {
        return Err(AppError::Validation("Labor description is required".into()));
    }
    if !hours.is_finite() || hours <= 0.0 {
        return Err(AppError::Validation("Hours must be positive".into()));
    }
    if !hourly_rate.is_finite() || hourly_rate < 0.0 {
        return Err(AppError::Validation("Hourly rate cannot be negative".into()));
    }

    let conn = db.lock()?;
    ensure_editable(workflow::current_status(&conn, job_id)?)?;

    let labor = JobLabor {
        id: Uuid::new_v4().to_string(),
        description: description.to_string(),
        hours,
        hourly_rate,
        line_total: hours * hourly_rate,
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO job_labor (id, job_id, description, hours, hourly_rate, added_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            labor.id,
            job_id,
            labor.description,
            hours,
            hourly_rate,
            ctx.user_id,
            labor.created_at
        ],
    )?;
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "job_labor_added",
        &format!("job={job_id} hours={hours}"),
    );
    Ok(labor)
}

pub fn list_labor(db: &DbState, job_id: &str) -> AppResult<Vec<JobLabor>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, description, hours, hourly_rate, created_at
         FROM job_labor WHERE job_id = ?1
         ORDER BY created_at, id",
    )?;
    let rows = stmt.query_map(params![job_id], |row| {
        let hours: f64 = row.get(2)?;
        let hourly_rate: f64 = row.get(3)?;
        Ok(JobLabor {
            id: row.get(0)?,
            description: row.get(1)?,
            hours,
            hourly_rate,
            line_total: hours * hourly_rate,
            created_at: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::seed_user;
    use crate::auth::Role;
    use crate::db;
    use crate::inventory::tests::seed_part;

    /// Create an open job for `plate` and return its id.
    pub(crate) fn seed_job(db: &DbState, ctx: &RequestContext, plate: &str) -> String {
        create_job(
            db,
            ctx,
            &NewJob {
                number_plate: plate.to_string(),
                description: "Service".to_string(),
                vehicle: VehicleDetails::default(),
            },
        )
        .expect("create job")
        .id
    }

    fn stock_of(db: &DbState, part_id: &str) -> i64 {
        let conn = db.lock().expect("db lock");
        conn.query_row(
            "SELECT quantity_in_stock FROM inventory_parts WHERE id = ?1",
            params![part_id],
            |row| row.get(0),
        )
        .expect("stock")
    }

    #[test]
    fn test_create_job_starts_open_with_history() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let job = create_job(
            &db,
            &staff,
            &NewJob {
                number_plate: "kaa 123a".into(),
                description: "Replace brake pads".into(),
                vehicle: VehicleDetails::default(),
            },
        )
        .expect("create job");

        assert_eq!(job.status, JobStatus::Open);
        assert_eq!(job.number_plate, "KAA123A");
        assert_eq!(job.created_by_name.as_deref(), Some("tech"));
        let history = status_history(&db, &job.id).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, None);
        assert_eq!(history[0].to_status, "open");
    }

    #[test]
    fn test_create_job_requires_description() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let err = create_job(
            &db,
            &staff,
            &NewJob {
                number_plate: "KAA123A".into(),
                description: "  ".into(),
                vehicle: VehicleDetails::default(),
            },
        )
        .expect_err("empty description");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_list_jobs_filters_by_status() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let first = seed_job(&db, &staff, "KAA111A");
        seed_job(&db, &staff, "KAA222A");
        workflow::transition(
            &db,
            &first,
            JobStatus::AwaitingQuotationApproval,
            &staff,
            "",
        )
        .expect("advance");

        assert_eq!(list_jobs(&db, None).expect("all").len(), 2);
        let waiting =
            list_jobs(&db, Some(JobStatus::AwaitingQuotationApproval)).expect("filtered");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, first);
    }

    #[test]
    fn test_add_part_moves_stock_and_checks_availability() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &staff, "KAA123A");
        let part_id = seed_part(&db, "BP-01", 1500.0, 4);

        let line = add_part(&db, &staff, &job_id, &part_id, 3).expect("add part");
        assert_eq!(line.line_total, 4500.0);
        assert_eq!(stock_of(&db, &part_id), 1);

        let err = add_part(&db, &staff, &job_id, &part_id, 2).expect_err("not enough stock");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(stock_of(&db, &part_id), 1);

        remove_part(&db, &staff, &job_id, &line.id).expect("remove part");
        assert_eq!(stock_of(&db, &part_id), 4);
        assert!(list_parts(&db, &job_id).expect("parts").is_empty());
    }

    #[test]
    fn test_add_labor_validates_input() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &staff, "KAA123A");

        let err = add_labor(&db, &staff, &job_id, "Fit pads", 0.0, 500.0).expect_err("zero hours");
        assert!(matches!(err, AppError::Validation(_)));
        let labor = add_labor(&db, &staff, &job_id, "Fit pads", 2.5, 800.0).expect("labor");
        assert_eq!(labor.line_total, 2000.0);
        assert_eq!(list_labor(&db, &job_id).expect("labor lines").len(), 1);
    }

    #[test]
    fn test_delete_job_cascades_and_restores_stock() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &staff, "KAA123A");
        let part_id = seed_part(&db, "OF-01", 300.0, 5);
        add_part(&db, &staff, &job_id, &part_id, 2).expect("add part");
        add_labor(&db, &staff, &job_id, "Oil change", 1.0, 500.0).expect("labor");

        let err = delete_job(&db, &staff, &job_id).expect_err("staff cannot delete");
        assert!(matches!(err, AppError::Unauthorized(_)));

        delete_job(&db, &director, &job_id).expect("delete");
        assert_eq!(stock_of(&db, &part_id), 5);
        let conn = db.lock().expect("db lock");
        let lines: i64 = conn
            .query_row("SELECT COUNT(*) FROM job_parts", [], |row| row.get(0))
            .expect("count lines");
        let history: i64 = conn
            .query_row("SELECT COUNT(*) FROM job_status_history", [], |row| row.get(0))
            .expect("count history");
        assert_eq!(lines, 0);
        assert_eq!(history, 0);
    }

    #[test]
    fn test_billed_job_cannot_be_deleted_after_closing() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KAA123A");
        add_labor(&db, &director, &job_id, "Engine rebuild", 5.0, 800.0).expect("labor");
        {
            let conn = db.lock().expect("db lock");
            conn.execute(
                "UPDATE jobs SET status = 'completed' WHERE id = ?1",
                params![job_id],
            )
            .expect("complete");
        }
        crate::billing::generate_invoice(
            &db,
            &director,
            &job_id,
            5000.0,
            crate::billing::InvoiceType::Standard,
        )
        .expect("invoice");
        workflow::transition(&db, &job_id, JobStatus::Closed, &director, "paid").expect("close");

        let err = delete_job(&db, &director, &job_id).expect_err("billed job");
        assert!(matches!(err, AppError::Validation(_)));

        let conn = db.lock().expect("db lock");
        let invoices: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM customer_invoices WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .expect("count invoices");
        assert_eq!(invoices, 1);
    }

    #[test]
    fn test_closed_job_is_read_only() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KAA123A");
        workflow::transition(&db, &job_id, JobStatus::Closed, &director, "cancelled")
            .expect("cancel");
        let err =
            add_labor(&db, &director, &job_id, "Late work", 1.0, 100.0).expect_err("closed job");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
