//! Customer invoices and profit calculation.
//!
//! The pure helpers at the top are the whole of the money logic; the rest
//! of the module gathers a job's cost lines, stores the invoice and moves
//! the job to `invoiced` in one transaction.

use chrono::{Local, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::activity::log_activity;
use crate::auth::{Permission, RequestContext};
use crate::db::{self, with_immediate_tx, DbState};
use crate::error::{parse_column, unique_violation, AppError, AppResult};
use crate::workflow::{self, JobStatus};

/// Flat VAT rate applied to every invoice.
pub const VAT_RATE: f64 = 0.16;

/// Margin below this percentage is shown as low.
pub const LOW_MARGIN_BELOW: f64 = 10.0;
/// Margin at or above this percentage is shown as high.
pub const HIGH_MARGIN_FROM: f64 = 25.0;

const DEFAULT_INVOICE_PREFIX: &str = "INV";

// ---------------------------------------------------------------------------
// Calculations
// ---------------------------------------------------------------------------

/// Round to cents.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn calculate_vat(amount: f64) -> f64 {
    round2(amount * VAT_RATE)
}

pub fn calculate_total_with_vat(amount: f64) -> f64 {
    round2(amount * (1.0 + VAT_RATE))
}

pub fn calculate_profit(amount: f64, cost: f64) -> f64 {
    round2(amount - cost)
}

/// Profit as a percentage of `amount`; 0 when `amount` is 0.
pub fn profit_percentage(profit: f64, amount: f64) -> f64 {
    if amount == 0.0 {
        return 0.0;
    }
    round2(profit / amount * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginBand {
    Low,
    Medium,
    High,
}

impl MarginBand {
    pub fn for_percentage(percentage: f64) -> Self {
        if percentage < LOW_MARGIN_BELOW {
            MarginBand::Low
        } else if percentage < HIGH_MARGIN_FROM {
            MarginBand::Medium
        } else {
            MarginBand::High
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MarginBand::Low => "low",
            MarginBand::Medium => "medium",
            MarginBand::High => "high",
        }
    }
}

/// Cost inputs attributed to one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JobCosts {
    pub parts: f64,
    pub labor: f64,
    pub subcontract: f64,
}

impl JobCosts {
    pub fn total(&self) -> f64 {
        round2(self.parts + self.labor + self.subcontract)
    }
}

/// Figures derived from an invoice amount and the job's cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct InvoiceFigures {
    pub total_amount: f64,
    pub vat_amount: f64,
    pub total_with_vat: f64,
    pub total_cost: f64,
    pub total_profit: f64,
    pub profit_percentage: f64,
    pub margin_band: MarginBand,
}

impl InvoiceFigures {
    /// Amount and cost are rounded to the cent first; every other figure is
    /// derived from the rounded pair, so `total_amount - total_cost` equals
    /// `total_profit` to the cent.
    pub fn compute(amount: f64, cost: f64) -> Self {
        let total_amount = round2(amount);
        let total_cost = round2(cost);
        let total_profit = calculate_profit(total_amount, total_cost);
        let percentage = profit_percentage(total_profit, total_amount);
        InvoiceFigures {
            total_amount,
            vat_amount: calculate_vat(total_amount),
            total_with_vat: calculate_total_with_vat(total_amount),
            total_cost,
            total_profit,
            profit_percentage: percentage,
            margin_band: MarginBand::for_percentage(percentage),
        }
    }
}

/// Parts at their captured unit price, labor at hours x rate, and
/// approved subcontract work only.
pub fn job_costs(conn: &Connection, job_id: &str) -> AppResult<JobCosts> {
    let parts: f64 = conn.query_row(
        "SELECT COALESCE(SUM(quantity * unit_price), 0.0) FROM job_parts WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    let labor: f64 = conn.query_row(
        "SELECT COALESCE(SUM(hours * hourly_rate), 0.0) FROM job_labor WHERE job_id = ?1",
        params![job_id],
        |row| row.get(0),
    )?;
    let subcontract: f64 = conn.query_row(
        "SELECT COALESCE(SUM(cost), 0.0) FROM subcontract_works
         WHERE job_id = ?1 AND status = 'approved'",
        params![job_id],
        |row| row.get(0),
    )?;
    Ok(JobCosts {
        parts: round2(parts),
        labor: round2(labor),
        subcontract: round2(subcontract),
    })
}

pub fn job_costs_for(db: &DbState, job_id: &str) -> AppResult<JobCosts> {
    let conn = db.lock()?;
    workflow::current_status(&conn, job_id)?;
    job_costs(&conn, job_id)
}

// ---------------------------------------------------------------------------
// Invoices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Standard,
    Insurance,
    Warranty,
}

impl InvoiceType {
    pub const ALL: [InvoiceType; 3] = [
        InvoiceType::Standard,
        InvoiceType::Insurance,
        InvoiceType::Warranty,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InvoiceType::Standard => "standard",
            InvoiceType::Insurance => "insurance",
            InvoiceType::Warranty => "warranty",
        }
    }
}

impl fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InvoiceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| AppError::Validation(format!("Unknown invoice type: {s}")))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerInvoice {
    pub id: String,
    pub job_id: String,
    pub number_plate: String,
    pub invoice_number: String,
    pub invoice_type: InvoiceType,
    pub invoice_date: String,
    pub total_amount: f64,
    pub vat_amount: f64,
    pub total_with_vat: f64,
    pub total_cost: f64,
    pub total_profit: f64,
    pub profit_percentage: f64,
    pub created_by: Option<String>,
    pub created_at: String,
}

impl CustomerInvoice {
    pub fn margin_band(&self) -> MarginBand {
        MarginBand::for_percentage(self.profit_percentage)
    }
}

const INVOICE_SELECT: &str = "SELECT i.id, i.job_id, v.number_plate, i.invoice_number, i.invoice_type,
            i.invoice_date, i.total_amount, i.vat_amount, i.total_with_vat, i.total_cost,
            i.total_profit, i.profit_percentage, u.username, i.created_at
     FROM customer_invoices i
     JOIN jobs j ON j.id = i.job_id
     JOIN vehicles v ON v.id = j.vehicle_id
     LEFT JOIN users u ON u.id = i.created_by";

fn map_invoice_row(row: &rusqlite::Row) -> rusqlite::Result<CustomerInvoice> {
    Ok(CustomerInvoice {
        id: row.get(0)?,
        job_id: row.get(1)?,
        number_plate: row.get(2)?,
        invoice_number: row.get(3)?,
        invoice_type: parse_column(row, 4)?,
        invoice_date: row.get(5)?,
        total_amount: row.get(6)?,
        vat_amount: row.get(7)?,
        total_with_vat: row.get(8)?,
        total_cost: row.get(9)?,
        total_profit: row.get(10)?,
        profit_percentage: row.get(11)?,
        created_by: row.get(12)?,
        created_at: row.get(13)?,
    })
}

/// Bill a completed job.
///
/// Computes cost from the job's lines, stores the invoice with its VAT and
/// profit figures, and moves the job to `invoiced`. One invoice per job.
pub fn generate_invoice(
    db: &DbState,
    ctx: &RequestContext,
    job_id: &str,
    amount: f64,
    invoice_type: InvoiceType,
) -> AppResult<CustomerInvoice> {
    ctx.require(Permission::GenerateInvoices)?;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::Validation("Invoice amount must be positive".into()));
    }

    let conn = db.lock()?;
    let invoice_id = with_immediate_tx(&conn, |tx| {
        let status = workflow::current_status(tx, job_id)?;
        if status != JobStatus::Completed {
            return Err(AppError::InvalidTransition {
                from: status.as_str(),
                to: JobStatus::Invoiced.as_str(),
            });
        }

        let costs = job_costs(tx, job_id)?;
        let figures = InvoiceFigures::compute(amount, costs.total());

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(invoice_seq), 0) + 1 FROM customer_invoices",
            [],
            |row| row.get(0),
        )?;
        let prefix = db::get_setting(tx, "billing", "invoice_prefix")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_INVOICE_PREFIX.to_string());
        let invoice_number = format!("{}-{seq:06}", prefix.trim());

        let invoice_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO customer_invoices (
                id, job_id, invoice_seq, invoice_number, invoice_type, invoice_date,
                total_amount, vat_amount, total_with_vat, total_cost, total_profit,
                profit_percentage, created_by, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                invoice_id,
                job_id,
                seq,
                invoice_number,
                invoice_type.as_str(),
                Local::now().date_naive().to_string(),
                figures.total_amount,
                figures.vat_amount,
                figures.total_with_vat,
                figures.total_cost,
                figures.total_profit,
                figures.profit_percentage,
                ctx.user_id,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| unique_violation(e, "The job already has an invoice"))?;

        workflow::apply_transition(
            tx,
            job_id,
            JobStatus::Invoiced,
            ctx,
            &format!("invoice {invoice_number}"),
        )?;
        log_activity(
            tx,
            Some(&ctx.user_id),
            "invoice_generated",
            &format!(
                "job={job_id} invoice={invoice_number} amount={:.2} profit={:.2}",
                figures.total_amount, figures.total_profit
            ),
        );
        info!(
            job_id = %job_id,
            invoice_number = %invoice_number,
            amount = figures.total_amount,
            profit = figures.total_profit,
            "invoice generated"
        );
        Ok(invoice_id)
    })?;

    get_invoice_conn(&conn, &invoice_id)
}

fn get_invoice_conn(conn: &Connection, invoice_id: &str) -> AppResult<CustomerInvoice> {
    conn.query_row(
        &format!("{INVOICE_SELECT} WHERE i.id = ?1"),
        params![invoice_id],
        map_invoice_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Invoice {invoice_id}")))
}

pub fn get_invoice(db: &DbState, invoice_id: &str) -> AppResult<CustomerInvoice> {
    let conn = db.lock()?;
    get_invoice_conn(&conn, invoice_id)
}

pub fn invoice_for_job(db: &DbState, job_id: &str) -> AppResult<Option<CustomerInvoice>> {
    let conn = db.lock()?;
    Ok(conn
        .query_row(
            &format!("{INVOICE_SELECT} WHERE i.job_id = ?1"),
            params![job_id],
            map_invoice_row,
        )
        .optional()?)
}

/// Invoices, newest first.
pub fn list_invoices(db: &DbState) -> AppResult<Vec<CustomerInvoice>> {
    let conn = db.lock()?;
    list_invoices_conn(&conn)
}

pub(crate) fn list_invoices_conn(conn: &Connection) -> AppResult<Vec<CustomerInvoice>> {
    let mut stmt = conn.prepare(&format!("{INVOICE_SELECT} ORDER BY i.invoice_seq DESC"))?;
    let rows = stmt.query_map([], map_invoice_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::{self, ApprovalKind};
    use crate::auth::tests::seed_user;
    use crate::auth::Role;
    use crate::inventory::tests::seed_part;
    use crate::jobs::{self, tests::seed_job};

    #[test]
    fn test_vat() {
        assert_eq!(calculate_vat(1000.0), 160.0);
        assert_eq!(calculate_total_with_vat(1000.0), 1160.0);
        assert_eq!(calculate_vat(0.0), 0.0);
    }

    #[test]
    fn test_profit_and_percentage() {
        let figures = InvoiceFigures::compute(5000.0, 4000.0);
        assert_eq!(figures.total_profit, 1000.0);
        assert_eq!(figures.profit_percentage, 20.0);
        assert_eq!(figures.margin_band, MarginBand::Medium);
        assert_eq!(figures.total_profit, figures.total_amount - figures.total_cost);
    }

    #[test]
    fn test_profit_follows_rounded_amount_and_cost() {
        // Rounded separately these would give 0.01 - 0.00 against a profit of 0.00.
        let figures = InvoiceFigures::compute(0.006, 0.004);
        assert_eq!(figures.total_amount, 0.01);
        assert_eq!(figures.total_cost, 0.0);
        assert_eq!(figures.total_profit, 0.01);

        for (amount, cost) in [(1.1, 0.8), (5000.0, 4000.0), (99.995, 12.345)] {
            let figures = InvoiceFigures::compute(amount, cost);
            let diff = figures.total_amount - figures.total_cost - figures.total_profit;
            assert!(diff.abs() < 0.005, "{amount} - {cost} drifted by {diff}");
        }
    }

    #[test]
    fn test_zero_amount_has_zero_percentage() {
        assert_eq!(profit_percentage(-300.0, 0.0), 0.0);
        let figures = InvoiceFigures::compute(0.0, 300.0);
        assert_eq!(figures.total_profit, -300.0);
        assert_eq!(figures.profit_percentage, 0.0);
    }

    #[test]
    fn test_margin_bands() {
        assert_eq!(MarginBand::for_percentage(-5.0), MarginBand::Low);
        assert_eq!(MarginBand::for_percentage(9.99), MarginBand::Low);
        assert_eq!(MarginBand::for_percentage(10.0), MarginBand::Medium);
        assert_eq!(MarginBand::for_percentage(24.99), MarginBand::Medium);
        assert_eq!(MarginBand::for_percentage(25.0), MarginBand::High);
    }

    fn complete_job(db: &DbState, job_id: &str) {
        let conn = db.lock().expect("db lock");
        conn.execute(
            "UPDATE jobs SET status = 'completed' WHERE id = ?1",
            params![job_id],
        )
        .expect("force completed");
    }

    #[test]
    fn test_job_costs_include_only_approved_subcontracts() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KAA123A");
        let part_id = seed_part(&db, "BP-01", 1000.0, 5);
        jobs::add_part(&db, &director, &job_id, &part_id, 2).expect("parts");
        jobs::add_labor(&db, &director, &job_id, "Fit", 2.0, 500.0).expect("labor");
        let approved = approvals::submit_subcontract(&db, &director, &job_id, "A", "Paint", 700.0)
            .expect("subcontract");
        approvals::submit_subcontract(&db, &director, &job_id, "B", "Glass", 900.0)
            .expect("pending subcontract");
        approvals::approve(&db, &director, ApprovalKind::Subcontract, &approved.id)
            .expect("approve");

        let costs = job_costs_for(&db, &job_id).expect("costs");
        assert_eq!(costs.parts, 2000.0);
        assert_eq!(costs.labor, 1000.0);
        assert_eq!(costs.subcontract, 700.0);
        assert_eq!(costs.total(), 3700.0);
    }

    #[test]
    fn test_generate_invoice_requires_completed_job() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let job_id = seed_job(&db, &director, "KAA123A");

        let err = generate_invoice(&db, &director, &job_id, 1000.0, InvoiceType::Standard)
            .expect_err("open job");
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn test_generate_invoice_permissions_and_amount() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let staff = seed_user(&db, "tech", Role::Staff);
        let job_id = seed_job(&db, &director, "KAA123A");
        complete_job(&db, &job_id);

        let err = generate_invoice(&db, &staff, &job_id, 1000.0, InvoiceType::Standard)
            .expect_err("staff");
        assert!(matches!(err, AppError::Unauthorized(_)));
        let err = generate_invoice(&db, &director, &job_id, 0.0, InvoiceType::Standard)
            .expect_err("zero amount");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_generate_invoice_stores_figures_and_moves_job() {
        let db = db::test_db();
        let officer = seed_user(&db, "proc", Role::ProcurementOfficer);
        let job_id = seed_job(&db, &officer, "KAA123A");
        jobs::add_labor(&db, &officer, &job_id, "Diagnosis", 4.0, 1000.0).expect("labor");
        complete_job(&db, &job_id);

        let invoice = generate_invoice(&db, &officer, &job_id, 5000.0, InvoiceType::Insurance)
            .expect("invoice");
        assert_eq!(invoice.invoice_number, "INV-000001");
        assert_eq!(invoice.invoice_type, InvoiceType::Insurance);
        assert_eq!(invoice.total_cost, 4000.0);
        assert_eq!(invoice.total_profit, 1000.0);
        assert_eq!(invoice.profit_percentage, 20.0);
        assert_eq!(invoice.vat_amount, 800.0);
        assert_eq!(invoice.total_with_vat, 5800.0);
        assert_eq!(
            jobs::get_job(&db, &job_id).expect("job").status,
            JobStatus::Invoiced
        );

        let again = generate_invoice(&db, &officer, &job_id, 5000.0, InvoiceType::Standard)
            .expect_err("second invoice");
        assert!(matches!(again, AppError::InvalidTransition { .. }));
        assert_eq!(list_invoices(&db).expect("invoices").len(), 1);
    }

    #[test]
    fn test_invoice_numbers_follow_prefix_setting() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        {
            let conn = db.lock().expect("db lock");
            db::set_setting(&conn, "billing", "invoice_prefix", "GB").expect("prefix");
        }
        for plate in ["KAA111A", "KAA222A"] {
            let job_id = seed_job(&db, &director, plate);
            complete_job(&db, &job_id);
            generate_invoice(&db, &director, &job_id, 100.0, InvoiceType::Standard)
                .expect("invoice");
        }
        let numbers: Vec<_> = list_invoices(&db)
            .expect("invoices")
            .into_iter()
            .map(|i| i.invoice_number)
            .collect();
        assert_eq!(numbers, vec!["GB-000002", "GB-000001"]);
    }
}
