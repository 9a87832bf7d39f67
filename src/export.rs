//! CSV exports of jobs, invoices and inventory.
//!
//! Fields are quoted per RFC 4180 when they contain a comma, quote or line
//! break. Text fields that a spreadsheet would evaluate as a formula are
//! prefixed with `'`.

use std::str::FromStr;

use tracing::info;

use crate::auth::{Permission, RequestContext};
use crate::billing;
use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::inventory;
use crate::jobs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTable {
    Jobs,
    Invoices,
    Inventory,
}

impl ExportTable {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportTable::Jobs => "jobs",
            ExportTable::Invoices => "invoices",
            ExportTable::Inventory => "inventory",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.csv", self.as_str())
    }
}

impl FromStr for ExportTable {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_end_matches(".csv") {
            "jobs" => Ok(ExportTable::Jobs),
            "invoices" => Ok(ExportTable::Invoices),
            "inventory" => Ok(ExportTable::Inventory),
            other => Err(AppError::NotFound(format!("Export {other}"))),
        }
    }
}

fn should_neutralize(value: &str) -> bool {
    matches!(
        value.trim_start().chars().next(),
        Some('=') | Some('+') | Some('-') | Some('@')
    )
}

/// Escape one text field.
pub fn escape_field(value: &str) -> String {
    let safe = if should_neutralize(value) {
        format!("'{value}")
    } else {
        value.to_string()
    };
    if safe.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", safe.replace('"', "\"\""))
    } else {
        safe
    }
}

fn money(value: f64) -> String {
    format!("{value:.2}")
}

fn write_row(out: &mut String, fields: &[String]) {
    out.push_str(&fields.join(","));
    out.push_str("\r\n");
}

fn header(out: &mut String, columns: &[&str]) {
    let fields: Vec<String> = columns.iter().map(|c| escape_field(c)).collect();
    write_row(out, &fields);
}

fn jobs_csv(db: &DbState) -> AppResult<String> {
    let mut out = String::new();
    header(
        &mut out,
        &["id", "number_plate", "description", "status", "created_by", "created_at", "updated_at"],
    );
    for job in jobs::list_jobs(db, None)? {
        write_row(
            &mut out,
            &[
                escape_field(&job.id),
                escape_field(&job.number_plate),
                escape_field(&job.description),
                escape_field(job.status.as_str()),
                escape_field(job.created_by_name.as_deref().unwrap_or("")),
                escape_field(&job.created_at),
                escape_field(&job.updated_at),
            ],
        );
    }
    Ok(out)
}

fn invoices_csv(db: &DbState) -> AppResult<String> {
    let mut out = String::new();
    header(
        &mut out,
        &[
            "invoice_number",
            "invoice_date",
            "invoice_type",
            "number_plate",
            "total_amount",
            "vat_amount",
            "total_with_vat",
            "total_cost",
            "total_profit",
            "profit_percentage",
        ],
    );
    for invoice in billing::list_invoices(db)? {
        write_row(
            &mut out,
            &[
                escape_field(&invoice.invoice_number),
                escape_field(&invoice.invoice_date),
                escape_field(invoice.invoice_type.as_str()),
                escape_field(&invoice.number_plate),
                money(invoice.total_amount),
                money(invoice.vat_amount),
                money(invoice.total_with_vat),
                money(invoice.total_cost),
                money(invoice.total_profit),
                money(invoice.profit_percentage),
            ],
        );
    }
    Ok(out)
}

fn inventory_csv(db: &DbState) -> AppResult<String> {
    let mut out = String::new();
    header(
        &mut out,
        &["part_number", "name", "unit_price", "quantity_in_stock", "supplier"],
    );
    for part in inventory::list_parts(db)? {
        write_row(
            &mut out,
            &[
                escape_field(&part.part_number),
                escape_field(&part.name),
                money(part.unit_price),
                part.quantity_in_stock.to_string(),
                escape_field(part.supplier_name.as_deref().unwrap_or("")),
            ],
        );
    }
    Ok(out)
}

/// Render `table` as CSV for `ctx`.
pub fn export_csv(db: &DbState, ctx: &RequestContext, table: ExportTable) -> AppResult<String> {
    ctx.require(Permission::ExportData)?;
    let csv = match table {
        ExportTable::Jobs => jobs_csv(db)?,
        ExportTable::Invoices => invoices_csv(db)?,
        ExportTable::Inventory => inventory_csv(db)?,
    };
    info!(table = table.as_str(), user = %ctx.username, bytes = csv.len(), "csv export");
    Ok(csv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::seed_user;
    use crate::auth::Role;
    use crate::db;
    use crate::inventory::tests::seed_part;
    use crate::jobs::NewJob;

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
        assert_eq!(escape_field("=SUM(A1)"), "'=SUM(A1)");
    }

    #[test]
    fn test_export_table_parse() {
        assert_eq!("jobs.csv".parse::<ExportTable>().expect("jobs"), ExportTable::Jobs);
        assert_eq!("inventory".parse::<ExportTable>().expect("inventory"), ExportTable::Inventory);
        assert!(matches!(
            "users".parse::<ExportTable>(),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_jobs_export_quotes_fields() {
        let db = db::test_db();
        let officer = seed_user(&db, "proc", Role::ProcurementOfficer);
        jobs::create_job(
            &db,
            &officer,
            &NewJob {
                number_plate: "KAA123A".into(),
                description: "Brakes, \"urgent\"".into(),
                ..Default::default()
            },
        )
        .expect("job");

        let csv = export_csv(&db, &officer, ExportTable::Jobs).expect("csv");
        let mut lines = csv.split("\r\n");
        assert!(lines.next().expect("header").starts_with("id,number_plate,description"));
        let row = lines.next().expect("row");
        assert!(row.contains("KAA123A"));
        assert!(row.contains("\"Brakes, \"\"urgent\"\"\""));
        assert!(row.contains(",open,"));
    }

    #[test]
    fn test_inventory_export_and_permission() {
        let db = db::test_db();
        let officer = seed_user(&db, "proc", Role::ProcurementOfficer);
        let staff = seed_user(&db, "tech", Role::Staff);
        seed_part(&db, "OF-01", 12.5, 4);

        let csv = export_csv(&db, &officer, ExportTable::Inventory).expect("csv");
        assert!(csv.contains("OF-01"));
        assert!(csv.contains("12.50,4"));

        let err = export_csv(&db, &staff, ExportTable::Invoices).expect_err("staff");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }
}
