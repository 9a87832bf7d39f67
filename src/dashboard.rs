//! Dashboard figures, recomputed on every request.

use rusqlite::Connection;
use serde::Serialize;
use tracing::debug;

use crate::activity::{self, ActivityEntry};
use crate::approvals;
use crate::auth::{Permission, RequestContext};
use crate::billing::round2;
use crate::db::DbState;
use crate::error::AppResult;
use crate::workflow::JobStatus;

const RECENT_ACTIVITY_LIMIT: i64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: JobStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub total_jobs: i64,
    pub open_jobs: i64,
    pub total_revenue: f64,
    pub total_profit: f64,
    pub average_margin: f64,
    /// Only populated for directors.
    pub pending_approvals: Option<i64>,
    pub jobs_by_status: Vec<StatusCount>,
    pub recent_activity: Vec<ActivityEntry>,
}

/// `total_profit / total_revenue * 100`, 0 without revenue.
pub fn average_margin(total_profit: f64, total_revenue: f64) -> f64 {
    if total_revenue == 0.0 {
        return 0.0;
    }
    round2(total_profit / total_revenue * 100.0)
}

fn jobs_by_status(conn: &Connection) -> AppResult<Vec<StatusCount>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut counts: Vec<StatusCount> = JobStatus::ALL
        .into_iter()
        .map(|status| StatusCount { status, count: 0 })
        .collect();
    for row in rows {
        let (status, count) = row?;
        let status: JobStatus = status.parse()?;
        if let Some(entry) = counts.iter_mut().find(|c| c.status == status) {
            entry.count = count;
        }
    }
    Ok(counts)
}

pub fn stats(db: &DbState, ctx: &RequestContext) -> AppResult<DashboardStats> {
    ctx.require(Permission::ViewDashboard)?;
    let conn = db.lock()?;

    let jobs_by_status = jobs_by_status(&conn)?;
    let total_jobs: i64 = jobs_by_status.iter().map(|c| c.count).sum();
    let open_jobs: i64 = jobs_by_status
        .iter()
        .filter(|c| c.status.is_open())
        .map(|c| c.count)
        .sum();

    let (total_revenue, total_profit): (f64, f64) = conn.query_row(
        "SELECT COALESCE(SUM(total_amount), 0.0), COALESCE(SUM(total_profit), 0.0)
         FROM customer_invoices",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let pending_approvals = if ctx.is_director() {
        Some(approvals::pending_count(&conn)?)
    } else {
        None
    };

    let recent_activity = activity::recent(&conn, RECENT_ACTIVITY_LIMIT)?;

    debug!(
        total_jobs,
        open_jobs,
        total_revenue,
        user = %ctx.username,
        "dashboard computed"
    );

    Ok(DashboardStats {
        total_jobs,
        open_jobs,
        total_revenue: round2(total_revenue),
        total_profit: round2(total_profit),
        average_margin: average_margin(total_profit, total_revenue),
        pending_approvals,
        jobs_by_status,
        recent_activity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::submit_subcontract;
    use crate::auth::tests::seed_user;
    use crate::auth::Role;
    use crate::billing::{generate_invoice, InvoiceType};
    use crate::db;
    use crate::jobs::{self, tests::seed_job};
    use rusqlite::params;

    #[test]
    fn test_average_margin_guarded() {
        assert_eq!(average_margin(0.0, 0.0), 0.0);
        assert_eq!(average_margin(250.0, 1000.0), 25.0);
        assert_eq!(average_margin(-100.0, 1000.0), -10.0);
    }

    #[test]
    fn test_empty_dashboard() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let stats = stats(&db, &director).expect("stats");
        assert_eq!(stats.total_jobs, 0);
        assert_eq!(stats.open_jobs, 0);
        assert_eq!(stats.total_revenue, 0.0);
        assert_eq!(stats.average_margin, 0.0);
        assert_eq!(stats.pending_approvals, Some(0));
        assert_eq!(stats.jobs_by_status.len(), JobStatus::ALL.len());
    }

    #[test]
    fn test_dashboard_aggregates() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let staff = seed_user(&db, "tech", Role::Staff);

        let open_job = seed_job(&db, &director, "KAA111A");
        let billed_job = seed_job(&db, &director, "KAA222A");
        let closed_job = seed_job(&db, &director, "KAA333A");
        jobs::add_labor(&db, &director, &billed_job, "Service", 3.0, 1000.0).expect("labor");
        {
            let conn = db.lock().expect("db lock");
            conn.execute(
                "UPDATE jobs SET status = 'completed' WHERE id = ?1",
                params![billed_job],
            )
            .expect("complete");
            conn.execute(
                "UPDATE jobs SET status = 'closed' WHERE id = ?1",
                params![closed_job],
            )
            .expect("close");
        }
        generate_invoice(&db, &director, &billed_job, 4000.0, InvoiceType::Standard)
            .expect("invoice");
        submit_subcontract(&db, &staff, &open_job, "Body shop", "Panel", 500.0)
            .expect("subcontract");

        let stats = stats(&db, &director).expect("stats");
        assert_eq!(stats.total_jobs, 3);
        assert_eq!(stats.open_jobs, 1);
        assert_eq!(stats.total_revenue, 4000.0);
        assert_eq!(stats.total_profit, 1000.0);
        assert_eq!(stats.average_margin, 25.0);
        assert_eq!(stats.pending_approvals, Some(1));
        assert!(!stats.recent_activity.is_empty());
        assert!(stats.recent_activity.len() <= 10);

        let invoiced = stats
            .jobs_by_status
            .iter()
            .find(|c| c.status == JobStatus::Invoiced)
            .expect("invoiced row");
        assert_eq!(invoiced.count, 1);

        let staff_view = super::stats(&db, &staff).expect("staff stats");
        assert_eq!(staff_view.pending_approvals, None);
        assert_eq!(staff_view.total_jobs, 3);
    }
}
