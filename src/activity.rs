//! Activity/audit log.
//!
//! Every login attempt, status change, approval decision and billing write
//! leaves a row in `activity_log`. Insert failures are logged and then
//! ignored: the audit trail never blocks the operation it describes.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::warn;

use crate::error::AppResult;

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub action: String,
    pub details: String,
    pub created_at: String,
}

/// Append an entry. `user_id` is `None` for anonymous events such as a
/// failed login with an unknown username.
pub fn log_activity(conn: &Connection, user_id: Option<&str>, action: &str, details: &str) {
    let now = Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO activity_log (user_id, action, details, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![user_id, action, details, now],
    ) {
        warn!(action = %action, error = %e, "activity log insert failed");
    }
}

/// Most recent entries first.
pub fn recent(conn: &Connection, limit: i64) -> AppResult<Vec<ActivityEntry>> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.user_id, u.username, a.action, a.details, a.created_at
         FROM activity_log a
         LEFT JOIN users u ON u.id = a.user_id
         ORDER BY a.id DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(ActivityEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            action: row.get(3)?,
            details: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
