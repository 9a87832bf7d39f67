use axum::extract::State;
use axum::response::Html;

use crate::auth::Permission;
use crate::dashboard;
use crate::web::error::PageResult;
use crate::web::html::{esc, money, page};
use crate::web::session::CurrentUser;
use crate::web::AppState;

fn tile(label: &str, value: &str) -> String {
    format!("<div class=\"tile\"><span>{label}</span><strong>{value}</strong></div>")
}

pub async fn index(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Html<String>> {
    let stats = dashboard::stats(&state.db, &ctx)?;

    let mut tiles = vec![
        tile("Total jobs", &stats.total_jobs.to_string()),
        tile("Open jobs", &stats.open_jobs.to_string()),
        tile("Revenue", &money(stats.total_revenue)),
        tile("Profit", &money(stats.total_profit)),
        tile("Average margin", &format!("{:.2}%", stats.average_margin)),
    ];
    if let Some(pending) = stats.pending_approvals {
        tiles.push(format!(
            "<a class=\"tile\" href=\"/quotations\"><span>Pending approvals</span><strong>{pending}</strong></a>"
        ));
    }

    let by_status: String = stats
        .jobs_by_status
        .iter()
        .map(|c| {
            format!(
                "<tr><td><a href=\"/jobs?status={}\">{}</a></td><td>{}</td></tr>",
                c.status.as_str(),
                c.status.label(),
                c.count
            )
        })
        .collect();

    let activity: String = stats
        .recent_activity
        .iter()
        .map(|a| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&a.created_at),
                esc(a.username.as_deref().unwrap_or("-")),
                esc(&a.action),
                esc(&a.details)
            )
        })
        .collect();

    let exports = if ctx.has_permission(Permission::ExportData) {
        r#"<p class="exports">Export: <a href="/export/jobs.csv">jobs</a> | <a href="/export/invoices.csv">invoices</a> | <a href="/export/inventory.csv">inventory</a></p>"#
    } else {
        ""
    };

    let body = format!(
        r#"<section class="tiles">{tiles}</section>
{exports}
<h2>Jobs by status</h2>
<table><tbody>{by_status}</tbody></table>
<h2>Recent activity</h2>
<table>
<thead><tr><th>When</th><th>User</th><th>Action</th><th>Details</th></tr></thead>
<tbody>{activity}</tbody>
</table>"#,
        tiles = tiles.join(""),
    );
    Ok(page("Dashboard", Some(&ctx), &body))
}
