use axum::extract::{Path, State};
use axum::response::{Html, Redirect};
use axum::Form;
use serde::Deserialize;

use crate::approvals::{self, ApprovalItem, ApprovalKind, ApprovalStatus};
use crate::auth::{Permission, RequestContext};
use crate::web::error::PageResult;
use crate::web::html::{esc, money, page};
use crate::web::session::CurrentUser;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct QuotationForm {
    #[serde(default)]
    pub supplier_id: String,
    pub description: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct SubcontractForm {
    pub subcontractor_name: String,
    pub description: String,
    pub cost: f64,
}

#[derive(Debug, Deserialize)]
pub struct RejectForm {
    #[serde(default)]
    pub reason: String,
}

fn decision_forms(item: &ApprovalItem) -> String {
    format!(
        r#"<form method="post" action="/approvals/{kind}/{id}/approve" class="inline"><button type="submit">Approve</button></form>
<form method="post" action="/approvals/{kind}/{id}/reject" class="inline"><input name="reason" placeholder="Reason" required/><button type="submit">Reject</button></form>"#,
        kind = item.kind.as_str(),
        id = esc(&item.id),
    )
}

/// Table of approval items. Directors get approve/reject controls on
/// pending rows.
pub(crate) fn approval_table(items: &[ApprovalItem], ctx: &RequestContext, show_job: bool) -> String {
    let can_decide = ctx.has_permission(Permission::DecideApprovals);
    let job_header = if show_job { "<th>Job</th>" } else { "" };
    let rows: String = items
        .iter()
        .map(|item| {
            let job_cell = if show_job {
                format!(
                    "<td><a href=\"/jobs/{}\">{}</a></td>",
                    esc(&item.job_id),
                    esc(&item.number_plate)
                )
            } else {
                String::new()
            };
            let outcome = match item.status {
                ApprovalStatus::PendingApproval if can_decide => decision_forms(item),
                ApprovalStatus::Rejected => format!(
                    "by {}: {}",
                    esc(item.decided_by.as_deref().unwrap_or("-")),
                    esc(item.rejection_reason.as_deref().unwrap_or(""))
                ),
                ApprovalStatus::Approved => {
                    format!("by {}", esc(item.decided_by.as_deref().unwrap_or("-")))
                }
                ApprovalStatus::PendingApproval => String::new(),
            };
            format!(
                "<tr>{job_cell}<td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{outcome}</td></tr>",
                item.kind.label(),
                esc(item.party.as_deref().unwrap_or("-")),
                esc(&item.description),
                money(item.amount),
                esc(item.submitted_by.as_deref().unwrap_or("-")),
                item.status.label(),
            )
        })
        .collect();
    format!(
        r#"<table>
<thead><tr>{job_header}<th>Type</th><th>Party</th><th>Description</th><th>Amount</th><th>Submitted by</th><th>Status</th><th></th></tr></thead>
<tbody>{rows}</tbody>
</table>"#
    )
}

pub async fn queue(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Html<String>> {
    let pending = approvals::list_pending(&state.db)?;
    let quotations = approvals::list_all(&state.db, ApprovalKind::Quotation)?;
    let subcontracts = approvals::list_all(&state.db, ApprovalKind::Subcontract)?;

    let body = format!(
        "<h2>Pending ({count})</h2>{pending}<h2>Quotations</h2>{quotations}<h2>Subcontract work</h2>{subcontracts}",
        count = pending.len(),
        pending = approval_table(&pending, &ctx, true),
        quotations = approval_table(&quotations, &ctx, true),
        subcontracts = approval_table(&subcontracts, &ctx, true),
    );
    Ok(page("Approvals", Some(&ctx), &body))
}

pub async fn submit_quotation(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<QuotationForm>,
) -> PageResult<Redirect> {
    let supplier = Some(form.supplier_id.trim()).filter(|s| !s.is_empty());
    approvals::submit_quotation(
        &state.db,
        &ctx,
        &job_id,
        supplier,
        &form.description,
        form.amount,
    )?;
    Ok(Redirect::to(&format!("/jobs/{job_id}")))
}

pub async fn submit_subcontract(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<SubcontractForm>,
) -> PageResult<Redirect> {
    approvals::submit_subcontract(
        &state.db,
        &ctx,
        &job_id,
        &form.subcontractor_name,
        &form.description,
        form.cost,
    )?;
    Ok(Redirect::to(&format!("/jobs/{job_id}")))
}

pub async fn approve(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path((kind, item_id)): Path<(String, String)>,
) -> PageResult<Redirect> {
    let kind: ApprovalKind = kind.parse()?;
    approvals::approve(&state.db, &ctx, kind, &item_id)?;
    Ok(Redirect::to("/quotations"))
}

pub async fn reject(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path((kind, item_id)): Path<(String, String)>,
    Form(form): Form<RejectForm>,
) -> PageResult<Redirect> {
    let kind: ApprovalKind = kind.parse()?;
    approvals::reject(&state.db, &ctx, kind, &item_id, &form.reason)?;
    Ok(Redirect::to("/quotations"))
}
