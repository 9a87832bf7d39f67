use axum::extract::{Path, Query, State};
use axum::response::{Html, Redirect};
use axum::Form;
use serde::Deserialize;

use super::approvals::approval_table;
use crate::approvals;
use crate::auth::Permission;
use crate::billing::{self, InvoiceType, MarginBand};
use crate::inventory;
use crate::jobs::{self, NewJob};
use crate::vehicles::VehicleDetails;
use crate::web::error::PageResult;
use crate::web::html::{esc, money, options, page, status_badge};
use crate::web::session::CurrentUser;
use crate::web::AppState;
use crate::workflow::{self, JobStatus};

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewJobForm {
    pub number_plate: String,
    pub description: String,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub owner_phone: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusForm {
    pub status: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Deserialize)]
pub struct DescriptionForm {
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct PartForm {
    pub part_id: String,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct LaborForm {
    pub description: String,
    pub hours: f64,
    pub hourly_rate: f64,
}

fn job_url(job_id: &str) -> String {
    format!("/jobs/{job_id}")
}

pub async fn list(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Query(query): Query<JobsQuery>,
) -> PageResult<Html<String>> {
    let filter = match query.status.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => Some(s.parse::<JobStatus>()?),
        _ => None,
    };
    let jobs = jobs::list_jobs(&state.db, filter)?;

    let rows: String = jobs
        .iter()
        .map(|j| {
            format!(
                "<tr><td><a href=\"/jobs/{id}\">{plate}</a></td><td>{desc}</td><td>{status}</td><td>{by}</td><td>{at}</td></tr>",
                id = esc(&j.id),
                plate = esc(&j.number_plate),
                desc = esc(&j.description),
                status = status_badge(j.status),
                by = esc(j.created_by_name.as_deref().unwrap_or("-")),
                at = esc(&j.created_at),
            )
        })
        .collect();

    let status_options = options(
        std::iter::once(("", "All statuses"))
            .chain(JobStatus::ALL.iter().map(|s| (s.as_str(), s.label()))),
        filter.map(JobStatus::as_str),
    );

    let body = format!(
        r#"<form method="get" action="/jobs" class="inline">
<select name="status">{status_options}</select> <button type="submit">Filter</button>
</form>
<table>
<thead><tr><th>Plate</th><th>Description</th><th>Status</th><th>Created by</th><th>Created</th></tr></thead>
<tbody>{rows}</tbody>
</table>
<h2>New job</h2>
<form method="post" action="/jobs" class="card">
<label>Number plate <input name="number_plate" required/></label>
<label>Description <textarea name="description" required></textarea></label>
<label>Make <input name="make"/></label>
<label>Model <input name="model"/></label>
<label>Owner <input name="owner_name"/></label>
<label>Owner phone <input name="owner_phone"/></label>
<button type="submit">Open job</button>
</form>"#
    );
    Ok(page("Jobs", Some(&ctx), &body))
}

pub async fn create(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Form(form): Form<NewJobForm>,
) -> PageResult<Redirect> {
    let job = jobs::create_job(
        &state.db,
        &ctx,
        &NewJob {
            number_plate: form.number_plate,
            description: form.description,
            vehicle: VehicleDetails {
                make: form.make,
                model: form.model,
                owner_name: form.owner_name,
                owner_phone: form.owner_phone,
            },
        },
    )?;
    Ok(Redirect::to(&job_url(&job.id)))
}

pub async fn detail(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
) -> PageResult<Html<String>> {
    let job = jobs::get_job(&state.db, &job_id)?;
    let parts = jobs::list_parts(&state.db, &job_id)?;
    let labor = jobs::list_labor(&state.db, &job_id)?;
    let items = approvals::list_for_job(&state.db, &job_id)?;
    let history = jobs::status_history(&state.db, &job_id)?;
    let costs = billing::job_costs_for(&state.db, &job_id)?;
    let invoice = billing::invoice_for_job(&state.db, &job_id)?;
    let id = esc(&job.id);
    let editable = !matches!(job.status, JobStatus::Invoiced | JobStatus::Closed);

    let mut body = format!(
        r#"<p>{badge} <strong>{plate}</strong> opened by {by} on {at}</p>
<form method="post" action="/jobs/{id}/description" class="card">
<label>Description <textarea name="description">{desc}</textarea></label>
<button type="submit">Save</button>
</form>"#,
        badge = status_badge(job.status),
        plate = esc(&job.number_plate),
        by = esc(job.created_by_name.as_deref().unwrap_or("-")),
        at = esc(&job.created_at),
        desc = esc(&job.description),
    );

    let targets = workflow::allowed_targets(job.status, ctx.role);
    if !targets.is_empty() {
        let target_options = options(targets.iter().map(|t| (t.as_str(), t.label())), None);
        body.push_str(&format!(
            r#"<h2>Status</h2>
<form method="post" action="/jobs/{id}/status" class="inline">
<select name="status">{target_options}</select>
<input name="note" placeholder="Note"/>
<button type="submit">Move</button>
</form>"#
        ));
    }

    // Parts
    let part_rows: String = parts
        .iter()
        .map(|p| {
            let remove = if editable {
                format!(
                    "<form method=\"post\" action=\"/jobs/{id}/parts/{}/delete\" class=\"inline\"><button type=\"submit\">Remove</button></form>",
                    esc(&p.id)
                )
            } else {
                String::new()
            };
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{remove}</td></tr>",
                esc(&p.part_number),
                esc(&p.part_name),
                p.quantity,
                money(p.unit_price),
                money(p.line_total)
            )
        })
        .collect();
    body.push_str(&format!(
        r#"<h2>Parts</h2>
<table>
<thead><tr><th>Part</th><th>Name</th><th>Qty</th><th>Unit price</th><th>Total</th><th></th></tr></thead>
<tbody>{part_rows}</tbody>
</table>"#
    ));
    if editable {
        let stock = inventory::list_parts(&state.db)?;
        let labels: Vec<(String, String)> = stock
            .iter()
            .map(|p| {
                (
                    p.id.clone(),
                    format!("{} {} ({} in stock)", p.part_number, p.name, p.quantity_in_stock),
                )
            })
            .collect();
        let part_options = options(labels.iter().map(|(v, l)| (v.as_str(), l.as_str())), None);
        body.push_str(&format!(
            r#"<form method="post" action="/jobs/{id}/parts" class="inline">
<select name="part_id">{part_options}</select>
<input name="quantity" type="number" min="1" value="1"/>
<button type="submit">Add part</button>
</form>"#
        ));
    }

    // Labor
    let labor_rows: String = labor
        .iter()
        .map(|l| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&l.description),
                l.hours,
                money(l.hourly_rate),
                money(l.line_total)
            )
        })
        .collect();
    body.push_str(&format!(
        r#"<h2>Labor</h2>
<table>
<thead><tr><th>Work</th><th>Hours</th><th>Rate</th><th>Total</th></tr></thead>
<tbody>{labor_rows}</tbody>
</table>"#
    ));
    if editable {
        body.push_str(&format!(
            r#"<form method="post" action="/jobs/{id}/labor" class="inline">
<input name="description" placeholder="Work done" required/>
<input name="hours" type="number" step="0.25" min="0.25" placeholder="Hours" required/>
<input name="hourly_rate" type="number" step="0.01" min="0" placeholder="Rate" required/>
<button type="submit">Add labor</button>
</form>"#
        ));
    }

    // Quotations and subcontract work
    body.push_str("<h2>Quotations and subcontract work</h2>");
    body.push_str(&approval_table(&items, &ctx, false));
    let accepts_submissions = !matches!(
        job.status,
        JobStatus::Completed | JobStatus::Invoiced | JobStatus::Closed
    );
    if accepts_submissions && ctx.has_permission(Permission::SubmitQuotations) {
        let suppliers = inventory::list_suppliers(&state.db)?;
        let supplier_options = options(
            std::iter::once(("", "No supplier"))
                .chain(suppliers.iter().map(|s| (s.id.as_str(), s.name.as_str()))),
            None,
        );
        body.push_str(&format!(
            r#"<form method="post" action="/jobs/{id}/quotations" class="inline">
<select name="supplier_id">{supplier_options}</select>
<input name="description" placeholder="Quotation" required/>
<input name="amount" type="number" step="0.01" min="0.01" placeholder="Amount" required/>
<button type="submit">Submit quotation</button>
</form>
<form method="post" action="/jobs/{id}/subcontracts" class="inline">
<input name="subcontractor_name" placeholder="Subcontractor" required/>
<input name="description" placeholder="Work" required/>
<input name="cost" type="number" step="0.01" min="0.01" placeholder="Cost" required/>
<button type="submit">Submit subcontract work</button>
</form>"#
        ));
    }

    // Billing
    body.push_str(&format!(
        r#"<h2>Costs</h2>
<table><tbody>
<tr><td>Parts</td><td>{}</td></tr>
<tr><td>Labor</td><td>{}</td></tr>
<tr><td>Approved subcontract work</td><td>{}</td></tr>
<tr><th>Total cost</th><th>{}</th></tr>
</tbody></table>"#,
        money(costs.parts),
        money(costs.labor),
        money(costs.subcontract),
        money(costs.total())
    ));
    match invoice {
        Some(inv) => body.push_str(&format!(
            "<p>Invoice <a href=\"/invoices/{}\">{}</a>: {} incl. VAT, profit {} ({:.2}%, {} margin)</p>",
            esc(&inv.id),
            esc(&inv.invoice_number),
            money(inv.total_with_vat),
            money(inv.total_profit),
            inv.profit_percentage,
            MarginBand::for_percentage(inv.profit_percentage).as_str()
        )),
        None if job.status == JobStatus::Completed
            && ctx.has_permission(Permission::GenerateInvoices) =>
        {
            let type_options = options(
                InvoiceType::ALL.iter().map(|t| (t.as_str(), t.as_str())),
                Some(InvoiceType::Standard.as_str()),
            );
            body.push_str(&format!(
                r#"<form method="post" action="/jobs/{id}/invoice" class="inline">
<input name="amount" type="number" step="0.01" min="0.01" placeholder="Amount excl. VAT" required/>
<select name="invoice_type">{type_options}</select>
<button type="submit">Generate invoice</button>
</form>"#
            ));
        }
        None => {}
    }

    // History
    let history_rows: String = history
        .iter()
        .map(|h| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&h.changed_at),
                esc(h.from_status.as_deref().unwrap_or("-")),
                esc(&h.to_status),
                esc(h.changed_by.as_deref().unwrap_or("-")),
                esc(&h.note)
            )
        })
        .collect();
    body.push_str(&format!(
        r#"<h2>History</h2>
<table>
<thead><tr><th>When</th><th>From</th><th>To</th><th>By</th><th>Note</th></tr></thead>
<tbody>{history_rows}</tbody>
</table>"#
    ));

    if ctx.has_permission(Permission::DeleteJobs) && job.status != JobStatus::Invoiced {
        body.push_str(&format!(
            r#"<form method="post" action="/jobs/{id}/delete" class="danger"><button type="submit">Delete job</button></form>"#
        ));
    }

    Ok(page(&format!("Job {}", job.number_plate), Some(&ctx), &body))
}

pub async fn change_status(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<StatusForm>,
) -> PageResult<Redirect> {
    let to: JobStatus = form.status.parse()?;
    workflow::transition(&state.db, &job_id, to, &ctx, form.note.trim())?;
    Ok(Redirect::to(&job_url(&job_id)))
}

pub async fn update_description(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<DescriptionForm>,
) -> PageResult<Redirect> {
    jobs::update_description(&state.db, &ctx, &job_id, &form.description)?;
    Ok(Redirect::to(&job_url(&job_id)))
}

pub async fn add_part(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<PartForm>,
) -> PageResult<Redirect> {
    jobs::add_part(&state.db, &ctx, &job_id, &form.part_id, form.quantity)?;
    Ok(Redirect::to(&job_url(&job_id)))
}

pub async fn remove_part(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path((job_id, line_id)): Path<(String, String)>,
) -> PageResult<Redirect> {
    jobs::remove_part(&state.db, &ctx, &job_id, &line_id)?;
    Ok(Redirect::to(&job_url(&job_id)))
}

pub async fn add_labor(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<LaborForm>,
) -> PageResult<Redirect> {
    jobs::add_labor(
        &state.db,
        &ctx,
        &job_id,
        &form.description,
        form.hours,
        form.hourly_rate,
    )?;
    Ok(Redirect::to(&job_url(&job_id)))
}

pub async fn delete(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
) -> PageResult<Redirect> {
    jobs::delete_job(&state.db, &ctx, &job_id)?;
    Ok(Redirect::to("/jobs"))
}
