use axum::extract::{Path, State};
use axum::response::{Html, Redirect};
use axum::Form;
use serde::Deserialize;

use crate::auth::Permission;
use crate::billing::{self, CustomerInvoice, InvoiceType, VAT_RATE};
use crate::db::{self, DbState};
use crate::error::AppResult;
use crate::jobs;
use crate::web::error::PageResult;
use crate::web::html::{esc, money, page, APP_TITLE};
use crate::web::session::CurrentUser;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct InvoiceForm {
    pub amount: f64,
    #[serde(default)]
    pub invoice_type: String,
}

fn shop_name(db: &DbState) -> AppResult<String> {
    let conn = db.lock()?;
    Ok(db::get_setting(&conn, "shop", "name").unwrap_or_else(|| APP_TITLE.to_string()))
}

fn figures_table(inv: &CustomerInvoice, with_profit: bool) -> String {
    let mut rows = format!(
        "<tr><td>Amount</td><td>{}</td></tr>\
         <tr><td>VAT ({:.0}%)</td><td>{}</td></tr>\
         <tr><th>Total</th><th>{}</th></tr>",
        money(inv.total_amount),
        VAT_RATE * 100.0,
        money(inv.vat_amount),
        money(inv.total_with_vat),
    );
    if with_profit {
        rows.push_str(&format!(
            "<tr><td>Cost</td><td>{}</td></tr>\
             <tr><td>Profit</td><td>{}</td></tr>\
             <tr><td>Margin</td><td><span class=\"margin-{}\">{:.2}%</span></td></tr>",
            money(inv.total_cost),
            money(inv.total_profit),
            inv.margin_band().as_str(),
            inv.profit_percentage,
        ));
    }
    format!("<table class=\"figures\"><tbody>{rows}</tbody></table>")
}

pub async fn list(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Html<String>> {
    ctx.require(Permission::GenerateInvoices)?;
    let invoices = billing::list_invoices(&state.db)?;
    let rows: String = invoices
        .iter()
        .map(|inv| {
            format!(
                "<tr><td><a href=\"/invoices/{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td class=\"margin-{}\">{:.2}%</td></tr>",
                esc(&inv.id),
                esc(&inv.invoice_number),
                esc(&inv.invoice_date),
                esc(&inv.number_plate),
                inv.invoice_type,
                money(inv.total_with_vat),
                money(inv.total_profit),
                inv.margin_band().as_str(),
                inv.profit_percentage,
            )
        })
        .collect();
    let body = format!(
        r#"<table>
<thead><tr><th>Number</th><th>Date</th><th>Plate</th><th>Type</th><th>Total incl. VAT</th><th>Profit</th><th>Margin</th></tr></thead>
<tbody>{rows}</tbody>
</table>"#
    );
    Ok(page("Invoices", Some(&ctx), &body))
}

pub async fn generate(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(job_id): Path<String>,
    Form(form): Form<InvoiceForm>,
) -> PageResult<Redirect> {
    let invoice_type = match form.invoice_type.trim() {
        "" => InvoiceType::Standard,
        other => other.parse()?,
    };
    let invoice = billing::generate_invoice(&state.db, &ctx, &job_id, form.amount, invoice_type)?;
    Ok(Redirect::to(&format!("/invoices/{}", invoice.id)))
}

pub async fn view(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(invoice_id): Path<String>,
) -> PageResult<Html<String>> {
    ctx.require(Permission::GenerateInvoices)?;
    let inv = billing::get_invoice(&state.db, &invoice_id)?;
    let body = format!(
        r#"<p>{date} | {kind} | job <a href="/jobs/{job_id}">{plate}</a> | issued by {by}</p>
{figures}
<p><a href="/invoices/{id}/print" target="_blank">Print view</a></p>"#,
        date = esc(&inv.invoice_date),
        kind = inv.invoice_type,
        job_id = esc(&inv.job_id),
        plate = esc(&inv.number_plate),
        by = esc(inv.created_by.as_deref().unwrap_or("-")),
        figures = figures_table(&inv, true),
        id = esc(&inv.id),
    );
    Ok(page(
        &format!("Invoice {}", inv.invoice_number),
        Some(&ctx),
        &body,
    ))
}

/// Standalone printable invoice, without navigation or profit figures.
pub async fn print(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(invoice_id): Path<String>,
) -> PageResult<Html<String>> {
    ctx.require(Permission::GenerateInvoices)?;
    let inv = billing::get_invoice(&state.db, &invoice_id)?;
    let shop = shop_name(&state.db)?;
    let parts = jobs::list_parts(&state.db, &inv.job_id)?;
    let labor = jobs::list_labor(&state.db, &inv.job_id)?;

    let mut lines: String = parts
        .iter()
        .map(|p| {
            format!(
                "<tr><td>{} x {}</td><td>{}</td></tr>",
                p.quantity,
                esc(&p.part_name),
                money(p.line_total)
            )
        })
        .collect();
    lines.extend(labor.iter().map(|l| {
        format!(
            "<tr><td>{} ({} h)</td><td>{}</td></tr>",
            esc(&l.description),
            l.hours,
            money(l.line_total)
        )
    }));

    Ok(Html(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8"/>
<title>Invoice {number}</title>
<link rel="stylesheet" href="/static/site.css"/>
</head>
<body class="print">
<h1>{shop}</h1>
<div class="meta">
Invoice: {number}
Date: {date}
Type: {kind}
Vehicle: {plate}
</div>
<table class="lines"><tbody>{lines}</tbody></table>
{figures}
<p class="footer">Thank you for your business.</p>
</body>
</html>"#,
        number = esc(&inv.invoice_number),
        shop = esc(&shop),
        date = esc(&inv.invoice_date),
        kind = inv.invoice_type,
        plate = esc(&inv.number_plate),
        figures = figures_table(&inv, false),
    )))
}
