use axum::extract::{Path, State};
use axum::response::{Html, Redirect};
use axum::Form;
use serde::Deserialize;

use crate::auth::Permission;
use crate::inventory::{self, NewPart, NewSupplier};
use crate::web::error::PageResult;
use crate::web::html::{esc, money, options, page};
use crate::web::session::CurrentUser;
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct SupplierForm {
    pub name: String,
    #[serde(default)]
    pub contact_person: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PartForm {
    pub part_number: String,
    pub name: String,
    pub unit_price: f64,
    #[serde(default)]
    pub quantity_in_stock: i64,
    #[serde(default)]
    pub supplier_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StockForm {
    pub delta: i64,
}

pub async fn suppliers(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Html<String>> {
    ctx.require(Permission::ManageSuppliers)?;
    let rows: String = inventory::list_suppliers(&state.db)?
        .iter()
        .map(|s| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&s.name),
                esc(&s.contact_person),
                esc(&s.phone),
                esc(&s.email)
            )
        })
        .collect();
    let body = format!(
        r#"<table>
<thead><tr><th>Name</th><th>Contact</th><th>Phone</th><th>Email</th></tr></thead>
<tbody>{rows}</tbody>
</table>
<h2>Add supplier</h2>
<form method="post" action="/suppliers" class="card">
<label>Name <input name="name" required/></label>
<label>Contact person <input name="contact_person"/></label>
<label>Phone <input name="phone"/></label>
<label>Email <input name="email" type="email"/></label>
<button type="submit">Add</button>
</form>"#
    );
    Ok(page("Suppliers", Some(&ctx), &body))
}

pub async fn create_supplier(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Form(form): Form<SupplierForm>,
) -> PageResult<Redirect> {
    inventory::create_supplier(
        &state.db,
        &ctx,
        &NewSupplier {
            name: form.name,
            contact_person: form.contact_person,
            phone: form.phone,
            email: form.email,
        },
    )?;
    Ok(Redirect::to("/suppliers"))
}

pub async fn parts(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Html<String>> {
    ctx.require(Permission::ManageInventory)?;
    let rows: String = inventory::list_parts(&state.db)?
        .iter()
        .map(|p| {
            format!(
                r#"<tr><td>{number}</td><td>{name}</td><td>{price}</td><td>{stock}</td><td>{supplier}</td>
<td><form method="post" action="/inventory/{id}/stock" class="inline"><input name="delta" type="number" value="1"/><button type="submit">Adjust</button></form>
<form method="post" action="/inventory/{id}/delete" class="inline"><button type="submit">Delete</button></form></td></tr>"#,
                number = esc(&p.part_number),
                name = esc(&p.name),
                price = money(p.unit_price),
                stock = p.quantity_in_stock,
                supplier = esc(p.supplier_name.as_deref().unwrap_or("-")),
                id = esc(&p.id),
            )
        })
        .collect();
    let suppliers = inventory::list_suppliers(&state.db)?;
    let supplier_options = options(
        std::iter::once(("", "No supplier"))
            .chain(suppliers.iter().map(|s| (s.id.as_str(), s.name.as_str()))),
        None,
    );
    let body = format!(
        r#"<table>
<thead><tr><th>Part number</th><th>Name</th><th>Unit price</th><th>In stock</th><th>Supplier</th><th></th></tr></thead>
<tbody>{rows}</tbody>
</table>
<h2>Add part</h2>
<form method="post" action="/inventory" class="card">
<label>Part number <input name="part_number" required/></label>
<label>Name <input name="name" required/></label>
<label>Unit price <input name="unit_price" type="number" step="0.01" min="0" required/></label>
<label>In stock <input name="quantity_in_stock" type="number" min="0" value="0"/></label>
<label>Supplier <select name="supplier_id">{supplier_options}</select></label>
<button type="submit">Add</button>
</form>"#
    );
    Ok(page("Inventory", Some(&ctx), &body))
}

pub async fn create_part(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Form(form): Form<PartForm>,
) -> PageResult<Redirect> {
    let supplier_id = Some(form.supplier_id.trim().to_string()).filter(|s| !s.is_empty());
    inventory::create_part(
        &state.db,
        &ctx,
        &NewPart {
            part_number: form.part_number,
            name: form.name,
            unit_price: form.unit_price,
            quantity_in_stock: form.quantity_in_stock,
            supplier_id,
        },
    )?;
    Ok(Redirect::to("/inventory"))
}

pub async fn adjust_stock(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(part_id): Path<String>,
    Form(form): Form<StockForm>,
) -> PageResult<Redirect> {
    inventory::adjust_stock(&state.db, &ctx, &part_id, form.delta)?;
    Ok(Redirect::to("/inventory"))
}

pub async fn delete_part(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(part_id): Path<String>,
) -> PageResult<Redirect> {
    inventory::delete_part(&state.db, &ctx, &part_id)?;
    Ok(Redirect::to("/inventory"))
}
