//! Parts inventory and suppliers.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::activity::log_activity;
use crate::auth::{Permission, RequestContext};
use crate::db::DbState;
use crate::error::{restrict_violation, unique_violation, AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct Supplier {
    pub id: String,
    pub name: String,
    pub contact_person: String,
    pub phone: String,
    pub email: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryPart {
    pub id: String,
    pub part_number: String,
    pub name: String,
    pub unit_price: f64,
    pub quantity_in_stock: i64,
    pub supplier_id: Option<String>,
    pub supplier_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewSupplier {
    pub name: String,
    pub contact_person: String,
    pub phone: String,
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewPart {
    pub part_number: String,
    pub name: String,
    pub unit_price: f64,
    pub quantity_in_stock: i64,
    pub supplier_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Suppliers
// ---------------------------------------------------------------------------

pub fn create_supplier(
    db: &DbState,
    ctx: &RequestContext,
    input: &NewSupplier,
) -> AppResult<Supplier> {
    ctx.require(Permission::ManageSuppliers)?;
    let name = input.name.trim();
    if name.is_empty() {
        return Err(AppError::Validation("Supplier name is required".into()));
    }
    let email = input.email.trim();
    if !email.is_empty() && !email.contains('@') {
        return Err(AppError::Validation("Supplier email is not valid".into()));
    }

    let supplier = Supplier {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        contact_person: input.contact_person.trim().to_string(),
        phone: input.phone.trim().to_string(),
        email: email.to_string(),
        created_at: Utc::now().to_rfc3339(),
    };

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO suppliers (id, name, contact_person, phone, email, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            supplier.id,
            supplier.name,
            supplier.contact_person,
            supplier.phone,
            supplier.email,
            supplier.created_at
        ],
    )
    .map_err(|e| unique_violation(e, &format!("Supplier '{name}' already exists")))?;
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "supplier_created",
        &supplier.name,
    );
    info!(supplier = %supplier.name, "supplier created");
    Ok(supplier)
}

pub fn list_suppliers(db: &DbState) -> AppResult<Vec<Supplier>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, contact_person, phone, email, created_at
         FROM suppliers ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Supplier {
            id: row.get(0)?,
            name: row.get(1)?,
            contact_person: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

// ---------------------------------------------------------------------------
// Parts
// ---------------------------------------------------------------------------

pub fn create_part(db: &DbState, ctx: &RequestContext, input: &NewPart) -> AppResult<InventoryPart> {
    ctx.require(Permission::ManageInventory)?;
    let part_number = input.part_number.trim();
    let name = input.name.trim();
    if part_number.is_empty() || name.is_empty() {
        return Err(AppError::Validation(
            "Part number and name are required".into(),
        ));
    }
    if !input.unit_price.is_finite() || input.unit_price < 0.0 {
        return Err(AppError::Validation("Unit price cannot be negative".into()));
    }
    if input.quantity_in_stock < 0 {
        return Err(AppError::Validation("Stock cannot be negative".into()));
    }
    let supplier_id = input
        .supplier_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO inventory_parts
            (id, part_number, name, unit_price, quantity_in_stock, supplier_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            id,
            part_number,
            name,
            input.unit_price,
            input.quantity_in_stock,
            supplier_id,
            now
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
        {
            AppError::Validation("Unknown supplier".into())
        }
        other => unique_violation(other, &format!("Part number '{part_number}' already exists")),
    })?;
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "part_created",
        &format!("part_number={part_number} qty={}", input.quantity_in_stock),
    );
    drop(conn);
    get_part(db, &id)
}

pub fn get_part(db: &DbState, part_id: &str) -> AppResult<InventoryPart> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT p.id, p.part_number, p.name, p.unit_price, p.quantity_in_stock,
                p.supplier_id, s.name, p.created_at
         FROM inventory_parts p
         LEFT JOIN suppliers s ON s.id = p.supplier_id
         WHERE p.id = ?1",
        params![part_id],
        map_part_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("Part {part_id}")))
}

fn map_part_row(row: &rusqlite::Row) -> rusqlite::Result<InventoryPart> {
    Ok(InventoryPart {
        id: row.get(0)?,
        part_number: row.get(1)?,
        name: row.get(2)?,
        unit_price: row.get(3)?,
        quantity_in_stock: row.get(4)?,
        supplier_id: row.get(5)?,
        supplier_name: row.get(6)?,
        created_at: row.get(7)?,
    })
}

pub fn list_parts(db: &DbState) -> AppResult<Vec<InventoryPart>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.part_number, p.name, p.unit_price, p.quantity_in_stock,
                p.supplier_id, s.name, p.created_at
         FROM inventory_parts p
         LEFT JOIN suppliers s ON s.id = p.supplier_id
         ORDER BY p.part_number",
    )?;
    let rows = stmt.query_map([], map_part_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Receive stock (positive delta) or write it off (negative delta).
pub fn adjust_stock(
    db: &DbState,
    ctx: &RequestContext,
    part_id: &str,
    delta: i64,
) -> AppResult<i64> {
    ctx.require(Permission::ManageInventory)?;
    let conn = db.lock()?;
    let current: i64 = conn
        .query_row(
            "SELECT quantity_in_stock FROM inventory_parts WHERE id = ?1",
            params![part_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Part {part_id}")))?;
    let updated = current
        .checked_add(delta)
        .ok_or_else(|| AppError::Validation(format!("Stock change of {delta} is out of range")))?;
    if updated < 0 {
        return Err(AppError::Validation(format!(
            "Cannot remove {} units; only {current} in stock",
            delta.unsigned_abs()
        )));
    }
    conn.execute(
        "UPDATE inventory_parts SET quantity_in_stock = ?1, updated_at = ?2 WHERE id = ?3",
        params![updated, Utc::now().to_rfc3339(), part_id],
    )?;
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "stock_adjusted",
        &format!("part={part_id} delta={delta}"),
    );
    Ok(updated)
}

/// Delete a part. Parts already used on a job are protected by the
/// `job_parts` RESTRICT foreign key.
pub fn delete_part(db: &DbState, ctx: &RequestContext, part_id: &str) -> AppResult<()> {
    ctx.require(Permission::ManageInventory)?;
    let conn = db.lock()?;
    let deleted = conn
        .execute("DELETE FROM inventory_parts WHERE id = ?1", params![part_id])
        .map_err(|e| restrict_violation(e, "Part has been used on jobs and cannot be deleted"))?;
    if deleted == 0 {
        return Err(AppError::NotFound(format!("Part {part_id}")));
    }
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "part_deleted",
        &format!("part={part_id}"),
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::tests::seed_user;
    use crate::auth::Role;
    use crate::db;

    /// Insert a part directly and return its id.
    pub(crate) fn seed_part(db: &DbState, part_number: &str, unit_price: f64, stock: i64) -> String {
        let conn = db.lock().expect("db lock");
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO inventory_parts
                (id, part_number, name, unit_price, quantity_in_stock, created_at, updated_at)
             VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?5)",
            params![id, part_number, unit_price, stock, now],
        )
        .expect("insert part");
        id
    }

    #[test]
    fn test_create_part_with_supplier() {
        let db = db::test_db();
        let officer = seed_user(&db, "proc", Role::ProcurementOfficer);
        let supplier = create_supplier(
            &db,
            &officer,
            &NewSupplier {
                name: "Brake World".into(),
                email: "sales@brakeworld.test".into(),
                ..Default::default()
            },
        )
        .expect("supplier");

        let part = create_part(
            &db,
            &officer,
            &NewPart {
                part_number: "BP-01".into(),
                name: "Brake pads".into(),
                unit_price: 1500.0,
                quantity_in_stock: 10,
                supplier_id: Some(supplier.id.clone()),
            },
        )
        .expect("part");
        assert_eq!(part.supplier_name.as_deref(), Some("Brake World"));

        let dup = create_part(
            &db,
            &officer,
            &NewPart {
                part_number: "BP-01".into(),
                name: "Other".into(),
                ..Default::default()
            },
        )
        .expect_err("duplicate part number");
        assert!(matches!(dup, AppError::Validation(_)));
    }

    #[test]
    fn test_staff_cannot_manage_inventory() {
        let db = db::test_db();
        let staff = seed_user(&db, "tech", Role::Staff);
        let err = create_part(
            &db,
            &staff,
            &NewPart {
                part_number: "X".into(),
                name: "X".into(),
                ..Default::default()
            },
        )
        .expect_err("staff");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn test_adjust_stock_never_goes_negative() {
        let db = db::test_db();
        let officer = seed_user(&db, "proc", Role::ProcurementOfficer);
        let part_id = seed_part(&db, "AF-01", 200.0, 3);

        assert_eq!(adjust_stock(&db, &officer, &part_id, 5).expect("receive"), 8);
        let err = adjust_stock(&db, &officer, &part_id, -9).expect_err("below zero");
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(get_part(&db, &part_id).expect("part").quantity_in_stock, 8);
    }

    #[test]
    fn test_adjust_stock_rejects_out_of_range_delta() {
        let db = db::test_db();
        let officer = seed_user(&db, "proc", Role::ProcurementOfficer);
        let part_id = seed_part(&db, "AF-01", 200.0, 3);

        let err = adjust_stock(&db, &officer, &part_id, i64::MAX).expect_err("overflow");
        assert!(matches!(err, AppError::Validation(_)));
        let err = adjust_stock(&db, &officer, &part_id, i64::MIN).expect_err("underflow");
        match err {
            AppError::Validation(msg) => assert!(msg.contains("9223372036854775808"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(get_part(&db, &part_id).expect("part").quantity_in_stock, 3);
    }

    #[test]
    fn test_used_part_cannot_be_deleted() {
        let db = db::test_db();
        let director = seed_user(&db, "boss", Role::Director);
        let part_id = seed_part(&db, "SP-01", 100.0, 5);
        let job_id = crate::jobs::tests::seed_job(&db, &director, "KAA123A");
        crate::jobs::add_part(&db, &director, &job_id, &part_id, 1).expect("use part");

        let err = delete_part(&db, &director, &part_id).expect_err("restricted");
        assert!(matches!(err, AppError::Validation(_)));

        let unused = seed_part(&db, "SP-02", 100.0, 5);
        delete_part(&db, &director, &unused).expect("delete unused part");
    }
}
