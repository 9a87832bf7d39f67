//! Vehicle register, keyed by number plate.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize)]
pub struct Vehicle {
    pub id: String,
    pub number_plate: String,
    pub make: String,
    pub model: String,
    pub owner_name: String,
    pub owner_phone: String,
    pub created_at: String,
}

/// Optional details captured when a plate is seen for the first time.
#[derive(Debug, Clone, Default)]
pub struct VehicleDetails {
    pub make: String,
    pub model: String,
    pub owner_name: String,
    pub owner_phone: String,
}

/// Upper-case the plate and drop whitespace so "kaa 123a" and "KAA123A"
/// refer to the same vehicle.
pub fn normalize_plate(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn map_vehicle_row(row: &rusqlite::Row) -> rusqlite::Result<Vehicle> {
    Ok(Vehicle {
        id: row.get(0)?,
        number_plate: row.get(1)?,
        make: row.get(2)?,
        model: row.get(3)?,
        owner_name: row.get(4)?,
        owner_phone: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const VEHICLE_COLUMNS: &str = "id, number_plate, make, model, owner_name, owner_phone, created_at";

pub fn find_by_plate(conn: &Connection, plate: &str) -> AppResult<Option<Vehicle>> {
    Ok(conn
        .query_row(
            &format!("SELECT {VEHICLE_COLUMNS} FROM vehicles WHERE number_plate = ?1"),
            params![normalize_plate(plate)],
            map_vehicle_row,
        )
        .optional()?)
}

/// Return the vehicle for `plate`, registering it with `details` if unknown.
pub fn find_or_create(
    conn: &Connection,
    plate: &str,
    details: &VehicleDetails,
) -> AppResult<Vehicle> {
    let plate = normalize_plate(plate);
    if plate.is_empty() {
        return Err(AppError::Validation("Number plate is required".into()));
    }
    if let Some(existing) = find_by_plate(conn, &plate)? {
        return Ok(existing);
    }

    let vehicle = Vehicle {
        id: Uuid::new_v4().to_string(),
        number_plate: plate,
        make: details.make.trim().to_string(),
        model: details.model.trim().to_string(),
        owner_name: details.owner_name.trim().to_string(),
        owner_phone: details.owner_phone.trim().to_string(),
        created_at: Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO vehicles (id, number_plate, make, model, owner_name, owner_phone, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            vehicle.id,
            vehicle.number_plate,
            vehicle.make,
            vehicle.model,
            vehicle.owner_name,
            vehicle.owner_phone,
            vehicle.created_at
        ],
    )?;
    Ok(vehicle)
}

pub fn list(conn: &Connection) -> AppResult<Vec<Vehicle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VEHICLE_COLUMNS} FROM vehicles ORDER BY number_plate"
    ))?;
    let rows = stmt.query_map([], map_vehicle_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_normalize_plate() {
        assert_eq!(normalize_plate(" kaa 123a "), "KAA123A");
        assert_eq!(normalize_plate("KAA123A"), "KAA123A");
    }

    #[test]
    fn test_find_or_create_reuses_existing_plate() {
        let db = db::test_db();
        let conn = db.lock().expect("db lock");
        let details = VehicleDetails {
            make: "Toyota".into(),
            ..Default::default()
        };
        let first = find_or_create(&conn, "kaa 123a", &details).expect("create");
        let second =
            find_or_create(&conn, "KAA123A", &VehicleDetails::default()).expect("reuse");
        assert_eq!(first.id, second.id);
        assert_eq!(second.make, "Toyota");
        assert_eq!(list(&conn).expect("list").len(), 1);
    }

    #[test]
    fn test_empty_plate_rejected() {
        let db = db::test_db();
        let conn = db.lock().expect("db lock");
        let err = find_or_create(&conn, "   ", &VehicleDetails::default()).expect_err("empty");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
