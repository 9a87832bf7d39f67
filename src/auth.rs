//! Username/password authentication with bcrypt.
//!
//! Provides login, database-backed sessions, role predicates and
//! permission checks. Sessions are identified by an opaque token carried in
//! the `remember_user` cookie; the token maps to a row in `user_sessions`
//! and is resolved into a [`RequestContext`] once per request.
//!
//! Failed logins are counted per user and written to the activity log.
//! The counter is bookkeeping only: no lockout is applied.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::log_activity;
use crate::db::DbState;
use crate::error::{parse_column, unique_violation, AppError, AppResult};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Lifetime of a session and of the cookie that carries it.
pub const SESSION_DAYS: i64 = 30;

const MIN_PASSWORD_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Roles and permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Director,
    ProcurementOfficer,
    Staff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewDashboard,
    ManageJobs,
    DeleteJobs,
    SubmitQuotations,
    DecideApprovals,
    ManageInventory,
    ManageSuppliers,
    GenerateInvoices,
    ExportData,
    ManageUsers,
}

/// Permissions granted to directors.
const DIRECTOR_PERMISSIONS: &[Permission] = &[
    Permission::ViewDashboard,
    Permission::ManageJobs,
    Permission::DeleteJobs,
    Permission::SubmitQuotations,
    Permission::DecideApprovals,
    Permission::ManageInventory,
    Permission::ManageSuppliers,
    Permission::GenerateInvoices,
    Permission::ExportData,
    Permission::ManageUsers,
];

/// Permissions granted to procurement officers.
const PROCUREMENT_PERMISSIONS: &[Permission] = &[
    Permission::ViewDashboard,
    Permission::ManageJobs,
    Permission::SubmitQuotations,
    Permission::ManageInventory,
    Permission::ManageSuppliers,
    Permission::GenerateInvoices,
    Permission::ExportData,
];

/// Permissions granted to general staff.
const STAFF_PERMISSIONS: &[Permission] = &[
    Permission::ViewDashboard,
    Permission::ManageJobs,
    Permission::SubmitQuotations,
];

impl Role {
    pub const ALL: [Role; 3] = [Role::Director, Role::ProcurementOfficer, Role::Staff];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Director => "director",
            Role::ProcurementOfficer => "procurement_officer",
            Role::Staff => "staff",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Role::Director => "Director",
            Role::ProcurementOfficer => "Procurement Officer",
            Role::Staff => "Staff",
        }
    }

    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Director => DIRECTOR_PERMISSIONS,
            Role::ProcurementOfficer => PROCUREMENT_PERMISSIONS,
            Role::Staff => STAFF_PERMISSIONS,
        }
    }

    pub fn has_permission(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "director" => Ok(Role::Director),
            "procurement_officer" => Ok(Role::ProcurementOfficer),
            "staff" => Ok(Role::Staff),
            other => Err(AppError::Validation(format!("Unknown role: {other}"))),
        }
    }
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ViewDashboard => "view_dashboard",
            Permission::ManageJobs => "manage_jobs",
            Permission::DeleteJobs => "delete_jobs",
            Permission::SubmitQuotations => "submit_quotations",
            Permission::DecideApprovals => "decide_approvals",
            Permission::ManageInventory => "manage_inventory",
            Permission::ManageSuppliers => "manage_suppliers",
            Permission::GenerateInvoices => "generate_invoices",
            Permission::ExportData => "export_data",
            Permission::ManageUsers => "manage_users",
        }
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// The authenticated user behind one request. Handlers receive it
/// explicitly; there is no ambient session state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub session_token: String,
}

impl RequestContext {
    pub fn is_director(&self) -> bool {
        self.role == Role::Director
    }

    pub fn is_procurement_officer(&self) -> bool {
        self.role == Role::ProcurementOfficer
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.role.has_permission(permission)
    }

    /// Fail with `Unauthorized` unless the role grants `permission`.
    pub fn require(&self, permission: Permission) -> AppResult<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            warn!(
                user = %self.username,
                role = %self.role,
                permission = permission.as_str(),
                "permission denied"
            );
            Err(AppError::Unauthorized(format!(
                "{} may not {}",
                self.role.label(),
                permission.as_str().replace('_', " ")
            )))
        }
    }

    pub fn display_name(&self) -> &str {
        if self.full_name.trim().is_empty() {
            &self.username
        } else {
            &self.full_name
        }
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub role: Role,
    pub failed_login_attempts: i64,
    pub last_login: Option<String>,
    pub created_at: String,
}

fn map_user_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        role: parse_column(row, 3)?,
        failed_login_attempts: row.get(4)?,
        last_login: row.get(5)?,
        created_at: row.get(6)?,
    })
}

const USER_COLUMNS: &str =
    "id, username, full_name, role, failed_login_attempts, last_login, created_at";

fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {e}")))
}

/// Insert a user row. Callers are responsible for authorization.
fn insert_user(
    conn: &Connection,
    username: &str,
    full_name: &str,
    password_hash: &str,
    role: Role,
) -> AppResult<User> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (id, username, full_name, password_hash, role, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![id, username, full_name, password_hash, role.as_str(), now],
    )
    .map_err(|e| unique_violation(e, &format!("Username '{username}' is already taken")))?;

    Ok(User {
        id,
        username: username.to_string(),
        full_name: full_name.to_string(),
        role,
        failed_login_attempts: 0,
        last_login: None,
        created_at: now,
    })
}

/// Create the first director account when the users table is empty.
///
/// Returns `true` when an account was created.
pub fn bootstrap_director(db: &DbState, username: &str, password: &str) -> AppResult<bool> {
    let conn = db.lock()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(false);
    }

    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::Validation("Username is required".into()));
    }
    validate_password(password)?;
    let hash = hash_password(password)?;
    let user = insert_user(&conn, username, "Director", &hash, Role::Director)?;
    log_activity(&conn, Some(&user.id), "user_bootstrapped", username);
    info!(username = %username, "bootstrap director account created");
    Ok(true)
}

/// Create a user (directors only).
pub fn create_user(
    db: &DbState,
    ctx: &RequestContext,
    username: &str,
    full_name: &str,
    password: &str,
    role: Role,
) -> AppResult<User> {
    ctx.require(Permission::ManageUsers)?;

    let username = username.trim();
    if username.is_empty() {
        return Err(AppError::Validation("Username is required".into()));
    }
    validate_password(password)?;
    let hash = hash_password(password)?;

    let conn = db.lock()?;
    let user = insert_user(&conn, username, full_name.trim(), &hash, role)?;
    log_activity(
        &conn,
        Some(&ctx.user_id),
        "user_created",
        &format!("username={} role={}", user.username, role),
    );
    info!(username = %user.username, role = %role, "user created");
    Ok(user)
}

pub fn list_users(db: &DbState) -> AppResult<Vec<User>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY username"
    ))?;
    let rows = stmt.query_map([], map_user_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn get_user(conn: &Connection, user_id: &str) -> AppResult<User> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        params![user_id],
        map_user_row,
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("User {user_id}")))
}

/// Change the acting user's own password after verifying the current one.
pub fn change_password(
    db: &DbState,
    ctx: &RequestContext,
    current_password: &str,
    new_password: &str,
) -> AppResult<()> {
    validate_password(new_password)?;
    let hash: String = db.lock()?.query_row(
        "SELECT password_hash FROM users WHERE id = ?1",
        params![ctx.user_id],
        |row| row.get(0),
    )?;
    // bcrypt runs without the connection lock held.
    if !bcrypt::verify(current_password, &hash).unwrap_or(false) {
        return Err(AppError::InvalidCredentials);
    }
    let new_hash = hash_password(new_password)?;

    let conn = db.lock()?;
    let updated = conn.execute(
        "UPDATE users SET password_hash = ?1, updated_at = ?2
         WHERE id = ?3 AND password_hash = ?4",
        params![new_hash, Utc::now().to_rfc3339(), ctx.user_id, hash],
    )?;
    if updated == 0 {
        // Changed concurrently; the verified password is no longer current.
        return Err(AppError::InvalidCredentials);
    }
    // Other sessions of this user stop being valid.
    conn.execute(
        "DELETE FROM user_sessions WHERE user_id = ?1 AND token <> ?2",
        params![ctx.user_id, ctx.session_token],
    )?;
    log_activity(&conn, Some(&ctx.user_id), "password_changed", "");
    Ok(())
}

// ---------------------------------------------------------------------------
// Login / sessions
// ---------------------------------------------------------------------------

/// A freshly created session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Verify credentials and open a session.
///
/// Every failure returns the same [`AppError::InvalidCredentials`] so the
/// response never reveals whether the username exists.
pub fn login(db: &DbState, username: &str, password: &str) -> AppResult<Session> {
    let username = username.trim();

    let found: Option<(String, String)> = db
        .lock()?
        .query_row(
            "SELECT id, password_hash FROM users WHERE username = ?1",
            params![username],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((user_id, hash)) = found else {
        let conn = db.lock()?;
        log_activity(
            &conn,
            None,
            "login_failed",
            &format!("unknown username={username}"),
        );
        warn!(username = %username, "login failed: unknown username");
        return Err(AppError::InvalidCredentials);
    };

    // bcrypt runs without the connection lock held.
    let verified = !password.is_empty() && bcrypt::verify(password, &hash).unwrap_or(false);
    let conn = db.lock()?;

    if !verified {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE users SET failed_login_attempts = failed_login_attempts + 1,
                              last_failed_login = ?1
             WHERE id = ?2",
            params![now, user_id],
        )?;
        log_activity(&conn, Some(&user_id), "login_failed", "bad password");
        warn!(username = %username, "login failed: bad password");
        return Err(AppError::InvalidCredentials);
    }

    let now = Utc::now();
    let session = Session {
        token: Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        expires_at: now + Duration::days(SESSION_DAYS),
    };

    conn.execute(
        "UPDATE users SET failed_login_attempts = 0, last_login = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), user_id],
    )?;
    conn.execute(
        "INSERT INTO user_sessions (token, user_id, created_at, last_seen, expires_at)
         VALUES (?1, ?2, ?3, ?3, ?4)",
        params![
            session.token,
            user_id,
            now.to_rfc3339(),
            session.expires_at.to_rfc3339()
        ],
    )?;
    log_activity(&conn, Some(&user_id), "login", "");
    info!(username = %username, "login successful");

    Ok(session)
}

/// Resolve a session token into the request context.
///
/// Unknown tokens yield `None`; expired sessions are deleted and yield `None`.
pub fn resolve_session(db: &DbState, token: &str) -> AppResult<Option<RequestContext>> {
    if token.trim().is_empty() {
        return Ok(None);
    }
    let conn = db.lock()?;

    let row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT u.id, u.username, u.full_name, u.role, s.expires_at
             FROM user_sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ?1",
            params![token],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()?;

    let Some((user_id, username, full_name, role, expires_at)) = row else {
        return Ok(None);
    };

    let expired = DateTime::parse_from_rfc3339(&expires_at)
        .map(|dt| dt.with_timezone(&Utc) <= Utc::now())
        .unwrap_or(true);
    if expired {
        conn.execute(
            "DELETE FROM user_sessions WHERE token = ?1",
            params![token],
        )?;
        info!(username = %username, "session expired");
        return Ok(None);
    }

    conn.execute(
        "UPDATE user_sessions SET last_seen = ?1 WHERE token = ?2",
        params![Utc::now().to_rfc3339(), token],
    )?;

    Ok(Some(RequestContext {
        user_id,
        username,
        full_name,
        role: role.parse()?,
        session_token: token.to_string(),
    }))
}

/// Invalidate a session.
pub fn logout(db: &DbState, ctx: &RequestContext) -> AppResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "DELETE FROM user_sessions WHERE token = ?1",
        params![ctx.session_token],
    )?;
    log_activity(&conn, Some(&ctx.user_id), "logout", "");
    info!(username = %ctx.username, "session logged out");
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;
    use std::sync::Arc;

    /// Insert a user with a cheap bcrypt cost and return its context.
    pub(crate) fn seed_user(db: &DbState, username: &str, role: Role) -> RequestContext {
        let conn = db.lock().expect("db lock");
        let hash = bcrypt::hash("password123", 4).expect("hash test password");
        let user = insert_user(&conn, username, username, &hash, role).expect("insert user");
        RequestContext {
            user_id: user.id,
            username: user.username,
            full_name: user.full_name,
            role,
            session_token: format!("test-token-{username}"),
        }
    }

    fn failed_attempts(db: &DbState, username: &str) -> i64 {
        let conn = db.lock().expect("db lock");
        conn.query_row(
            "SELECT failed_login_attempts FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .expect("read counter")
    }

    #[test]
    fn test_login_success_creates_resolvable_session() {
        let db = db::test_db();
        seed_user(&db, "dana", Role::Director);

        let session = login(&db, "dana", "password123").expect("login");
        let ctx = resolve_session(&db, &session.token)
            .expect("resolve")
            .expect("session should be active");
        assert_eq!(ctx.username, "dana");
        assert!(ctx.is_director());
        assert!(!ctx.is_procurement_officer());
        assert!(session.expires_at > Utc::now() + Duration::days(SESSION_DAYS - 1));
    }

    #[test]
    fn test_login_failures_share_generic_message_and_are_counted() {
        let db = db::test_db();
        seed_user(&db, "pat", Role::Staff);

        let wrong_password = login(&db, "pat", "nope").expect_err("bad password");
        let unknown_user = login(&db, "ghost", "password123").expect_err("unknown user");
        assert_eq!(wrong_password.to_string(), "Invalid username or password");
        assert_eq!(unknown_user.to_string(), wrong_password.to_string());

        login(&db, "pat", "nope").expect_err("bad password again");
        assert_eq!(failed_attempts(&db, "pat"), 2);

        let conn = db.lock().expect("db lock");
        let anonymous: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM activity_log WHERE user_id IS NULL AND action = 'login_failed'",
                [],
                |row| row.get(0),
            )
            .expect("count anonymous entries");
        assert_eq!(anonymous, 1);
    }

    #[test]
    fn test_failed_attempts_do_not_lock_account() {
        let db = db::test_db();
        seed_user(&db, "sam", Role::Staff);
        for _ in 0..10 {
            login(&db, "sam", "wrong-password").expect_err("bad password");
        }
        login(&db, "sam", "password123").expect("login still allowed");
        assert_eq!(failed_attempts(&db, "sam"), 0);
    }

    #[test]
    fn test_expired_session_is_removed() {
        let db = db::test_db();
        seed_user(&db, "eve", Role::Staff);
        let session = login(&db, "eve", "password123").expect("login");
        {
            let conn = db.lock().expect("db lock");
            conn.execute(
                "UPDATE user_sessions SET expires_at = ?1 WHERE token = ?2",
                params![(Utc::now() - Duration::minutes(1)).to_rfc3339(), session.token],
            )
            .expect("expire session");
        }
        assert!(resolve_session(&db, &session.token).expect("resolve").is_none());
        let conn = db.lock().expect("db lock");
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM user_sessions", [], |row| row.get(0))
            .expect("count sessions");
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_logout_invalidates_session() {
        let db = db::test_db();
        seed_user(&db, "lee", Role::ProcurementOfficer);
        let session = login(&db, "lee", "password123").expect("login");
        let ctx = resolve_session(&db, &session.token)
            .expect("resolve")
            .expect("active");
        logout(&db, &ctx).expect("logout");
        assert!(resolve_session(&db, &session.token).expect("resolve").is_none());
    }

    #[test]
    fn test_unknown_stored_role_is_an_error() {
        let db = db::test_db();
        seed_user(&db, "kim", Role::Staff);
        {
            let conn = db.lock().expect("db lock");
            conn.execute_batch(
                "PRAGMA ignore_check_constraints = ON;
                 UPDATE users SET role = 'superuser' WHERE username = 'kim';
                 PRAGMA ignore_check_constraints = OFF;",
            )
            .expect("corrupt role");
        }
        let err = list_users(&db).expect_err("unknown role");
        assert!(matches!(
            err,
            AppError::Database(rusqlite::Error::FromSqlConversionFailure(3, _, _))
        ));
    }

    #[test]
    fn test_role_permission_sets() {
        assert!(Role::Director.has_permission(Permission::DecideApprovals));
        assert!(!Role::ProcurementOfficer.has_permission(Permission::DecideApprovals));
        assert!(Role::ProcurementOfficer.has_permission(Permission::GenerateInvoices));
        assert!(!Role::Staff.has_permission(Permission::GenerateInvoices));
        assert!(Role::Staff.has_permission(Permission::SubmitQuotations));
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().expect("round trip"), role);
        }
    }

    #[test]
    fn test_create_user_requires_director() {
        let db = db::test_db();
        let director = seed_user(&db, "dir", Role::Director);
        let staff = seed_user(&db, "tech", Role::Staff);

        let err = create_user(&db, &staff, "new", "New", "password123", Role::Staff)
            .expect_err("staff cannot create users");
        assert!(matches!(err, AppError::Unauthorized(_)));

        create_user(&db, &director, "new", "New", "password123", Role::Staff)
            .expect("director creates user");
        let dup = create_user(&db, &director, "new", "New", "password123", Role::Staff)
            .expect_err("duplicate username");
        assert!(matches!(dup, AppError::Validation(_)));
    }

    #[test]
    fn test_bootstrap_director_only_on_empty_table() {
        let db = db::test_db();
        assert!(bootstrap_director(&db, "admin", "changeme123").expect("bootstrap"));
        assert!(!bootstrap_director(&db, "admin2", "changeme123").expect("second bootstrap"));
        let users = list_users(&db).expect("list users");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].role, Role::Director);
    }

    #[test]
    fn test_login_releases_connection_while_verifying() {
        let db = Arc::new(db::test_db());
        {
            let conn = db.lock().expect("db lock");
            let hash = bcrypt::hash("password123", 10).expect("hash");
            insert_user(&conn, "kim", "Kim", &hash, Role::Staff).expect("insert user");
        }

        let worker = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || login(&db, "kim", "password123"))
        };
        let mut acquired = 0;
        while !worker.is_finished() {
            if db.conn.try_lock().is_ok() {
                acquired += 1;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        worker.join().expect("login thread").expect("login");
        assert!(acquired >= 3, "connection was free {acquired} times during login");
    }

    #[test]
    fn test_change_password_requires_current_password() {
        let db = db::test_db();
        seed_user(&db, "kim", Role::Staff);
        let session = login(&db, "kim", "password123").expect("login");
        let ctx = resolve_session(&db, &session.token)
            .expect("resolve")
            .expect("active");

        let err = change_password(&db, &ctx, "wrong", "newpassword1").expect_err("wrong current");
        assert!(matches!(err, AppError::InvalidCredentials));
        change_password(&db, &ctx, "password123", "newpassword1").expect("change");
        login(&db, "kim", "newpassword1").expect("login with new password");
    }
}
