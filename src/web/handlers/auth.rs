use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Form;
use serde::Deserialize;

use crate::auth::{self, Permission, Role};
use crate::error::AppError;
use crate::web::error::{PageResult, WebError};
use crate::web::html::{error_block, esc, options, page};
use crate::web::session::{clear_cookie, cookie_value, session_cookie, CurrentUser, COOKIE_NAME};
use crate::web::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

fn login_page(error: Option<&str>, username: &str) -> Html<String> {
    let body = format!(
        r#"{error}
<form method="post" action="/login" class="card narrow">
<label>Username <input name="username" value="{username}" autofocus required/></label>
<label>Password <input name="password" type="password" required/></label>
<button type="submit">Sign in</button>
</form>"#,
        error = error_block(error),
        username = esc(username),
    );
    page("Sign in", None, &body)
}

pub async fn login_form(State(state): State<AppState>, headers: axum::http::HeaderMap) -> Response {
    // Already signed in: skip the form.
    if let Some(token) = cookie_value(&headers, COOKIE_NAME) {
        let resolved = state
            .run_blocking(move |db| auth::resolve_session(db, &token))
            .await;
        if let Ok(Some(_)) = resolved {
            return Redirect::to("/").into_response();
        }
    }
    login_page(None, "").into_response()
}

pub async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    let (username, password) = (form.username.clone(), form.password);
    let result = state
        .run_blocking(move |db| auth::login(db, &username, &password))
        .await;
    match result {
        Ok(session) => (
            [(SET_COOKIE, session_cookie(&session.token))],
            Redirect::to("/"),
        )
            .into_response(),
        Err(AppError::InvalidCredentials) => (
            StatusCode::UNAUTHORIZED,
            login_page(Some("Invalid username or password"), &form.username),
        )
            .into_response(),
        Err(e) => WebError::from(e).into_response(),
    }
}

pub async fn logout(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Response> {
    auth::logout(&state.db, &ctx)?;
    Ok(([(SET_COOKIE, clear_cookie())], Redirect::to("/login")).into_response())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewUserForm {
    pub username: String,
    #[serde(default)]
    pub full_name: String,
    pub password: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordForm {
    pub current_password: String,
    pub new_password: String,
}

pub async fn users(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
) -> PageResult<Html<String>> {
    ctx.require(Permission::ManageUsers)?;
    let users = auth::list_users(&state.db)?;

    let rows: String = users
        .iter()
        .map(|u| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                esc(&u.username),
                esc(&u.full_name),
                u.role.label(),
                u.failed_login_attempts,
                esc(u.last_login.as_deref().unwrap_or("never")),
            )
        })
        .collect();
    let roles = options(Role::ALL.iter().map(|r| (r.as_str(), r.label())), Some("staff"));

    let body = format!(
        r#"<table>
<thead><tr><th>Username</th><th>Name</th><th>Role</th><th>Failed logins</th><th>Last login</th></tr></thead>
<tbody>{rows}</tbody>
</table>
<h2>Add user</h2>
<form method="post" action="/users" class="card">
<label>Username <input name="username" required/></label>
<label>Full name <input name="full_name"/></label>
<label>Password <input name="password" type="password" required/></label>
<label>Role <select name="role">{roles}</select></label>
<button type="submit">Create</button>
</form>"#
    );
    Ok(page("Users", Some(&ctx), &body))
}

pub async fn create_user(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Form(form): Form<NewUserForm>,
) -> PageResult<Redirect> {
    let role: Role = form.role.parse()?;
    state
        .run_blocking(move |db| {
            auth::create_user(
                db,
                &ctx,
                &form.username,
                &form.full_name,
                &form.password,
                role,
            )
        })
        .await?;
    Ok(Redirect::to("/users"))
}

pub async fn password_form(CurrentUser(ctx): CurrentUser) -> Html<String> {
    let body = r#"<form method="post" action="/account/password" class="card narrow">
<label>Current password <input name="current_password" type="password" required/></label>
<label>New password <input name="new_password" type="password" required/></label>
<button type="submit">Change password</button>
</form>"#;
    page("Change password", Some(&ctx), body)
}

pub async fn change_password(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Form(form): Form<PasswordForm>,
) -> PageResult<Redirect> {
    state
        .run_blocking(move |db| {
            auth::change_password(db, &ctx, &form.current_password, &form.new_password)
        })
        .await
        .map_err(|e| match e {
            AppError::InvalidCredentials => WebError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Invalid Input",
                "Current password is incorrect",
            ),
            other => other.into(),
        })?;
    Ok(Redirect::to("/"))
}
