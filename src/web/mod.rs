//! HTTP surface: server-rendered pages over the domain modules.
//!
//! Every protected handler takes a [`session::CurrentUser`], which resolves
//! the `remember_user` cookie into a `RequestContext` or redirects to
//! `/login`. Domain errors become HTML error pages via [`error::WebError`].

pub mod error;
mod handlers;
pub mod html;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::db::DbState;
use crate::error::{AppError, AppResult};
use crate::diagnostics;
use handlers::{approvals, auth, dashboard, export, inventory, invoices, jobs};

const SITE_CSS: &str = include_str!("../../static/site.css");

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
}

impl AppState {
    pub fn new(db: Arc<DbState>) -> Self {
        AppState { db }
    }

    /// Run synchronous database or bcrypt work on the blocking pool so it
    /// never stalls a runtime worker.
    pub async fn run_blocking<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&DbState) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| AppError::Internal(format!("blocking task failed: {e}")))?
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(diagnostics::get_health(&state.db))
}

async fn stylesheet() -> impl IntoResponse {
    ([(CONTENT_TYPE, "text/css; charset=utf-8")], SITE_CSS)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/login", get(auth::login_form).post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/", get(dashboard::index))
        // Jobs
        .route("/jobs", get(jobs::list).post(jobs::create))
        .route("/jobs/{id}", get(jobs::detail))
        .route("/jobs/{id}/status", post(jobs::change_status))
        .route("/jobs/{id}/description", post(jobs::update_description))
        .route("/jobs/{id}/parts", post(jobs::add_part))
        .route("/jobs/{id}/parts/{line_id}/delete", post(jobs::remove_part))
        .route("/jobs/{id}/labor", post(jobs::add_labor))
        .route("/jobs/{id}/delete", post(jobs::delete))
        // Approvals
        .route("/quotations", get(approvals::queue))
        .route("/jobs/{id}/quotations", post(approvals::submit_quotation))
        .route("/jobs/{id}/subcontracts", post(approvals::submit_subcontract))
        .route("/approvals/{kind}/{id}/approve", post(approvals::approve))
        .route("/approvals/{kind}/{id}/reject", post(approvals::reject))
        // Billing
        .route("/invoices", get(invoices::list))
        .route("/jobs/{id}/invoice", post(invoices::generate))
        .route("/invoices/{id}", get(invoices::view))
        .route("/invoices/{id}/print", get(invoices::print))
        // Stock
        .route(
            "/suppliers",
            get(inventory::suppliers).post(inventory::create_supplier),
        )
        .route("/inventory", get(inventory::parts).post(inventory::create_part))
        .route("/inventory/{id}/stock", post(inventory::adjust_stock))
        .route("/inventory/{id}/delete", post(inventory::delete_part))
        // Accounts
        .route("/users", get(auth::users).post(auth::create_user))
        .route(
            "/account/password",
            get(auth::password_form).post(auth::change_password),
        )
        .route("/export/{file}", get(export::csv))
        .route("/health", get(health))
        .route("/static/site.css", get(stylesheet))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(listener, router(state)).await
}
