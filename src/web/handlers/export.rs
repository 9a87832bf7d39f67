use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};

use crate::export::{self, ExportTable};
use crate::web::error::PageResult;
use crate::web::session::CurrentUser;
use crate::web::AppState;

/// `GET /export/{file}` where `file` is `jobs.csv`, `invoices.csv` or
/// `inventory.csv`.
pub async fn csv(
    State(state): State<AppState>,
    CurrentUser(ctx): CurrentUser,
    Path(file): Path<String>,
) -> PageResult<Response> {
    let table: ExportTable = file.parse()?;
    let body = export::export_csv(&state.db, &ctx, table)?;
    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", table.file_name()),
            ),
        ],
        body,
    )
        .into_response())
}
