//! Page and form handlers, one module per area of the app.

pub mod approvals;
pub mod auth;
pub mod dashboard;
pub mod export;
pub mod inventory;
pub mod invoices;
pub mod jobs;
