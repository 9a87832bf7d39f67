//! Process configuration read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{AppError, AppResult};

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Director account created on first start when no users exist.
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        let data_dir = non_empty_var("GARAGE_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.into());
        let bind_raw = non_empty_var("GARAGE_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into());
        let bind_addr = bind_raw
            .parse()
            .map_err(|e| AppError::Validation(format!("GARAGE_BIND_ADDR {bind_raw:?}: {e}")))?;

        Ok(AppConfig {
            data_dir: PathBuf::from(data_dir),
            bind_addr,
            admin_user: non_empty_var("GARAGE_ADMIN_USER"),
            admin_password: non_empty_var("GARAGE_ADMIN_PASSWORD"),
        })
    }

    /// Bootstrap credentials, only when both halves are set.
    pub fn admin_credentials(&self) -> Option<(&str, &str)> {
        match (&self.admin_user, &self.admin_password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 4] = [
        "GARAGE_DATA_DIR",
        "GARAGE_BIND_ADDR",
        "GARAGE_ADMIN_USER",
        "GARAGE_ADMIN_PASSWORD",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = AppConfig::from_env().expect("config");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert!(config.admin_credentials().is_none());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("GARAGE_DATA_DIR", "/tmp/garage");
        std::env::set_var("GARAGE_BIND_ADDR", "0.0.0.0:9000");
        std::env::set_var("GARAGE_ADMIN_USER", "owner");
        std::env::set_var("GARAGE_ADMIN_PASSWORD", "s3cret");
        let config = AppConfig::from_env().expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/garage"));
        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.admin_credentials(), Some(("owner", "s3cret")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_half_credentials_ignored_and_bad_addr_rejected() {
        clear_env();
        std::env::set_var("GARAGE_ADMIN_USER", "owner");
        let config = AppConfig::from_env().expect("config");
        assert!(config.admin_credentials().is_none());

        std::env::set_var("GARAGE_BIND_ADDR", "not-an-addr");
        let err = AppConfig::from_env().expect_err("bad addr");
        assert!(matches!(err, AppError::Validation(_)));
        clear_env();
    }
}
