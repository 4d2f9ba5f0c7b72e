use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{
    AuthEndpoints, Role, DEFAULT_ADMIN_LOGIN_PATH, DEFAULT_ADMIN_REFRESH_PATH,
    DEFAULT_EMPLOYEE_LOGIN_PATH, DEFAULT_EMPLOYEE_REFRESH_PATH,
};

/// Leave portal API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL of the leave portal REST API
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub base_url: Option<String>,

    /// Role used when no saved session says otherwise (employee, admin)
    #[arg(short = 'r', long, env = "AUTH_ROLE", default_value = "employee")]
    pub role: String,

    /// Path to the SQLite file holding the saved session
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Refresh exchange timeout in seconds
    #[arg(long, env = "REFRESH_TIMEOUT", default_value = "10")]
    pub refresh_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and save the session
    Login {
        /// Account email
        #[arg(short, long)]
        email: String,
    },
    /// Forget the saved session
    Logout,
    /// Show the saved session
    Status,
    /// Send an authenticated request and print the response
    Request {
        /// HTTP method
        method: String,
        /// Path relative to the base URL, e.g. /leave/balance
        path: String,
        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
        /// Send the same request N times concurrently
        #[arg(short = 'n', long, default_value = "1")]
        repeat: usize,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // API
    pub api_base_url: String,
    pub default_role: Role,

    // Auth endpoints
    pub employee_refresh_path: String,
    pub admin_refresh_path: String,
    pub employee_login_path: String,
    pub admin_login_path: String,

    // Session storage
    pub credentials_db_file: PathBuf,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub refresh_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults
    pub fn load(args: &CliArgs) -> Result<Self> {
        let config = Config {
            api_base_url: args
                .base_url
                .clone()
                .or_else(|| std::env::var("API_BASE_URL").ok())
                .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?,

            default_role: args
                .role
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid AUTH_ROLE")?,

            employee_refresh_path: env_or("EMPLOYEE_REFRESH_PATH", DEFAULT_EMPLOYEE_REFRESH_PATH),
            admin_refresh_path: env_or("ADMIN_REFRESH_PATH", DEFAULT_ADMIN_REFRESH_PATH),
            employee_login_path: env_or("EMPLOYEE_LOGIN_PATH", DEFAULT_EMPLOYEE_LOGIN_PATH),
            admin_login_path: env_or("ADMIN_LOGIN_PATH", DEFAULT_ADMIN_LOGIN_PATH),

            credentials_db_file: args
                .db_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_credentials_db_file),

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,
            refresh_timeout: args.refresh_timeout,

            log_level: args.log_level.clone(),
            log_format: args.log_format,
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            anyhow::bail!(
                "API_BASE_URL must start with http:// or https://: {}",
                self.api_base_url
            );
        }

        if self.http_request_timeout == 0 || self.refresh_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT and REFRESH_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    pub fn auth_endpoints(&self) -> AuthEndpoints {
        AuthEndpoints {
            base_url: self.api_base_url.clone(),
            employee_refresh_path: self.employee_refresh_path.clone(),
            admin_refresh_path: self.admin_refresh_path.clone(),
            employee_login_path: self.employee_login_path.clone(),
            admin_login_path: self.admin_login_path.clone(),
        }
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default session database under the user data directory
fn default_credentials_db_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("leave-portal")
        .join("session.sqlite3")
}
