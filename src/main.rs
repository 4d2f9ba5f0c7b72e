use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use reqwest::Method;
use std::sync::Arc;

use leave_portal_client::auth::{AuthManager, CredentialPersistence, SessionEvent, SqliteCredentials};
use leave_portal_client::config::{CliArgs, Command, Config, LogFormat};
use leave_portal_client::http_client::{ApiClient, ApiRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::load(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .init(),
    }

    tracing::debug!(
        base_url = %config.api_base_url,
        db_file = %config.credentials_db_file.display(),
        "Configuration loaded"
    );

    let persistence: Arc<dyn CredentialPersistence> =
        Arc::new(SqliteCredentials::open(&config.credentials_db_file)?);

    let auth_manager = Arc::new(AuthManager::new(
        config.auth_endpoints(),
        config.default_role,
        Some(persistence),
        config.refresh_timeout(),
    )?);

    match args.command {
        Command::Login { email } => {
            let password: String = Password::new()
                .with_prompt(format!("Password for {} ({})", email, config.default_role))
                .interact()
                .context("Failed to read password")?;

            auth_manager
                .login(config.default_role, &email, &password)
                .await?;
            println!("✅ Logged in as {} ({})", email, config.default_role);
        }

        Command::Logout => {
            auth_manager.logout();
            println!("👋 Logged out");
        }

        Command::Status => print_status(&auth_manager),

        Command::Request {
            method,
            path,
            body,
            repeat,
        } => {
            let http_client = ApiClient::new(
                auth_manager.clone(),
                config.api_base_url.clone(),
                config.http_max_connections,
                config.http_connect_timeout,
                config.http_request_timeout,
            )?;

            let request = build_request(&method, &path, body.as_deref())?;

            tokio::select! {
                result = run_requests(&http_client, request, repeat.max(1)) => result?,
                _ = shutdown_signal() => {}
            }
        }
    }

    Ok(())
}

fn build_request(method: &str, path: &str, body: Option<&str>) -> Result<ApiRequest> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let mut request = ApiRequest::new(method, path);
    if let Some(body) = body {
        let value: serde_json::Value =
            serde_json::from_str(body).context("Request body is not valid JSON")?;
        request = request.json(&value)?;
    }
    Ok(request)
}

/// Send `repeat` copies of the request concurrently and print each outcome
async fn run_requests(http_client: &ApiClient, request: ApiRequest, repeat: usize) -> Result<()> {
    let auth_manager = http_client.auth_manager();

    // Surface session termination once, however many calls it affected
    let mut events = auth_manager.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Expired { reason } => {
                    eprintln!("⚠️  Session expired ({}). Run `leave-client login`.", reason);
                }
                SessionEvent::Refreshed { generation } => {
                    tracing::info!(generation, "Session refreshed");
                }
                _ => {}
            }
        }
    });

    let calls = (0..repeat).map(|_| http_client.send(request.clone()));
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        match result {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                println!("[{}] {} {}", i + 1, status.as_u16(), text);
            }
            Err(e) => println!("[{}] error: {}", i + 1, e),
        }
    }

    let snapshot = auth_manager.metrics().snapshot();
    tracing::info!(
        requests = snapshot.total_requests,
        refreshes = snapshot.refreshes_started,
        queued = snapshot.calls_queued,
        errors = snapshot.total_errors,
        "Done"
    );

    watcher.abort();
    Ok(())
}

fn print_status(auth_manager: &AuthManager) {
    let creds = auth_manager.credentials();

    println!("  Role:        {}", creds.role);
    println!(
        "  Session:     {}",
        if creds.valid { "active" } else { "signed out" }
    );
    if creds.valid {
        println!("  Token:       {}", creds.token_hint());
    }
    if let Some(updated_at) = creds.updated_at {
        println!("  Updated:     {}", updated_at.to_rfc3339());
    }
    println!(
        "  Refresh URL: {}",
        auth_manager.endpoints().refresh_url(creds.role)
    );
}

/// Handle Ctrl+C / terminate
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, aborting in-flight requests...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, aborting in-flight requests...");
        },
    }
}
