//! grievance - command line front end for the campus grievance desk.
//!
//! Logs in, keeps the session alive through the shared session client, and
//! issues arbitrary authenticated API calls for scripting and support work.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use grievance_core::api::{ApiRequest, AuthApi, Method, MultipartForm};
use grievance_core::config::{Config, StorageKind, API_URL_ENV};
use grievance_core::{ApiError, SessionClient};

#[derive(Parser)]
#[command(name = "grievance", version, about = "Campus grievance desk client")]
struct Cli {
    /// API base URL (overrides the config file)
    #[arg(long, global = true, env = API_URL_ENV)]
    api_url: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session
    Login {
        #[arg(long)]
        email: String,
    },
    /// Sign out and clear stored credentials
    Logout,
    /// Show the cached profile
    Whoami,
    /// Send an authenticated request and print the response payload
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,
        /// Path relative to the API base URL, e.g. /complaints
        path: String,
        /// JSON body
        #[arg(long, conflicts_with_all = ["field", "file"])]
        json: Option<String>,
        /// Multipart text field, name=value
        #[arg(long, value_parser = parse_pair)]
        field: Vec<(String, String)>,
        /// Multipart file field, name=path
        #[arg(long, value_parser = parse_pair)]
        file: Vec<(String, String)>,
        /// Query parameter, key=value
        #[arg(long, value_parser = parse_pair)]
        query: Vec<(String, String)>,
    },
    /// Show or update the saved configuration
    Config {
        #[arg(long)]
        set_api_url: Option<String>,
        #[arg(long, value_enum)]
        storage: Option<StorageArg>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StorageArg {
    File,
    Keyring,
    Memory,
}

impl From<StorageArg> for StorageKind {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::File => StorageKind::File,
            StorageArg::Keyring => StorageKind::Keyring,
            StorageArg::Memory => StorageKind::Memory,
        }
    }
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .context("Log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_ref())?;

    let mut config = Config::load()?;

    if let Command::Config { set_api_url, storage } = &cli.command {
        return configure(&mut config, set_api_url.clone(), *storage);
    }

    let mut client_config = config.client_config();
    if let Some(ref url) = cli.api_url {
        client_config = grievance_core::ClientConfig {
            base_url: grievance_core::ClientConfig::new(url.clone()).base_url,
            ..client_config
        };
    }
    info!(base_url = %client_config.base_url, "grievance starting");

    let store = config.open_credential_store()?;
    let client = SessionClient::new(client_config, store)?;

    let result = match cli.command {
        Command::Login { email } => login(&client, &email).await,
        Command::Logout => AuthApi::new(client.clone()).logout().await.map(|_| {
            println!("Logged out.");
        }),
        Command::Whoami => {
            whoami(&client);
            Ok(())
        }
        Command::Request { method, path, json, field, file, query } => {
            request(&client, &method, &path, json, field, file, query).await
        }
        Command::Config { .. } => Ok(()),
    };

    report(result)
}

fn configure(config: &mut Config, api_url: Option<String>, storage: Option<StorageArg>) -> Result<()> {
    if api_url.is_none() && storage.is_none() {
        println!("{}", serde_json::to_string_pretty(config)?);
        println!("resolved base url: {}", config.client_config().base_url);
        return Ok(());
    }
    if let Some(url) = api_url {
        config.api_url = Some(url);
    }
    if let Some(storage) = storage {
        config.storage = storage.into();
    }
    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

async fn login(client: &SessionClient, email: &str) -> Result<(), ApiError> {
    let password = rpassword::prompt_password("Password: ")
        .map_err(ApiError::invalid_request)?;
    let user = AuthApi::new(client.clone()).login(email, &password).await?;
    match user {
        Some(user) => println!("Logged in as {}.", user.display_name()),
        None => println!("Logged in."),
    }
    Ok(())
}

fn whoami(client: &SessionClient) {
    let store = client.store();
    match store.user() {
        Some(user) => {
            println!("{} <{}>", user.display_name(), user.email.as_deref().unwrap_or("-"));
            println!("role: {}", user.role.as_deref().unwrap_or("-"));
        }
        None => println!("No cached profile."),
    }
    println!("authenticated: {}", store.is_authenticated());
}

async fn request(
    client: &SessionClient,
    method: &str,
    path: &str,
    json: Option<String>,
    fields: Vec<(String, String)>,
    files: Vec<(String, String)>,
    query: Vec<(String, String)>,
) -> Result<(), ApiError> {
    let method = method
        .to_uppercase()
        .parse::<Method>()
        .map_err(ApiError::invalid_request)?;
    let mut req = ApiRequest::new(method, path);

    for (key, value) in query {
        req = req.query(key, value);
    }

    if let Some(json) = json {
        let body: Value = serde_json::from_str(&json).map_err(ApiError::invalid_request)?;
        req = req.json_value(body);
    } else if !fields.is_empty() || !files.is_empty() {
        let mut form = MultipartForm::new();
        for (name, value) in fields {
            form = form.text(name, value);
        }
        for (name, path) in files {
            form = form
                .file_from_path(name, Path::new(&path))
                .map_err(ApiError::invalid_request)?;
        }
        req = req.multipart(form);
    }

    let payload = client.send(req).await?;
    let rendered = serde_json::to_string_pretty(&payload).map_err(ApiError::invalid_request)?;
    println!("{}", rendered);
    Ok(())
}

/// Print a failed call in its normalized shape and exit non-zero.
fn report(result: Result<(), ApiError>) -> Result<()> {
    if let Err(ref e) = result {
        if let Ok(rendered) = serde_json::to_string_pretty(&e.to_json()) {
            println!("{}", rendered);
        }
        if e.is_token_expired() {
            eprintln!("Session expired. Run `grievance login` again.");
        }
    }
    result.map_err(Into::into)
}
