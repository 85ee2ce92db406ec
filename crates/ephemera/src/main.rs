use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{builder::BoolishValueParser, Parser, Subcommand};
use ephemera_server::{dirs, ServerConfig, StoreConfig, DEFAULT_PORT};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ephemera", about = "Ephemera: one-time secret sharing", version)]
struct Cli {
    /// Ephemera server URL (default: http://localhost:8834 or $EPHEMERA_SERVER)
    #[arg(long, env = "EPHEMERA_SERVER", default_value = "http://localhost:8834")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Ephemera HTTP server
    Serve(ServeArgs),
    /// Store a secret and print its one-time link
    Push {
        /// Secret text; read from stdin when omitted or `-`
        #[arg(name = "SECRET")]
        secret: Option<String>,
    },
    /// Retrieve a secret (this destroys it)
    Get {
        /// Share link (`.../c/<id>/<token>`) or a bare id
        target: String,
        /// Token, when `target` is a bare id
        token: Option<String>,
    },
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Host to bind
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[arg(long, env = "LISTEN_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Server-side key fragment, combined with each secret's token
    #[arg(long, env = "KEY_PART", hide_env_values = true)]
    key_part: String,
    /// Keep secrets in an on-disk database instead of memory
    #[arg(long, env = "PERSISTENT_STORAGE", value_parser = BoolishValueParser::new())]
    persistent: bool,
    /// Directory for the on-disk database (default: platform data dir)
    #[arg(long, env = "STORAGE_PATH")]
    storage_path: Option<PathBuf>,
    /// Length of generated secret ids
    #[arg(long, env = "ID_LENGTH", default_value_t = 8)]
    id_length: usize,
    /// Length of generated per-secret tokens
    #[arg(long, env = "KEY_LENGTH", default_value_t = 8)]
    token_length: usize,
    /// Seconds to wait for the database file lock
    #[arg(long, env = "LOCK_TIMEOUT_SECS", default_value_t = 3)]
    lock_timeout_secs: u64,
    /// Comma-separated CORS origins (default: any)
    #[arg(long, env = "CORS_ORIGINS")]
    cors_origins: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal; the environment may already be set.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve(_) => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EPHEMERA_LOG").unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, "could not load .env file");
        }
    }

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Push { secret } => cmd_push(&cli.server, secret.as_deref()).await,
        Commands::Get { target, token } => cmd_get(&cli.server, &target, token.as_deref()).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    if args.key_part.is_empty() {
        tracing::warn!("KEY_PART is empty; secrets are protected by the token alone");
    }

    let storage_path = if args.persistent {
        dirs::data_dir(args.storage_path.as_deref())?
    } else {
        args.storage_path.unwrap_or_default()
    };

    let store = StoreConfig {
        key_part: args.key_part,
        persistent: args.persistent,
        storage_path,
        id_length: args.id_length,
        token_length: args.token_length,
        lock_timeout: Duration::from_secs(args.lock_timeout_secs),
    };
    store.validate().context("invalid store configuration")?;

    let cfg = ServerConfig {
        host: args.host,
        port: args.port,
        cors_origins: args.cors_origins,
        ..ServerConfig::new(store)
    };

    ephemera_server::run(cfg).await
}

#[derive(Deserialize)]
struct SaveResponse {
    link: String,
}

async fn cmd_push(server: &str, secret: Option<&str>) -> Result<()> {
    let secret = match secret {
        Some(s) if s != "-" => s.to_owned(),
        _ => read_stdin()?,
    };
    if secret.is_empty() {
        anyhow::bail!("secret must not be empty");
    }

    let base = server.trim_end_matches('/');
    let resp = Client::new()
        .post(format!("{base}/secrets"))
        .json(&json!({ "secret": secret }))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    if !status.is_success() {
        let json: Value = resp.json().await.unwrap_or_default();
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }

    let saved: SaveResponse = resp.json().await.context("parse response")?;
    println!("{base}/{}", saved.link);
    Ok(())
}

async fn cmd_get(server: &str, target: &str, token: Option<&str>) -> Result<()> {
    let (id, token) = parse_target(target, token)?;

    let resp = Client::new()
        .post(format!("{}/secrets/retrieve", server.trim_end_matches('/')))
        .json(&json!({ "id": id, "token": token }))
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;

    if status.is_success() {
        println!("{}", json["secret"].as_str().unwrap_or(""));
    } else {
        let error = json["error"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{error}");
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("read secret from stdin")?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_owned())
}

/// Accept either a share link ending in `c/<id>/<token>` or a bare id plus
/// a separate token.
fn parse_target(target: &str, token: Option<&str>) -> Result<(String, String)> {
    if let Some(token) = token {
        return Ok((target.to_owned(), token.to_owned()));
    }

    let mut parts = target.trim_end_matches('/').rsplit('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(token), Some(id), Some("c")) if !id.is_empty() && !token.is_empty() => {
            Ok((id.to_owned(), token.to_owned()))
        }
        _ => anyhow::bail!("expected a link ending in c/<id>/<token>, or an id and a token"),
    }
}
