use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Response};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ots", about = "One-time secret sharing", version)]
struct Cli {
    /// Server URL (default: http://localhost:8080 or $OTS_SERVER)
    #[arg(long, env = "OTS_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on (default: $OTS_PORT or 8080)
        #[arg(long, env = "OTS_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $OTS_HOST or 0.0.0.0)
        #[arg(long, env = "OTS_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Create a secret and print its share URL
    Create {
        /// Secret text
        #[arg(name = "TEXT")]
        text: String,
        /// Require this passphrase to reveal the secret
        #[arg(long)]
        passphrase: Option<String>,
        /// Lifetime e.g. 10m, 1h, 7d (default: 24h)
        #[arg(long)]
        ttl: Option<String>,
        /// Number of times the secret may be revealed (default: 1)
        #[arg(long)]
        views: Option<u32>,
        /// Recipient email stored alongside the secret
        #[arg(long)]
        email: Option<String>,
    },
    /// Show whether a secret is still available, without consuming a view
    Status {
        /// Secret key or share URL
        key: String,
    },
    /// Reveal a secret (consumes one view)
    Reveal {
        /// Secret key or share URL
        key: String,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Print a random passphrase
    Passphrase {
        #[arg(long, default_value = "16")]
        length: usize,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("OTS_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,

        Commands::Create {
            text,
            passphrase,
            ttl,
            views,
            email,
        } => {
            let ttl_seconds = ttl.as_deref().map(parse_duration).transpose()?;
            cmd_create(&cli.server, &text, passphrase, ttl_seconds, views, email).await
        }

        Commands::Status { key } => cmd_status(&cli.server, key_from_arg(&key)).await,

        Commands::Reveal { key, passphrase } => {
            cmd_reveal(&cli.server, key_from_arg(&key), passphrase.as_deref()).await
        }

        Commands::Passphrase { length } => {
            if length == 0 {
                anyhow::bail!("--length must be at least 1");
            }
            println!("{}", ots_server::store::crypto::generate_passphrase(length));
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = ots_server::ServerConfig {
        host,
        port,
        master_key: Some(ots_server::resolve_master_key()?),
        ..Default::default()
    };

    ots_server::run(cfg).await
}

async fn cmd_create(
    server: &str,
    text: &str,
    passphrase: Option<String>,
    ttl_seconds: Option<u64>,
    views: Option<u32>,
    email: Option<String>,
) -> Result<()> {
    let body = json!({
        "secret": text,
        "passphrase": passphrase,
        "ttl": ttl_seconds,
        "maxViews": views,
        "recipientEmail": email,
    });

    let resp = Client::new()
        .post(format!("{}/secrets", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let json = success_json(resp).await?;
    println!("{}", json["url"].as_str().unwrap_or_default());
    if let Some(expires_at) = json["expiresAt"].as_str() {
        eprintln!("expires at {expires_at}");
    }
    Ok(())
}

async fn cmd_status(server: &str, key: &str) -> Result<()> {
    let resp = Client::new()
        .get(format!("{}/secrets/{}", server.trim_end_matches('/'), key))
        .send()
        .await
        .context("HTTP request failed")?;

    let json = success_json(resp).await?;
    println!(
        "available: {} view(s) left, expires at {}{}",
        json["viewsRemaining"].as_u64().unwrap_or(0),
        json["expiresAt"].as_str().unwrap_or("?"),
        if json["needsPassphrase"].as_bool().unwrap_or(false) {
            ", passphrase required"
        } else {
            ""
        }
    );
    Ok(())
}

async fn cmd_reveal(server: &str, key: &str, passphrase: Option<&str>) -> Result<()> {
    let resp = Client::new()
        .post(format!("{}/secrets/{}", server.trim_end_matches('/'), key))
        .json(&json!({ "passphrase": passphrase }))
        .send()
        .await
        .context("HTTP request failed")?;

    let json = success_json(resp).await?;
    println!("{}", json["secret"].as_str().unwrap_or_default());
    match json["viewsRemaining"].as_u64() {
        Some(0) => eprintln!("this was the last view; the secret is now destroyed"),
        Some(n) => eprintln!("{n} view(s) left"),
        None => {}
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Body of a successful response, or the server's error message.
async fn success_json(resp: Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if status.is_success() {
        return Ok(json);
    }
    let error = json["error"].as_str().unwrap_or("unknown error");
    if json["needsPassphrase"].as_bool().unwrap_or(false) {
        anyhow::bail!("{error} (use --passphrase)");
    }
    anyhow::bail!("server returned {status}: {error}")
}

/// Accept either a bare key or a full share URL (`.../secret/<key>`).
fn key_from_arg(arg: &str) -> &str {
    arg.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(arg)
}

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}
