use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod setup;

#[derive(Parser)]
#[command(name = "vigil", version, about = "Vigil face authentication")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the models listed in a manifest.
    Setup {
        /// Manifest describing the detector, landmark and descriptor models.
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Verify an installed model directory against its manifest.
    CheckModels {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Show daemon status.
    Status,
    /// List a user's enrolled descriptors.
    List { user: String },
    /// Delete a user's face profile.
    Remove { user: String },
    /// Issue a verification challenge for a user (root only).
    Challenge { user: String },
    /// Resolve a session token to the user it was granted to.
    Session { token: String },
}

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    fn status(&self) -> zbus::Result<String>;
    fn list_profile(&self, user: &str) -> zbus::Result<String>;
    fn remove_profile(&self, user: &str) -> zbus::Result<u32>;
    fn issue_challenge(&self, user: &str) -> zbus::Result<String>;
    fn validate_session(&self, session_token: &str) -> zbus::Result<String>;
}

async fn connect(session: bool) -> Result<VigilProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    VigilProxy::new(&conn)
        .await
        .context("vigild is not reachable; is the daemon running?")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn profile_header() -> String {
    format!("{:<36} {:<4} {:<20} CREATED", "ID", "STEP", "MODEL")
}

/// One `ListProfile` entry; descriptor ids are UUID strings.
fn profile_row(entry: &serde_json::Value) -> String {
    let step = entry["step_index"]
        .as_i64()
        .map_or_else(|| "-".to_string(), |s| s.to_string());
    format!(
        "{:<36} {:<4} {:<20} {}",
        entry["id"].as_str().unwrap_or("-"),
        step,
        entry["model_version"].as_str().unwrap_or("-"),
        entry["created_at"].as_str().unwrap_or("-"),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Setup {
            manifest,
            model_dir,
        } => tokio::task::spawn_blocking(move || setup::run(manifest, model_dir)).await??,
        Command::CheckModels { model_dir } => {
            tokio::task::spawn_blocking(move || setup::check(model_dir).map(|_| ())).await??
        }
        Command::Status => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.status().await?)?;
        }
        Command::List { user } => {
            let proxy = connect(cli.session).await?;
            let raw = proxy.list_profile(&user).await?;
            let entries: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("daemon returned malformed JSON")?;
            if entries.is_empty() {
                println!("{user} has no enrolled face profile.");
            } else {
                println!("{}", profile_header());
                for entry in &entries {
                    println!("{}", profile_row(entry));
                }
            }
        }
        Command::Remove { user } => {
            let proxy = connect(cli.session).await?;
            let removed = proxy.remove_profile(&user).await?;
            if removed == 0 {
                println!("{user} had no enrolled face profile.");
            } else {
                println!("Removed {removed} descriptor(s) for {user}.");
            }
        }
        Command::Challenge { user } => {
            let proxy = connect(cli.session).await?;
            print_json(&proxy.issue_challenge(&user).await?)?;
        }
        Command::Session { token } => {
            let proxy = connect(cli.session).await?;
            let user = proxy
                .validate_session(&token)
                .await
                .context("session token rejected")?;
            println!("{user}");
        }
    }

    Ok(())
}
