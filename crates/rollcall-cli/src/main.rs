use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::preprocess::load_image;
use rollcall_core::quality::mean_brightness;
use rollcall_core::QualityGate;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the quality gate locally, without the daemon
    Inspect {
        image: PathBuf,
    },
    /// Ask the daemon to quality-check an image
    Check {
        image: PathBuf,
    },
    /// Identify the face in an image
    Recognize {
        image: PathBuf,
    },
    /// Identify the face and mark the person as checked in
    CheckIn {
        image: PathBuf,
    },
    /// Identify the face and mark the person as checked out
    CheckOut {
        image: PathBuf,
    },
    /// Register a new identity from one image per pose step
    Register {
        /// Display name for the identity
        #[arg(short, long)]
        name: String,
        /// Identity ID (random UUID if omitted)
        #[arg(long)]
        id: Option<String>,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// List registered identities
    List,
    /// Remove a registered identity
    Remove {
        /// Identity ID to remove
        id: String,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn check_quality(&self, path: &str) -> zbus::Result<String>;
    async fn recognize(&self, path: &str) -> zbus::Result<String>;
    async fn check_in(&self, path: &str) -> zbus::Result<String>;
    async fn check_out(&self, path: &str) -> zbus::Result<String>;
    async fn register(&self, id: &str, name: &str, paths: Vec<String>) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn remove_identity(&self, id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Inspect { image } = &cli.command {
        return inspect(image);
    }
    let proxy = connect(cli.system).await?;

    match cli.command {
        Commands::Inspect { .. } => {}
        Commands::Check { image } => {
            print_json(&proxy.check_quality(&absolute(&image)?).await?)?;
        }
        Commands::Recognize { image } => {
            print_json(&proxy.recognize(&absolute(&image)?).await?)?;
        }
        Commands::CheckIn { image } => {
            print_json(&proxy.check_in(&absolute(&image)?).await?)?;
        }
        Commands::CheckOut { image } => {
            print_json(&proxy.check_out(&absolute(&image)?).await?)?;
        }
        Commands::Register { name, id, images } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let paths = images
                .iter()
                .map(|p| absolute(p))
                .collect::<Result<Vec<_>>>()?;
            println!("Registering '{name}' ({id}) from {} image(s)...", paths.len());
            print_json(&proxy.register(&id, &name, paths).await?)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(&id).await? {
                println!("Removed identity {id}");
            } else {
                println!("No identity with ID {id}");
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(bus = if system { "system" } else { "session" }, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")
}

fn inspect(path: &Path) -> Result<()> {
    let image = load_image(path).with_context(|| format!("loading {}", path.display()))?;
    let verdict = QualityGate::default().check(&image);
    tracing::debug!(path = %path.display(), passed = verdict.passed(), "local quality check");
    let report = serde_json::json!({
        "path": path.display().to_string(),
        "width": image.width(),
        "height": image.height(),
        "brightness": mean_brightness(&image),
        "verdict": verdict,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// The daemon resolves paths in its own working directory.
fn absolute(path: &Path) -> Result<String> {
    let abs = std::fs::canonicalize(path).with_context(|| format!("resolving {}", path.display()))?;
    tracing::debug!(from = %path.display(), to = %abs.display(), "resolved image path");
    Ok(abs.to_string_lossy().into_owned())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
