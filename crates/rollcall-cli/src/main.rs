use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::AttendanceEvent;
use rollcall_sink::SqliteEventStore;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status
    Status,
    /// List identities in the daemon's live table
    Identities,
    /// Show recent attendance events for an identity
    Events {
        /// Identity name (enrollment directory name)
        identity: String,
        /// Maximum number of events to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Attendance database (default: $ROLLCALL_DB_PATH or ~/.local/share/rollcall/attendance.db)
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Inspect an enrollment directory
    Enrollment {
        /// Enrollment root (default: $ROLLCALL_ENROLLMENT_DIR or ./faces)
        dir: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

// `#[zbus::proxy]` generates both `AttendanceProxy` (async) and
// `AttendanceProxyBlocking`. Only the blocking variant is used here.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
}

fn daemon() -> Result<AttendanceProxyBlocking<'static>> {
    let conn = zbus::blocking::connection::Builder::system()?
        .method_timeout(Duration::from_secs(3))
        .build()
        .context("connecting to the system bus")?;
    AttendanceProxyBlocking::new(&conn).context("rollcalld is not reachable on D-Bus")
}

fn default_db_path() -> PathBuf {
    if let Some(path) = std::env::var_os("ROLLCALL_DB_PATH") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/attendance.db")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn format_events(identity: &str, events: &[AttendanceEvent]) -> String {
    if events.is_empty() {
        return format!("No attendance recorded for {identity}");
    }
    let mut out = format!("{:<20} {:<10} {:>10}  {}\n", "TIME (UTC)", "CAMERA", "SIMILARITY", "EVENT");
    for e in events {
        out.push_str(&format!(
            "{:<20} {:<10} {:>10.3}  {}\n",
            e.occurred_at.format("%Y-%m-%d %H:%M:%S"),
            e.camera_id,
            e.similarity,
            e.id
        ));
    }
    out
}

fn show_enrollment(dir: &Path) -> Result<()> {
    let fp = rollcall_core::fingerprint(dir)?;
    let people = rollcall_core::enrollment::scan(dir)?;
    println!("Enrollment directory: {}", dir.display());
    println!("  directories: {}  files: {}  digest: {}", fp.directories, fp.files, fp.digest_hex());
    if people.is_empty() {
        println!("  no identities");
    }
    for person in &people {
        println!("  {:<24} {} image(s)", person.name, person.images.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Status => print_json(&daemon()?.status()?)?,
        Commands::Identities => print_json(&daemon()?.list_identities()?)?,
        Commands::Events { identity, limit, db } => {
            let path = db.unwrap_or_else(default_db_path);
            if !path.exists() {
                anyhow::bail!("attendance database not found: {}", path.display());
            }
            let store = SqliteEventStore::open(&path)?;
            let events = store.recent_for_identity(&identity, limit)?;
            print!("{}", format_events(&identity, &events));
            if events.is_empty() {
                println!();
            }
        }
        Commands::Enrollment { dir } => {
            let dir = dir
                .or_else(|| std::env::var_os("ROLLCALL_ENROLLMENT_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./faces"));
            show_enrollment(&dir)?;
        }
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{:<14} {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}
