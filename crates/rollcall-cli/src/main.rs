use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, Clahe};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use zbus::proxy;

#[proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn enroll(&self, person_id: &str, name: &str, images: Vec<String>) -> zbus::Result<String>;
    fn enroll_from_camera(&self, person_id: &str, name: &str) -> zbus::Result<String>;
    fn re_enroll(&self, person_id: &str, images: Vec<String>) -> zbus::Result<String>;
    fn remove_person(&self, person_id: &str) -> zbus::Result<bool>;
    fn remove_encoding(&self, person_id: &str, encoding_id: i64) -> zbus::Result<bool>;
    fn list_persons(&self) -> zbus::Result<String>;
    fn start_session(&self, policy: &str) -> zbus::Result<String>;
    fn stop_session(&self) -> zbus::Result<String>;
    fn session_status(&self) -> zbus::Result<String>;
    fn mark_manual(&self, person_id: &str) -> zbus::Result<String>;
    fn attendance(&self, from: &str, to: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new person from face images, or from the camera when none are given
    Enroll {
        /// Unique person identifier (e.g. a student number)
        id: String,
        /// Display name
        name: String,
        /// Face images; at least the configured minimum must be usable
        images: Vec<PathBuf>,
    },
    /// Add encodings to an already enrolled person
    ReEnroll {
        id: String,
        /// Face images; captures from the camera when omitted
        images: Vec<PathBuf>,
    },
    /// Remove a person with their encodings and attendance
    Remove { id: String },
    /// Remove one reference encoding of a person
    RemoveEncoding { id: String, encoding: i64 },
    /// List enrolled people
    List,
    /// Control the recognition session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Mark a person present without a camera match
    Mark { id: String },
    /// Print attendance, newest first
    Report {
        /// First day (YYYY-MM-DD), inclusive
        #[arg(long)]
        from: Option<String>,
        /// Last day (YYYY-MM-DD), inclusive
        #[arg(long)]
        to: Option<String>,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 5)]
        frames: usize,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start recognizing faces from the camera
    Start {
        /// Session key policy: daily, window:<seconds> or fixed:<name>
        #[arg(long, default_value = "")]
        policy: String,
    },
    /// Stop the running session and print its summary
    Stop,
    /// Show live session state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Test { device, frames } = &cli.command {
        return camera_test(device, *frames);
    }

    tracing::debug!(system_bus = cli.system, "connecting to rollcalld");
    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Enroll { id, name, images } => {
            let reply = if images.is_empty() {
                println!("Look at the camera...");
                proxy.enroll_from_camera(&id, &name).await?
            } else {
                let images = absolute(images)?;
                tracing::debug!(count = images.len(), "sending enrollment images");
                proxy.enroll(&id, &name, images).await?
            };
            print_enrollment(&reply)?;
        }
        Commands::ReEnroll { id, images } => {
            let reply = proxy.re_enroll(&id, absolute(images)?).await?;
            print_enrollment(&reply)?;
        }
        Commands::Remove { id } => {
            if proxy.remove_person(&id).await? {
                println!("Removed {id}");
            } else {
                println!("No such person: {id}");
            }
        }
        Commands::RemoveEncoding { id, encoding } => {
            if proxy.remove_encoding(&id, encoding).await? {
                println!("Removed encoding {encoding} of {id}");
            } else {
                println!("No encoding {encoding} for {id}");
            }
        }
        Commands::List => {
            let persons: Vec<Value> = serde_json::from_str(&proxy.list_persons().await?)?;
            if persons.is_empty() {
                println!("No one enrolled");
            }
            for p in persons {
                let count = p["encodings"].as_array().map_or(0, Vec::len);
                println!("{:<16} {:<24} {count} encoding(s)", text(&p["person_id"]), text(&p["name"]));
            }
        }
        Commands::Session { action } => match action {
            SessionAction::Start { policy } => {
                let v: Value = serde_json::from_str(&proxy.start_session(&policy).await?)?;
                println!("Session {} started, key {}", text(&v["id"]), text(&v["session_key"]));
            }
            SessionAction::Stop => {
                let v: Value = serde_json::from_str(&proxy.stop_session().await?)?;
                println!("Session {} ended ({})", text(&v["id"]), text(&v["end"]));
                println!("{}", serde_json::to_string_pretty(&v["stats"])?);
            }
            SessionAction::Status => {
                let v: Value = serde_json::from_str(&proxy.session_status().await?)?;
                println!("{}", serde_json::to_string_pretty(&v)?);
            }
        },
        Commands::Mark { id } => {
            let v: Value = serde_json::from_str(&proxy.mark_manual(&id).await?)?;
            let name = text(&v["name"]);
            let key = text(&v["session_key"]);
            if v["marked"].as_bool() == Some(true) {
                println!("Marked present: {name} ({id}) for {key}");
            } else {
                println!("Already marked: {name} ({id}) for {key}");
            }
        }
        Commands::Report { from, to, json } => {
            let reply = proxy
                .attendance(from.as_deref().unwrap_or(""), to.as_deref().unwrap_or(""))
                .await?;
            if json {
                println!("{reply}");
            } else {
                let rows: Vec<Value> = serde_json::from_str(&reply)?;
                println!("{:<16} {:<24} {:<32} SESSION", "ID", "NAME", "TIME");
                for r in &rows {
                    println!(
                        "{:<16} {:<24} {:<32} {}",
                        text(&r["person_id"]),
                        text(&r["name"]),
                        text(&r["timestamp"]),
                        text(&r["session_key"])
                    );
                }
                println!("{} record(s)", rows.len());
            }
        }
        Commands::Status => {
            let v: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
        // Runs before connecting to the bus.
        Commands::Test { .. } => {}
    }

    Ok(())
}

/// The daemon resolves paths in its own working directory.
fn absolute(paths: Vec<PathBuf>) -> Result<Vec<String>> {
    paths
        .into_iter()
        .map(|p| {
            let abs = std::fs::canonicalize(&p).with_context(|| format!("cannot read {}", p.display()))?;
            Ok(abs.to_string_lossy().into_owned())
        })
        .collect()
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "-".into(),
        other => other.to_string(),
    }
}

fn print_enrollment(reply: &str) -> Result<()> {
    let v: Value = serde_json::from_str(reply)?;
    println!(
        "Enrolled {} ({}): {} new encoding(s), {} total",
        text(&v["name"]),
        text(&v["person_id"]),
        v["committed"],
        v["total_encodings"]
    );
    if let Some(skipped) = v["skipped"].as_array() {
        for s in skipped {
            println!("  skipped: {}", text(s));
        }
    }
    Ok(())
}

fn camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {} {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = Camera::open(device, 640, 480)?.with_timeout(Duration::from_secs(2));
    tracing::debug!(device, "camera opened for diagnostics");
    println!(
        "{device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let clahe = Clahe::default();
    let batch = camera.capture_frames(frames, 4, Some(&clahe))?;
    println!("Captured {} usable frame(s), {} dark", batch.frames.len(), batch.dark);
    for f in &batch.frames {
        println!(
            "  seq {:>6}  brightness {:>6.1}  dark {:>5.1}%",
            f.sequence,
            f.mean_brightness(),
            f.dark_fraction() * 100.0
        );
    }
    Ok(())
}
