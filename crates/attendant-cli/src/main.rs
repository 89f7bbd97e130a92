use anyhow::{bail, Context, Result};
use attendant_core::{score, ArrivalRecord, RiskTier};
use attendant_hw::{CameraConstraints, CameraSession, ReleaseTrigger, StreamRegistry, V4lBackend};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.attendant.Attendant1",
    default_service = "org.attendant.Attendant1",
    default_path = "/org/attendant/Attendant1"
)]
trait Attendant {
    fn open_attendance(&self) -> zbus::Result<String>;
    fn mark(&self, latitude: f64, longitude: f64) -> zbus::Result<String>;
    fn open_enrollment(&self) -> zbus::Result<String>;
    fn capture(&self) -> zbus::Result<u32>;
    fn reset_captures(&self) -> zbus::Result<()>;
    fn submit(&self) -> zbus::Result<String>;
    fn open_report(&self, session_id: i64) -> zbus::Result<String>;
    fn hide(&self) -> zbus::Result<u32>;
    fn leave(&self) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "attendant", about = "Attendance capture client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the attendance view and mark attendance if a session is open
    Attend {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        /// Only open the view; do not mark
        #[arg(long)]
        dry_run: bool,
    },
    /// Register your face: collect samples and submit them
    Enroll {
        /// Seconds to keep trying before giving up
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Take one registration sample in the open enrollment view
    Capture,
    /// Discard collected registration samples
    Reset,
    /// Submit collected registration samples
    Submit,
    /// Show a session's attendance with its integrity score
    Report {
        session_id: i64,
        /// Keep printing live updates until interrupted
        #[arg(short, long)]
        watch: bool,
    },
    /// Score an exported list of arrivals without the daemon
    Score {
        /// JSON array of arrivals (usn, name, time, similarity, distance)
        file: PathBuf,
    },
    /// Release the camera but keep the current view
    Hide,
    /// Close the current view
    Leave,
    /// Show daemon status
    Status,
    /// Run camera diagnostics
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 10)]
        frames: usize,
        /// Save the last frame as a PNG
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Score { file } => score_file(&file),
        Commands::Test { device, frames, save } => camera_test(&device, frames, save.as_deref()),
        command => {
            let connection = zbus::Connection::session()
                .await
                .context("failed to connect to the session bus")?;
            let proxy = AttendantProxy::new(&connection)
                .await
                .context("attendantd is not running")?;
            run(&proxy, command).await
        }
    }
}

async fn run(proxy: &AttendantProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Attend { lat, lon, dry_run } => {
            let status = parse(&proxy.open_attendance().await?)?;
            let phase = status["phase"].as_str().unwrap_or_default();
            println!("{}", status["message"].as_str().unwrap_or(phase));
            if let Some(clock) = status["clock"]["text"].as_str() {
                println!("{clock}");
            }
            if phase == "open" && !dry_run {
                println!("{}", proxy.mark(lat, lon).await?);
            }
        }
        Commands::Enroll { timeout } => enroll(proxy, Duration::from_secs(timeout)).await?,
        Commands::Capture => {
            let count = proxy.capture().await?;
            println!("Captured {count}");
        }
        Commands::Reset => {
            proxy.reset_captures().await?;
            println!("Samples discarded");
        }
        Commands::Submit => println!("{}", proxy.submit().await?),
        Commands::Report { session_id, watch } => {
            let status = parse(&proxy.open_report(session_id).await?)?;
            print_report(&status);
            if watch {
                watch_report(proxy).await?;
            }
        }
        Commands::Hide => {
            let released = proxy.hide().await?;
            println!("Released {released} camera stream(s)");
        }
        Commands::Leave => proxy.leave().await?,
        Commands::Status => {
            let status = parse(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        // Offline commands never reach the daemon.
        Commands::Score { .. } | Commands::Test { .. } => {}
    }
    Ok(())
}

fn parse(json: &str) -> Result<Value> {
    serde_json::from_str(json).context("daemon returned malformed status")
}

async fn enroll(proxy: &AttendantProxy<'_>, timeout: Duration) -> Result<()> {
    let status = parse(&proxy.open_enrollment().await?)?;
    let quota = status["quota"].as_u64().unwrap_or(3) as u32;
    println!("Look at the camera. Collecting {quota} samples...");

    let deadline = tokio::time::Instant::now() + timeout;
    let mut count = 0;
    while count < quota {
        if tokio::time::Instant::now() >= deadline {
            proxy.leave().await?;
            bail!("timed out with {count}/{quota} samples");
        }
        match proxy.capture().await {
            Ok(n) => {
                count = n;
                println!("  sample {count}/{quota}");
            }
            Err(e @ zbus::Error::MethodError(..)) => {
                tracing::debug!(error = %e, "capture rejected");
            }
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    println!("{}", proxy.submit().await?);
    Ok(())
}

async fn watch_report(proxy: &AttendantProxy<'_>) -> Result<()> {
    let mut last = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
        }
        let status = parse(&proxy.status().await?)?;
        let view = &status["view"];
        if view["view"].as_str() != Some("report") {
            println!("Report closed");
            break;
        }
        let marker = (view["present"].as_u64(), view["assessment"]["total"].as_u64(), view["connection_lost"].as_bool());
        if last.as_ref() != Some(&marker) {
            println!();
            print_report(view);
            last = Some(marker);
        }
    }
    proxy.leave().await?;
    Ok(())
}

fn print_report(status: &Value) {
    let assessment = &status["assessment"];
    println!(
        "Session {}: {} present, trust {} ({})",
        status["session_id"],
        status["present"],
        assessment["value"],
        assessment["label"].as_str().unwrap_or("unknown"),
    );
    if status["connection_lost"].as_bool() == Some(true) {
        println!("  live connection lost");
    }
    if let Some(rows) = status["review"].as_array() {
        for row in rows {
            println!(
                "  {:<12} {:<24} {:<16} {}",
                row["usn"].as_str().unwrap_or(""),
                row["name"].as_str().unwrap_or(""),
                row["status"].as_str().unwrap_or(""),
                row["warning"].as_str().unwrap_or(""),
            );
        }
    }
}

fn score_file(path: &std::path::Path) -> Result<()> {
    let json = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let records: Vec<ArrivalRecord> = serde_json::from_str(&json).context("expected a JSON array of arrivals")?;
    let assessment = score(&records);

    println!(
        "Trust score: {} ({}) over {} arrivals",
        assessment.value,
        assessment.label.as_str(),
        assessment.total
    );
    println!(
        "  low match: {}  outside: {}  late: {}",
        assessment.low_match, assessment.outside, assessment.late
    );
    for record in assessment.ordered(&records) {
        let (status, warning) = RiskTier::of(record).describe();
        println!(
            "  {:<12} {:<24} {:<16} {}",
            record.student_id,
            record.name,
            status,
            warning.unwrap_or("")
        );
    }
    Ok(())
}

fn camera_test(device: &str, frames: usize, save: Option<&std::path::Path>) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let registry = Arc::new(StreamRegistry::new());
    let session = CameraSession::new(registry, Arc::new(V4lBackend::new(0)));
    let constraints = CameraConstraints {
        device: device.to_string(),
        ..CameraConstraints::default()
    };
    session.acquire(&constraints)?;

    let mut last = None;
    for _ in 0..frames {
        let frame = session.read_frame()?;
        println!(
            "  frame {:>4}  {}x{}  brightness {:>6.1}{}",
            frame.sequence,
            frame.width,
            frame.height,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        last = Some(frame);
    }
    session.release(ReleaseTrigger::Explicit);

    if let (Some(path), Some(frame)) = (save, last) {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image.save(path)?;
        println!("Saved last frame to {}", path.display());
    }
    Ok(())
}
