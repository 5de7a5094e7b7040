mod config;

use anyhow::{Context, Result};
use attend_core::{models, Matcher, OnnxEmbedder};
use attend_engine::{
    validate_id, validate_name, Ledger, RecordOutcome, Registry, VerificationOutcome, Verifier,
    VerifyError,
};
use attend_hw::{Camera, CameraCapture, Capture, FileCapture};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use config::{Config, Metric};
use image::DynamicImage;
use std::path::PathBuf;
use std::process::ExitCode;

/// Recaptures offered when a live capture is too dark or shows no face.
const RECAPTURE_RETRIES: u32 = 2;

#[derive(Parser)]
#[command(name = "attend", version, about = "Face-verified attendance register")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Flags that take precedence over the config file and environment.
#[derive(Args)]
struct Overrides {
    /// Data directory holding photos, ledger and attend.toml
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Directory containing det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// V4L2 device path
    #[arg(long, global = true)]
    camera: Option<String>,
    /// Distance metric used for matching
    #[arg(long, global = true, value_enum)]
    metric: Option<Metric>,
    /// Minimum cosine similarity for a match
    #[arg(long, global = true)]
    threshold: Option<f32>,
    /// Maximum euclidean distance for a match
    #[arg(long, global = true)]
    tolerance: Option<f32>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.model_dir {
            config.model_dir = Some(v);
        }
        if let Some(v) = self.camera {
            config.camera_device = v;
        }
        if let Some(v) = self.metric {
            config.metric = v;
        }
        if let Some(v) = self.threshold {
            config.similarity_threshold = v;
        }
        if let Some(v) = self.tolerance {
            config.euclidean_tolerance = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a reference photo for an identity
    Register {
        /// Roll number / identity key (no underscores)
        #[arg(long)]
        id: String,
        /// Display name recorded in the ledger
        #[arg(long)]
        name: String,
        /// Use a photo from disk instead of the camera
        #[arg(long)]
        image: Option<PathBuf>,
        /// Store the photo without checking that it contains a face
        #[arg(long)]
        no_face_check: bool,
    },
    /// Verify a face against an enrollment and mark attendance
    Mark {
        #[arg(long)]
        id: String,
        /// Use a photo from disk instead of the camera
        #[arg(long)]
        image: Option<PathBuf>,
        /// Recapture attempts when the capture is dark or has no face (camera only)
        #[arg(long, default_value_t = RECAPTURE_RETRIES)]
        retries: u32,
    },
    /// List enrolled identities
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show attendance for a day
    Report {
        /// Day to report, YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// Check that an enrolled photo still contains a detectable face
    Check {
        #[arg(long)]
        id: String,
    },
    /// Run camera and model diagnostics
    Test,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    cli.overrides.apply(&mut config);
    tracing::debug!(?config, "configuration resolved");

    match cli.command {
        Commands::Register {
            id,
            name,
            image,
            no_face_check,
        } => register(&config, &id, &name, image, no_face_check),
        Commands::Mark { id, image, retries } => mark(&config, &id, image, retries),
        Commands::List { json } => list(&config, json),
        Commands::Report { date, json } => report(&config, date, json),
        Commands::Check { id } => check(&config, &id),
        Commands::Test => diagnostics(&config),
    }
}

fn open_verifier(config: &Config) -> Result<Verifier<OnnxEmbedder, Box<dyn Matcher>>> {
    let registry = Registry::open(config.photo_dir())?;
    let ledger = Ledger::open(config.ledger_path())?;
    let model_dir = config.model_dir();
    let embedder = OnnxEmbedder::load(&model_dir, config.verify_models)
        .with_context(|| format!("failed to load face models from {}", model_dir.display()))?;
    Ok(Verifier::new(registry, ledger, embedder, config.matcher()))
}

/// A still from disk never changes, so only camera capture gets recapture retries.
fn capture_source(config: &Config, image: Option<PathBuf>) -> Result<(Box<dyn Capture>, bool)> {
    match image {
        Some(path) => Ok((Box::new(FileCapture::new(path)), false)),
        None => {
            let camera = Camera::open(&config.camera_device)
                .with_context(|| format!("failed to open camera {}", config.camera_device))?;
            Ok((
                Box::new(CameraCapture::interactive(camera, config.capture_attempts)),
                true,
            ))
        }
    }
}

/// Capture and run `attempt`, recapturing while either step fails with a
/// retryable error (dark scene, no face) and retries remain.
fn with_recapture<T>(
    capture: &mut dyn Capture,
    retries: u32,
    mut attempt: impl FnMut(DynamicImage) -> Result<T, VerifyError>,
) -> Result<T> {
    let mut remaining = retries;
    loop {
        let image = match capture.capture() {
            Ok(image) => image,
            Err(e) if e.is_retryable() && remaining > 0 => {
                remaining -= 1;
                println!("{e}; improve the lighting ({remaining} retries left)");
                continue;
            }
            Err(e) => return Err(e).context("image capture failed"),
        };
        match attempt(image) {
            Err(e) if e.is_retryable() && remaining > 0 => {
                remaining -= 1;
                println!("{e} ({remaining} retries left)");
            }
            result => return Ok(result?),
        }
    }
}

fn register(
    config: &Config,
    id: &str,
    name: &str,
    image: Option<PathBuf>,
    no_face_check: bool,
) -> Result<ExitCode> {
    validate_id(id)?;
    validate_name(name)?;
    let (mut capture, live) = capture_source(config, image)?;
    tracing::info!(id, name, live, "register requested");

    let enrollment = if no_face_check {
        let registry = Registry::open(config.photo_dir())?;
        let image = capture.capture().context("image capture failed")?;
        registry.enroll(id, name, &image)?
    } else {
        let mut verifier = open_verifier(config)?;
        let retries = if live { RECAPTURE_RETRIES } else { 0 };
        with_recapture(capture.as_mut(), retries, |image| {
            verifier.enroll_checked(id, name, &image)
        })?
    };

    println!(
        "Registered {} ({}) -> {}",
        enrollment.display_name,
        enrollment.id,
        enrollment.image_path.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn mark(config: &Config, id: &str, image: Option<PathBuf>, retries: u32) -> Result<ExitCode> {
    let id = validate_id(id)?;
    let mut verifier = open_verifier(config)?;
    if verifier.registry().find_by_id(id)?.is_none() {
        return Err(VerifyError::UnknownIdentity(id.to_string()).into());
    }
    let (mut capture, live) = capture_source(config, image)?;
    let retries = if live { retries } else { 0 };
    tracing::info!(id, live, retries, "mark requested");

    let outcome = with_recapture(capture.as_mut(), retries, |probe| verifier.verify(id, probe))?;

    match outcome {
        VerificationOutcome::Accepted(acceptance) => {
            match &acceptance.attendance {
                RecordOutcome::Recorded(record) => println!(
                    "Attendance marked for {} ({}) at {}",
                    record.display_name,
                    record.id,
                    record.time.format("%H:%M:%S")
                ),
                RecordOutcome::AlreadyPresent(record) => println!(
                    "{} ({}) already marked present on {} at {}",
                    record.display_name,
                    record.id,
                    record.date,
                    record.time.format("%H:%M:%S")
                ),
            }
            tracing::debug!(distance = acceptance.distance, "match distance");
            Ok(ExitCode::SUCCESS)
        }
        VerificationOutcome::Rejected { id, distance } => {
            println!("Face does not match the enrollment for {id} (distance {distance:.3})");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn list(config: &Config, json: bool) -> Result<ExitCode> {
    let registry = Registry::open(config.photo_dir())?;
    let enrollments = registry.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&enrollments)?);
    } else if enrollments.is_empty() {
        println!("No identities enrolled");
    } else {
        for e in &enrollments {
            println!("{:<16} {}", e.id, e.display_name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn report(config: &Config, date: Option<NaiveDate>, json: bool) -> Result<ExitCode> {
    let ledger = Ledger::open(config.ledger_path())?;
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let records = ledger.records_on(date)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No attendance recorded on {date}");
    } else {
        println!("Attendance on {date} ({} present)", records.len());
        for r in &records {
            println!("{:<16} {:<24} {}", r.id, r.display_name, r.time.format("%H:%M:%S"));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn check(config: &Config, id: &str) -> Result<ExitCode> {
    let mut verifier = open_verifier(config)?;
    match verifier.check_reference(id) {
        Ok(check) => {
            println!(
                "{} ({}): {} face(s) detected in {}",
                check.enrollment.display_name,
                check.enrollment.id,
                check.faces,
                check.enrollment.image_path.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ (VerifyError::NoFaceInReference { .. } | VerifyError::UnknownIdentity(_))) => {
            println!("{e}");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn diagnostics(config: &Config) -> Result<ExitCode> {
    let mut healthy = true;

    println!("Camera devices:");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("  none found");
    }
    for d in &devices {
        println!("  {} {} ({})", d.path, d.name, d.driver);
    }

    match Camera::open(&config.camera_device)
        .and_then(|camera| camera.capture_frame(config.capture_attempts))
    {
        Ok(frame) => println!(
            "Captured {}x{} frame from {} (brightness {:.1})",
            frame.width,
            frame.height,
            config.camera_device,
            frame.avg_brightness()
        ),
        Err(e) => {
            healthy = false;
            println!("Camera {}: {e}", config.camera_device);
        }
    }

    let model_dir = config.model_dir();
    match models::verify_models_dir(&model_dir) {
        Ok(()) => println!("Models in {}: checksums OK", model_dir.display()),
        Err(e) => {
            healthy = false;
            println!("Models in {}: {e}", model_dir.display());
        }
    }

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
