//! Medical Device Log CLI Application
//!
//! Command-line front end for the medlog-decoder library. It:
//! - Replays recorded meter sessions (raw HID report captures)
//! - Reconstructs timelines from pump draft event files
//! - Writes the final events as JSON, one file per upload id
//! - Prints a per-input summary
//!
//! Inputs are independent device sessions and are processed in parallel.

use anyhow::{Context, Result};
use clap::Parser;
use medlog_decoder::transport::ReplayTransport;
use medlog_decoder::{
    reconstruct_drafts, run_session, DecodeStats, DecoderConfig, DraftEvent, FamilyKind,
    FinalEvent, GlucoseMeterBuilder, Medtronic, SessionMetadata, SessionOutcome, Tandem, Uploader,
};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
mod report;

use config::AppConfig;
use report::InputReport;

/// Medical device log decoder
#[derive(Parser, Debug)]
#[command(name = "medlog-cli")]
#[command(about = "Decode meter captures and pump drafts into a clinical event log", long_about = None)]
#[command(version)]
struct Args {
    /// Recorded meter session to replay (can be repeated)
    #[arg(long, value_name = "FILE")]
    capture: Vec<PathBuf>,

    /// JSON file of pump draft events (can be repeated)
    #[arg(long, value_name = "FILE")]
    drafts: Vec<PathBuf>,

    /// Device family of the draft files (tandem, medtronic)
    #[arg(long, value_name = "FAMILY")]
    family: Option<FamilyKind>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output directory for event JSON (default: stdout)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

/// One unit of work: a single device instance
#[derive(Debug, Clone)]
enum Input {
    Capture(PathBuf),
    Drafts(PathBuf, FamilyKind),
}

impl Input {
    fn path(&self) -> &Path {
        match self {
            Input::Capture(path) | Input::Drafts(path, _) => path,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("Medical Device Log CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using decoder library v{}", medlog_decoder::VERSION);

    let config = merge_args(load_app_config(args.config.as_deref())?, &args);
    config.validate()?;

    let inputs = collect_inputs(&config)?;
    if inputs.is_empty() {
        println!("Medical Device Log CLI - No input specified");
        println!("\nQuick Start:");
        println!("  medlog-cli --capture meter.bin");
        println!("  medlog-cli --drafts pump.json --family tandem");
        println!("\nUse --help for more options");
        return Ok(());
    }

    if let Some(dir) = &config.output.output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory: {:?}", dir))?;
    }

    let reports: Vec<InputReport> = inputs
        .par_iter()
        .map(|input| {
            let result = process_input(input, &config.decoder).and_then(|outcome| {
                let mut uploader = JsonUploader::new(config.output.output_dir.clone(), config.output.pretty);
                outcome.upload(&mut uploader)?;
                Ok(outcome)
            });
            if let Err(e) = &result {
                log::error!("{:?}: {:#}", input.path(), e);
            }
            InputReport {
                path: input.path().to_path_buf(),
                result: result.map_err(|e| format!("{:#}", e)),
            }
        })
        .collect();

    if config.output.summary && !args.quiet {
        eprint!("{}", report::render_summary(&reports));
    }

    let failed = reports.iter().filter(|report| report.result.is_err()).count();
    if failed > 0 {
        anyhow::bail!("{} of {} inputs failed", failed, reports.len());
    }
    Ok(())
}

fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)
        }
        None => Ok(AppConfig::default()),
    }
}

/// Command-line inputs add to the config file; flags override its settings
fn merge_args(mut config: AppConfig, args: &Args) -> AppConfig {
    config.input.captures.extend(args.capture.iter().cloned());
    config.input.drafts.extend(args.drafts.iter().cloned());
    if args.family.is_some() {
        config.input.family = args.family;
    }
    if args.output.is_some() {
        config.output.output_dir = args.output.clone();
    }
    config
}

fn collect_inputs(config: &AppConfig) -> Result<Vec<Input>> {
    let mut inputs: Vec<Input> = config
        .input
        .captures
        .iter()
        .cloned()
        .map(Input::Capture)
        .collect();

    if !config.input.drafts.is_empty() {
        let family = config
            .input
            .family
            .context("Draft files need a device family (--family)")?;
        inputs.extend(
            config
                .input
                .drafts
                .iter()
                .cloned()
                .map(|path| Input::Drafts(path, family)),
        );
    }
    Ok(inputs)
}

fn process_input(input: &Input, decoder: &DecoderConfig) -> Result<SessionOutcome> {
    match input {
        Input::Capture(path) => {
            let transport = ReplayTransport::open(path)
                .with_context(|| format!("Failed to load capture: {:?}", path))?;
            let mut builder = GlucoseMeterBuilder::new(decoder);
            run_session(Arc::new(transport), decoder.clone(), &mut builder)
                .with_context(|| format!("Meter session failed: {:?}", path))
        }
        Input::Drafts(path, family) => process_drafts(path, *family, decoder),
    }
}

fn process_drafts(path: &Path, family: FamilyKind, decoder: &DecoderConfig) -> Result<SessionOutcome> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read draft file: {:?}", path))?;
    let drafts: Vec<DraftEvent> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse draft file: {:?}", path))?;
    log::info!("Loaded {} drafts from {:?}", drafts.len(), path);

    let events = match family {
        FamilyKind::Tandem => reconstruct_drafts(Tandem, decoder, drafts),
        FamilyKind::Medtronic => reconstruct_drafts(Medtronic, decoder, drafts),
    }
    .with_context(|| format!("Timeline reconstruction failed: {:?}", path))?;
    if events.is_empty() {
        return Err(medlog_decoder::DecoderError::NoRecords)
            .with_context(|| format!("No events in {:?}", path));
    }

    let device_id = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let metadata = SessionMetadata::for_events(device_id, family.to_string(), &events)?;
    Ok(SessionOutcome {
        metadata,
        events,
        stats: DecodeStats::default(),
    })
}

#[derive(Serialize)]
struct UploadDocument<'a> {
    metadata: &'a SessionMetadata,
    events: &'a [FinalEvent],
}

/// Writes uploads as JSON documents
///
/// With a directory, each upload lands in `<upload id>.json`, so uploading
/// the same data twice rewrites the same file.
struct JsonUploader {
    dir: Option<PathBuf>,
    pretty: bool,
}

impl JsonUploader {
    fn new(dir: Option<PathBuf>, pretty: bool) -> Self {
        Self { dir, pretty }
    }
}

impl Uploader for JsonUploader {
    fn upload(&mut self, events: &[FinalEvent], metadata: &SessionMetadata) -> Result<()> {
        let document = UploadDocument { metadata, events };
        let json = if self.pretty {
            serde_json::to_string_pretty(&document)?
        } else {
            serde_json::to_string(&document)?
        };

        match &self.dir {
            Some(dir) => {
                let path = dir.join(format!("{}.json", metadata.upload_id));
                fs::write(&path, json)
                    .with_context(|| format!("Failed to write output file: {:?}", path))?;
                log::info!("Wrote {} events to {:?}", events.len(), path);
            }
            None => println!("{}", json),
        }
        Ok(())
    }
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
