use crate::{
    batch::{BatchItem, BatchOptions, BatchOrchestrator},
    config::Config,
    engine::{Detector, PythonDetector},
    error::PackageError,
    package::{build_document_from_dir, ArchiveSink, FolderSink},
    processor::{decode, OutputEncoding},
    progress::LogProgress,
    region::RedactionMode,
    report::BatchReport,
    util::{ensure_dir, has_extension, now_rfc3339, scan_input_dir, UPLOAD_EXTENSIONS},
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use image::ImageFormat;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "batch-redact")]
#[command(about = "Find text regions in images and outline or blur them, in batches")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./batch-redact.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override policy.mode (annotate/blur).
    #[arg(long)]
    pub mode: Option<RedactionMode>,

    /// Override policy.confidence_threshold (0..=1).
    #[arg(long)]
    pub threshold: Option<f32>,

    /// Override global.max_parallel_items.
    #[arg(long)]
    pub jobs: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check the Python/EasyOCR environment.
    Doctor {},
    /// Print the regions detected in one image.
    Detect {
        #[arg(long)]
        input: PathBuf,
    },
    /// Process a folder of images and assemble the results into a PDF.
    Folder {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Where to write the PDF; defaults to `paths.pdf_filename` inside the output dir.
        #[arg(long)]
        pdf: Option<PathBuf>,
        #[arg(long)]
        no_pdf: bool,
    },
    /// Process the given images into a single zip archive.
    Archive {
        #[arg(long)]
        output: PathBuf,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
}

pub fn dispatch(args: Args) -> Result<()> {
    let mut cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    apply_overrides(&args, &mut cfg);
    cfg.validate()?;

    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;

    match &args.cmd {
        Command::Doctor {} => doctor(&cfg),
        Command::Detect { input } => detect(&cfg, input),
        Command::Folder {
            input_dir,
            output_dir,
            pdf,
            no_pdf,
        } => folder(
            &cfg,
            input_dir.as_deref(),
            output_dir.as_deref(),
            pdf.as_deref(),
            *no_pdf,
        ),
        Command::Archive { output, inputs } => archive(&cfg, output, inputs),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["batch-redact.toml", "batch-redact.example.toml"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

fn apply_overrides(args: &Args, cfg: &mut Config) {
    if let Some(mode) = args.mode {
        cfg.policy.mode = mode;
    }
    if let Some(t) = args.threshold {
        cfg.policy.confidence_threshold = t;
    }
    if let Some(jobs) = args.jobs {
        cfg.global.max_parallel_items = jobs.max(1);
    }
}

fn init_logging(
    args: &Args,
    cfg: &Config,
    file_path: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.paths.output_dir).join("batch-redact.log"))
}

fn batch_options(cfg: &Config, encoding: OutputEncoding) -> BatchOptions {
    BatchOptions {
        max_parallel_items: cfg.global.max_parallel_items.max(1),
        max_input_file_bytes: cfg.limits.max_input_file_bytes,
        deadline: match cfg.limits.batch_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        encoding,
        ..BatchOptions::default()
    }
}

fn start_detector(cfg: &Config) -> Result<Arc<PythonDetector>> {
    let detector = Arc::new(PythonDetector::new(cfg)?);
    // Items fall back individually if the engine never comes up; the batch
    // itself still runs.
    if let Err(err) = detector.warm_up() {
        warn!("detection worker failed to start: {err}");
    }
    Ok(detector)
}

fn doctor(cfg: &Config) -> Result<()> {
    let engine = PythonDetector::new(cfg)?;
    let diag = engine.doctor()?;
    println!("{}", serde_json::to_string_pretty(&diag)?);
    Ok(())
}

fn detect(cfg: &Config, input: &Path) -> Result<()> {
    let raw = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let image = decode(&raw).with_context(|| format!("decoding {}", input.display()))?;
    let engine = PythonDetector::new(cfg)?;
    let regions = engine
        .detect(&image)
        .with_context(|| format!("detecting text in {}", input.display()))?;
    let kept = regions
        .iter()
        .filter(|r| r.confidence >= cfg.policy.confidence_threshold)
        .count();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "input": input,
            "width": image.width(),
            "height": image.height(),
            "threshold": cfg.policy.confidence_threshold,
            "above_threshold": kept,
            "regions": regions,
        }))?
    );
    Ok(())
}

fn folder(
    cfg: &Config,
    input_dir: Option<&Path>,
    output_dir: Option<&Path>,
    pdf: Option<&Path>,
    no_pdf: bool,
) -> Result<()> {
    let input_dir = input_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.input_dir));
    let output_dir = output_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.output_dir));

    let files = scan_input_dir(&input_dir)?;
    info!(
        "folder mode: {} images in {} -> {} (mode={})",
        files.len(),
        input_dir.display(),
        output_dir.display(),
        cfg.policy.mode
    );
    ensure_dir(&output_dir)?;
    dump_effective_config(cfg, &output_dir)?;

    let mut report = if files.is_empty() {
        warn!("no images found in {}", input_dir.display());
        BatchReport::new(0)
    } else {
        let detector = start_detector(cfg)?;
        let orchestrator = BatchOrchestrator::new(
            detector,
            cfg.policy.clone(),
            batch_options(cfg, OutputEncoding::MatchName),
        );
        let mut sink = FolderSink::new(&output_dir)?;
        let items = files.into_iter().map(BatchItem::from_file).collect();
        orchestrator.run_into(items, &LogProgress, &mut sink)?
    };
    report.finish();

    std::fs::write(
        output_dir.join(&cfg.paths.report_filename),
        serde_json::to_string_pretty(&report)?,
    )?;

    let pdf_path = pdf
        .map(PathBuf::from)
        .unwrap_or_else(|| output_dir.join(&cfg.paths.pdf_filename));
    let document = if no_pdf {
        None
    } else {
        let doc = build_document_from_dir(&output_dir, &pdf_path)
            .with_context(|| format!("assembling {}", pdf_path.display()))?;
        Some(doc)
    };

    if cfg.global.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "finished": now_rfc3339(),
                "output_dir": output_dir,
                "summary": report.summary,
                "pdf": document.as_ref().map(|_| &pdf_path),
                "pdf_pages": document.as_ref().map(|d| d.pages.len()),
                "pdf_skipped": document.as_ref().map(|d| &d.skipped),
            }))?
        );
    }
    Ok(())
}

fn archive(cfg: &Config, output: &Path, inputs: &[PathBuf]) -> Result<()> {
    if inputs.is_empty() {
        return Err(PackageError::EmptyBatch.into());
    }
    for input in inputs {
        if !has_extension(input, UPLOAD_EXTENSIONS) {
            return Err(anyhow!(
                "unsupported upload type: {} (allowed: {})",
                input.display(),
                UPLOAD_EXTENSIONS.join(", ")
            ));
        }
    }

    let format = ImageFormat::from_extension(&cfg.archive.extension).unwrap_or(ImageFormat::Png);
    let detector = start_detector(cfg)?;
    let orchestrator = BatchOrchestrator::new(
        detector,
        cfg.policy.clone(),
        batch_options(cfg, OutputEncoding::Fixed(format)),
    );
    let items: Vec<BatchItem> = inputs.iter().cloned().map(BatchItem::from_file).collect();

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let partial = output.with_extension("zip.partial");
    let written = write_archive(cfg, &orchestrator, items, &partial);
    let report = match written {
        Ok(report) => report,
        Err(err) => {
            let _ = std::fs::remove_file(&partial);
            return Err(err);
        }
    };
    std::fs::rename(&partial, output)
        .with_context(|| format!("moving archive into place: {}", output.display()))?;
    info!("archive {} written ({} entries)", output.display(), report.items.len());

    if cfg.global.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "archive": output,
                "content_type": "application/zip",
                "report": report,
            }))?
        );
    }
    Ok(())
}

fn write_archive(
    cfg: &Config,
    orchestrator: &BatchOrchestrator,
    items: Vec<BatchItem>,
    path: &Path,
) -> Result<BatchReport> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create archive: {}", path.display()))?;
    let mut sink = ArchiveSink::new(BufWriter::new(file), &cfg.archive);
    let mut report = orchestrator.run_into(items, &LogProgress, &mut sink)?;
    let writer = sink.finish()?;
    writer
        .into_inner()
        .map_err(|e| anyhow!("flushing archive: {}", e.error()))?
        .sync_all()?;
    report.finish();
    Ok(report)
}

fn dump_effective_config(cfg: &Config, dir: &Path) -> Result<()> {
    if cfg.debug.dump_effective_config {
        let raw = toml::to_string(cfg).unwrap_or_default();
        std::fs::write(dir.join("effective-config.toml"), raw)?;
    }
    Ok(())
}
