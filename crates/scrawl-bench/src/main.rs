//! scrawl-bench: CLI tool for vectorizing drawings and inspecting the
//! pipeline.
//!
//! Runs the vectorization pipeline on a given image file with
//! configurable options, printing detailed per-stage diagnostics. Useful
//! for:
//!
//! - Tuning palette size, artifact size, and trace smoothing
//! - Comparing authentic and clean styles on the same drawing
//! - Measuring per-stage durations to identify bottlenecks
//! - Checking a trained segmentation model against the threshold
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin scrawl-bench -- [OPTIONS] <IMAGE_PATH>
//! ```
//!
//! Log verbosity is read from `SCRAWL_LOG`, then `RUST_LOG`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use scrawl_pipeline::diagnostics::{Clock, PipelineDiagnostics};
use scrawl_pipeline::{
    DownsampleFilter, ExclusionMask, HistogramModel, PipelineOptions, PipelineResult, RgbaImage,
};

/// Environment variable consulted before `RUST_LOG`.
const ENV_LOG: &str = "SCRAWL_LOG";

/// Vectorize a drawing and report per-stage diagnostics.
///
/// Runs the pipeline on a given image with configurable options and
/// prints per-stage timing and count diagnostics.
#[derive(Parser)]
#[command(name = "scrawl-bench", version)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Path to the input image (PNG, JPEG, BMP, WebP).
    image_path: PathBuf,

    /// Exclusion mask image painted with a brush; pixels with alpha
    /// above 50 (or red above 50 when there is no alpha) are removed
    /// from every region after a small dilation.
    #[arg(long)]
    exclusion_mask: Option<PathBuf>,

    /// Maximum number of palette colors (3-7).
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_COLOR_COUNT, value_parser = clap::value_parser!(u8).range(3..=7))]
    colors: u8,

    /// Smooth region boundaries instead of keeping hand-drawn irregularity.
    #[arg(long)]
    no_preserve_style: bool,

    /// Skip the learned segmentation model and use the lightness threshold.
    #[arg(long)]
    no_learned: bool,

    /// Fill each path with the complement of its palette color.
    #[arg(long)]
    invert_fill: bool,

    /// Regions with fewer pixels are discarded.
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_MIN_ARTIFACT_SIZE)]
    min_artifact_size: u32,

    /// Traced outlines with this area or less are dropped.
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_TRACE_SMOOTHING)]
    trace_smoothing: f64,

    /// Working resolution (max dimension in pixels after downsampling).
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_WORKING_RESOLUTION, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    working_resolution: u32,

    /// Downsample filter (nearest, triangle, catmull-rom, gaussian, lanczos3).
    #[arg(long, value_enum, default_value_t = CLI_DEFAULT_FILTER)]
    downsample_filter: Filter,

    /// Palette colors below this share of the foreground (percent) are
    /// folded into their nearest neighbour.
    #[arg(long, default_value_t = PipelineOptions::DEFAULT_MIN_COLOR_COVERAGE)]
    min_color_coverage: f64,

    /// Histogram segmentation model (JSON) to install before running.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Write SVG output to file.
    #[arg(long)]
    svg: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full pipeline options as a JSON string.
    ///
    /// When provided, all other option flags are ignored. The JSON uses
    /// the camelCase `PipelineOptions` keys; missing keys take their
    /// defaults.
    #[arg(long)]
    config_json: Option<String>,

    /// Run once under this deadline (milliseconds) instead of collecting
    /// diagnostics.
    #[arg(long)]
    timeout_ms: Option<u64>,
}

/// Downsample resampling filter selection.
#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    /// Disabled: skip downsampling regardless of image size.
    Disabled,
    /// Nearest-neighbor (fastest, blocky).
    Nearest,
    /// Bilinear interpolation (fast, decent quality).
    Triangle,
    /// Bicubic Catmull-Rom (moderate, good quality).
    CatmullRom,
    /// Gaussian (moderate, smooth).
    Gaussian,
    /// Lanczos with 3 lobes (slowest, sharpest).
    Lanczos3,
}

/// Maps a [`DownsampleFilter`] to the local CLI [`Filter`] enum.
const fn filter_from_pipeline(f: DownsampleFilter) -> Filter {
    match f {
        DownsampleFilter::Disabled => Filter::Disabled,
        DownsampleFilter::Nearest => Filter::Nearest,
        DownsampleFilter::Triangle => Filter::Triangle,
        DownsampleFilter::CatmullRom => Filter::CatmullRom,
        DownsampleFilter::Gaussian => Filter::Gaussian,
        DownsampleFilter::Lanczos3 => Filter::Lanczos3,
    }
}

const fn filter_to_pipeline(f: Filter) -> DownsampleFilter {
    match f {
        Filter::Disabled => DownsampleFilter::Disabled,
        Filter::Nearest => DownsampleFilter::Nearest,
        Filter::Triangle => DownsampleFilter::Triangle,
        Filter::CatmullRom => DownsampleFilter::CatmullRom,
        Filter::Gaussian => DownsampleFilter::Gaussian,
        Filter::Lanczos3 => DownsampleFilter::Lanczos3,
    }
}

/// The CLI default filter, derived from
/// [`PipelineOptions::DEFAULT_DOWNSAMPLE_FILTER`] so the two cannot
/// silently diverge.
const CLI_DEFAULT_FILTER: Filter = filter_from_pipeline(PipelineOptions::DEFAULT_DOWNSAMPLE_FILTER);

/// Build [`PipelineOptions`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual option flags are ignored.
fn options_from_cli(cli: &Cli) -> Result<PipelineOptions, String> {
    let options = if let Some(ref json) = cli.config_json {
        serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"))?
    } else {
        PipelineOptions {
            color_count: cli.colors,
            preserve_style: !cli.no_preserve_style,
            use_learned_extractor: !cli.no_learned,
            invert_fill: cli.invert_fill,
            min_artifact_size: cli.min_artifact_size,
            trace_smoothing: cli.trace_smoothing,
            working_resolution: cli.working_resolution,
            downsample_filter: filter_to_pipeline(cli.downsample_filter),
            min_color_coverage: cli.min_color_coverage,
        }
    };
    options.validate().map_err(|e| e.to_string())?;
    Ok(options)
}

fn init_logging() {
    let filter = std::env::var(ENV_LOG)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn read_file(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("Error reading {}: {e}", path.display()))
}

fn load_model(path: &Path) -> Result<(), String> {
    let bytes = read_file(path)?;
    let model = HistogramModel::from_json(&bytes)
        .map_err(|e| format!("Error loading model {}: {e}", path.display()))?;
    scrawl_pipeline::install_shared_model(Arc::new(model)).map_err(|e| e.to_string())
}

fn load_inputs(cli: &Cli) -> Result<(RgbaImage, Option<ExclusionMask>), String> {
    let image_bytes = read_file(&cli.image_path)?;
    eprintln!(
        "Image: {} ({} bytes)",
        cli.image_path.display(),
        image_bytes.len(),
    );
    let image = scrawl_pipeline::decode::decode_image(&image_bytes).map_err(|e| e.to_string())?;
    let exclusion = match cli.exclusion_mask {
        Some(ref path) => {
            let bytes = read_file(path)?;
            Some(
                scrawl_pipeline::decode::decode_exclusion_mask(&bytes)
                    .map_err(|e| format!("Error decoding {}: {e}", path.display()))?,
            )
        }
        None => None,
    };
    Ok((image, exclusion))
}

fn write_svg(path: &Path, result: &PipelineResult) {
    match std::fs::write(path, &result.svg) {
        Ok(()) => {
            eprintln!(
                "SVG written to {} ({} bytes)",
                path.display(),
                result.svg.len(),
            );
        }
        Err(e) => {
            eprintln!("Error writing SVG to {}: {e}", path.display());
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let options = match options_from_cli(&cli) {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(ref path) = cli.model
        && let Err(msg) = load_model(path)
    {
        eprintln!("{msg}");
        return ExitCode::FAILURE;
    }

    let (image, exclusion) = match load_inputs(&cli) {
        Ok(inputs) => inputs,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("Options: {options:#?}");

    if let Some(ms) = cli.timeout_ms {
        return run_with_deadline(&cli, image, exclusion, options, Duration::from_millis(ms));
    }

    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let model = scrawl_pipeline::shared_model();
    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match scrawl_pipeline::diagnostics::process_with_diagnostics(
            image.clone(),
            exclusion.clone(),
            options.clone(),
            model.as_deref(),
            &StdClock,
        ) {
            Ok((result, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                }

                // Write SVG on the first run only.
                if run == 0
                    && let Some(ref svg_path) = cli.svg
                {
                    write_svg(svg_path, &result);
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    // Print summary when multiple runs.
    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// Run a single invocation under `deadline` and print its metadata.
fn run_with_deadline(
    cli: &Cli,
    image: RgbaImage,
    exclusion: Option<ExclusionMask>,
    options: PipelineOptions,
    deadline: Duration,
) -> ExitCode {
    let model = scrawl_pipeline::shared_model();
    match scrawl_pipeline::process_with_deadline(image, exclusion, options, model, deadline) {
        Ok(result) => {
            let summary = serde_json::json!({
                "metadata": result.metadata,
                "palette": result.palette,
                "originalSize": result.original_size,
                "processedSize": result.processed_size,
                "elapsedMs": result.elapsed.as_secs_f64() * 1000.0,
            });
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing result: {e}");
                    return ExitCode::FAILURE;
                }
            }
            if let Some(ref svg_path) = cli.svg {
                write_svg(svg_path, &result);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[PipelineDiagnostics]) {
    debug_assert!(!all_diagnostics.is_empty(), "no diagnostics to summarize");

    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    let Some(first) = all_diagnostics.first() else {
        println!("Warning: no diagnostics to summarize");
        return;
    };

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    // Per-stage means.
    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_count = first.stages().len();
    for index in 0..stage_count {
        let name = first.stages()[index].0;
        let total: f64 = all_diagnostics
            .iter()
            .map(|d| d.stages()[index].1.duration.as_secs_f64() * 1000.0)
            .sum();
        let stage_mean = total / all_diagnostics.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
