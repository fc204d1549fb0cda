//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! These diagnostics are permanent instrumentation intended for
//! parameter tuning on real drawings. [`process_with_diagnostics`]
//! collects them alongside the pipeline result.
//!
//! Duration measurements use [`std::time::Duration`]. Timestamps come
//! from a caller-supplied [`Clock`]; [`WebClock`] uses the `web-time`
//! crate, which maps to `performance.now()` on WASM and
//! `std::time::Instant` on native.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::foreground::SegmentationModel;
use crate::pipeline::Pipeline;
use crate::types::{
    ExclusionMask, ExtractorKind, PipelineError, PipelineOptions, PipelineResult, RgbaImage,
};

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Source of timestamps for stage timing.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] backed by [`web_time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WebClock;

impl Clock for WebClock {
    type Instant = web_time::Instant;

    fn now(&self) -> web_time::Instant {
        web_time::Instant::now()
    }

    fn elapsed(&self, since: &web_time::Instant) -> Duration {
        since.elapsed()
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDiagnostics {
    /// Stage 1: downsampling to working resolution.
    pub downsample: StageDiagnostics,
    /// Stage 2: foreground extraction.
    pub extract: StageDiagnostics,
    /// Stage 3: tone normalization.
    pub normalize: StageDiagnostics,
    /// Stage 4: color quantization.
    pub quantize: StageDiagnostics,
    /// Stage 5: region segmentation.
    pub segment: StageDiagnostics,
    /// Stage 6: path tracing.
    pub trace: StageDiagnostics,
    /// Stage 7: SVG assembly.
    pub assemble: StageDiagnostics,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: PipelineSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics (counts, sizes, etc.).
    pub metrics: StageMetrics,
}

/// Stage-specific metrics that vary by pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Downsampling metrics.
    Downsample {
        /// Width as received.
        original_width: u32,
        /// Height as received.
        original_height: u32,
        /// Working width.
        width: u32,
        /// Working height.
        height: u32,
        /// Resampling filter name.
        filter: String,
        /// Whether the image was actually resized.
        applied: bool,
    },
    /// Foreground extraction metrics.
    Extract {
        /// Extractor that produced the mask.
        extractor: ExtractorKind,
        /// Foreground pixel count.
        foreground_pixels: u64,
        /// Foreground share of the image, in percent.
        coverage: f64,
    },
    /// Tone normalization metrics.
    Normalize {
        /// CLAHE clip limit.
        clip_limit: f64,
        /// CLAHE tiles per axis.
        grid_size: u32,
        /// Bilateral window radius.
        radius: u32,
    },
    /// Color quantization metrics.
    Quantize {
        /// Foreground pixels clustered.
        foreground_pixels: u64,
        /// Final palette size.
        palette_size: usize,
        /// Distinct color bins in the foreground.
        distinct_bins: usize,
        /// Refinement iterations run.
        iterations: usize,
        /// Centers merged as near-duplicates.
        merged: usize,
        /// Centers dissolved for low coverage.
        dissolved: usize,
    },
    /// Region segmentation metrics.
    Segment {
        /// Surviving regions.
        region_count: usize,
        /// Components dropped as artifacts.
        dropped: usize,
        /// Foreground pixels removed by the exclusion mask.
        excluded_pixels: u64,
        /// Regions smoothed in clean mode.
        smoothed: usize,
    },
    /// Path tracing metrics.
    Trace {
        /// Regions that produced outlines.
        path_count: usize,
        /// Total subpaths.
        subpath_count: usize,
        /// Regions skipped as degenerate.
        skipped: usize,
    },
    /// SVG assembly metrics.
    Assemble {
        /// Document size in bytes.
        svg_bytes: usize,
        /// Number of `<path>` elements.
        path_elements: usize,
    },
}

/// High-level summary counts for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Width as received.
    pub original_width: u32,
    /// Height as received.
    pub original_height: u32,
    /// Working width.
    pub processed_width: u32,
    /// Working height.
    pub processed_height: u32,
    /// Palette size.
    pub color_count: usize,
    /// Regions traced into at least one subpath.
    pub region_count: usize,
    /// Total subpaths in the document.
    pub subpath_count: usize,
}

impl PipelineDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} -> {}x{}",
            self.summary.original_width,
            self.summary.original_height,
            self.summary.processed_width,
            self.summary.processed_height,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for (name, diag) in self.stages() {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Colors: {}  |  Regions: {}  |  Subpaths: {}",
            self.summary.color_count, self.summary.region_count, self.summary.subpath_count,
        ));

        lines.join("\n")
    }

    /// Stage names paired with their diagnostics, in pipeline order.
    #[must_use]
    pub fn stages(&self) -> [(&'static str, &StageDiagnostics); 7] {
        [
            ("Downsample", &self.downsample),
            ("Extract", &self.extract),
            ("Normalize", &self.normalize),
            ("Quantize", &self.quantize),
            ("Segment", &self.segment),
            ("Trace", &self.trace),
            ("Assemble", &self.assemble),
        ]
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Downsample {
            original_width,
            original_height,
            width,
            height,
            filter,
            applied,
        } => {
            if *applied {
                format!("{original_width}x{original_height} -> {width}x{height} ({filter})")
            } else {
                format!("{width}x{height} (unchanged)")
            }
        }
        StageMetrics::Extract {
            extractor,
            foreground_pixels,
            coverage,
        } => format!("{extractor} fg={foreground_pixels} ({coverage:.1}%)"),
        StageMetrics::Normalize {
            clip_limit,
            grid_size,
            radius,
        } => format!("clip={clip_limit:.1} grid={grid_size} r={radius}"),
        StageMetrics::Quantize {
            foreground_pixels,
            palette_size,
            distinct_bins,
            iterations,
            merged,
            dissolved,
        } => format!(
            "{foreground_pixels} px, {distinct_bins} bins -> {palette_size} colors ({iterations} iters, merged={merged} dissolved={dissolved})",
        ),
        StageMetrics::Segment {
            region_count,
            dropped,
            excluded_pixels,
            smoothed,
        } => format!(
            "{region_count} regions, dropped={dropped} excluded_px={excluded_pixels} smoothed={smoothed}",
        ),
        StageMetrics::Trace {
            path_count,
            subpath_count,
            skipped,
        } => format!("{path_count} paths, {subpath_count} subpaths, skipped={skipped}"),
        StageMetrics::Assemble {
            svg_bytes,
            path_elements,
        } => format!("{path_elements} <path> elements, {svg_bytes} bytes"),
    }
}

/// Run the pipeline, timing every stage with `clock`.
///
/// # Errors
///
/// Returns the same errors as [`crate::process_with_model`].
pub fn process_with_diagnostics<C: Clock>(
    image: RgbaImage,
    exclusion: Option<ExclusionMask>,
    options: PipelineOptions,
    model: Option<&dyn SegmentationModel>,
    clock: &C,
) -> Result<(PipelineResult, PipelineDiagnostics), PipelineError> {
    let start = clock.now();
    let received = Pipeline::new(image, exclusion, options)?;

    let t = clock.now();
    let downsampled = received.downsample();
    let downsample = stage(clock, &t, downsampled.metrics());

    let t = clock.now();
    let extracted = downsampled.extract(model)?;
    let extract = stage(clock, &t, extracted.metrics());

    let t = clock.now();
    let normalized = extracted.normalize();
    let normalize = stage(clock, &t, normalized.metrics());

    let t = clock.now();
    let quantized = normalized.quantize();
    let quantize = stage(clock, &t, quantized.metrics());

    let t = clock.now();
    let segmented = quantized.segment();
    let segment = stage(clock, &t, segmented.metrics());

    let t = clock.now();
    let traced = segmented.trace();
    let trace = stage(clock, &t, traced.metrics());

    let t = clock.now();
    let assembled = traced.assemble();
    let assemble = stage(clock, &t, assembled.metrics());

    let total_duration = clock.elapsed(&start);
    let result = assembled.into_result(total_duration);
    let summary = PipelineSummary {
        original_width: result.original_size.width,
        original_height: result.original_size.height,
        processed_width: result.processed_size.width,
        processed_height: result.processed_size.height,
        color_count: result.metadata.color_count,
        region_count: result.metadata.region_count,
        subpath_count: result.metadata.subpath_count,
    };
    crate::log_summary(&result);

    Ok((
        result,
        PipelineDiagnostics {
            downsample,
            extract,
            normalize,
            quantize,
            segment,
            trace,
            assemble,
            total_duration,
            summary,
        },
    ))
}

fn stage<C: Clock>(clock: &C, since: &C::Instant, metrics: StageMetrics) -> StageDiagnostics {
    StageDiagnostics {
        duration: clock.elapsed(since),
        metrics,
    }
}
