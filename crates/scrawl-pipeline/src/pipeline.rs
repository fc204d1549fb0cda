//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! ```rust
//! # use scrawl_pipeline::{Pipeline, PipelineOptions, PipelineError, RgbaImage};
//! # fn run(image: RgbaImage) -> Result<(), PipelineError> {
//! let options = PipelineOptions::default();
//! let assembled = Pipeline::new(image, None, options)?
//!     .downsample()
//!     .extract(None)?
//!     .normalize()
//!     .quantize()
//!     .segment()
//!     .trace()
//!     .assemble();
//!
//! println!("{}", assembled.svg());
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state
//! (or `Result` for fallible stages). Intermediates that later stages no
//! longer need are dropped as the pipeline advances, so memory held by a
//! stage is bounded by what the remaining stages read.

use std::time::Duration;

use crate::assemble::{Drawing, to_svg};
use crate::diagnostics::StageMetrics;
use crate::foreground::{Extraction, SegmentationModel, extract_foreground};
use crate::quantize::{QuantizeParams, Quantization, quantize};
use crate::segment::{ColorRegion, SegmentParams, Segmentation, segment};
use crate::tone::{ToneParams, normalize_tone};
use crate::trace::{TraceOutput, TraceParams, VectorPath, trace_regions};
use crate::types::{
    Dimensions, ExclusionMask, ExtractorKind, ForegroundMask, PaletteEntry, PipelineError,
    PipelineOptions, PipelineResult, ResultMetadata, RgbImage, RgbaImage,
};

// ───────────────────────── Stage 0: Received ─────────────────────────

/// Pipeline state after validating the request.
///
/// Call [`downsample`](Self::downsample) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .downsample() to continue"]
pub struct Received {
    options: PipelineOptions,
    image: RgbaImage,
    exclusion: Option<ExclusionMask>,
}

impl Received {
    /// The validated options.
    #[must_use]
    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// The image as received.
    #[must_use]
    pub const fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Shrink the image (and exclusion mask) to the working resolution.
    pub fn downsample(self) -> Downsampled {
        let original_size = Dimensions::of(&self.image);
        let (image, applied) = crate::downsample::downsample(
            self.image,
            self.options.working_resolution,
            self.options.downsample_filter,
        );
        let processed = Dimensions::of(&image);
        let exclusion = self
            .exclusion
            .map(|mask| crate::downsample::resize_exclusion(mask, processed));
        Downsampled {
            options: self.options,
            original_size,
            image,
            exclusion,
            applied,
        }
    }
}

// ───────────────────────── Stage 1: Downsampled ──────────────────────

/// Pipeline state after downsampling to working resolution.
///
/// Call [`extract`](Self::extract) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .extract() to continue"]
pub struct Downsampled {
    options: PipelineOptions,
    original_size: Dimensions,
    image: RgbaImage,
    exclusion: Option<ExclusionMask>,
    applied: bool,
}

impl Downsampled {
    /// The working-resolution image.
    #[must_use]
    pub const fn image(&self) -> &RgbaImage {
        &self.image
    }

    /// Whether downsampling was actually applied.
    #[must_use]
    pub const fn applied(&self) -> bool {
        self.applied
    }

    /// Metrics describing this stage.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Downsample {
            original_width: self.original_size.width,
            original_height: self.original_size.height,
            width: self.image.width(),
            height: self.image.height(),
            filter: self.options.downsample_filter.to_string(),
            applied: self.applied,
        }
    }

    /// Separate the drawing from the paper.
    ///
    /// `model` is consulted only when `use_learned_extractor` is set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyForeground`] when almost nothing
    /// of the image is foreground.
    pub fn extract(
        self,
        model: Option<&dyn SegmentationModel>,
    ) -> Result<Extracted, PipelineError> {
        let extraction =
            extract_foreground(&self.image, self.options.use_learned_extractor, model)?;
        Ok(Extracted {
            options: self.options,
            original_size: self.original_size,
            extraction,
            exclusion: self.exclusion,
        })
    }
}

// ───────────────────────── Stage 2: Extracted ────────────────────────

/// Pipeline state after foreground extraction.
///
/// Call [`normalize`](Self::normalize) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .normalize() to continue"]
pub struct Extracted {
    options: PipelineOptions,
    original_size: Dimensions,
    extraction: Extraction,
    exclusion: Option<ExclusionMask>,
}

impl Extracted {
    /// The foreground mask.
    #[must_use]
    pub const fn mask(&self) -> &ForegroundMask {
        &self.extraction.mask
    }

    /// The image with its background painted white.
    #[must_use]
    pub const fn image(&self) -> &RgbImage {
        &self.extraction.image
    }

    /// Which extractor produced the mask.
    #[must_use]
    pub const fn extractor(&self) -> ExtractorKind {
        self.extraction.extractor
    }

    /// Metrics describing this stage.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Extract {
            extractor: self.extraction.extractor,
            foreground_pixels: self.extraction.mask.count(),
            coverage: self.extraction.coverage(),
        }
    }

    /// Even out lighting and denoise inside the foreground.
    pub fn normalize(self) -> Normalized {
        let tone = ToneParams::default();
        let image = normalize_tone(&self.extraction.image, &self.extraction.mask, &tone);
        Normalized {
            options: self.options,
            original_size: self.original_size,
            extractor: self.extraction.extractor,
            mask: self.extraction.mask,
            image,
            exclusion: self.exclusion,
            tone,
        }
    }
}

// ───────────────────────── Stage 3: Normalized ───────────────────────

/// Pipeline state after tone normalization.
///
/// Call [`quantize`](Self::quantize) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .quantize() to continue"]
pub struct Normalized {
    options: PipelineOptions,
    original_size: Dimensions,
    extractor: ExtractorKind,
    mask: ForegroundMask,
    image: RgbImage,
    exclusion: Option<ExclusionMask>,
    tone: ToneParams,
}

impl Normalized {
    /// The normalized image (background white).
    #[must_use]
    pub const fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Metrics describing this stage.
    #[must_use]
    pub const fn metrics(&self) -> StageMetrics {
        StageMetrics::Normalize {
            clip_limit: self.tone.clip_limit,
            grid_size: self.tone.grid_size,
            radius: self.tone.radius,
        }
    }

    /// Reduce the foreground to a small palette.
    pub fn quantize(self) -> Quantized {
        let params = QuantizeParams::new(
            usize::from(self.options.color_count),
            self.options.min_color_coverage,
        );
        let quantization = quantize(&self.image, &self.mask, &params);
        Quantized {
            options: self.options,
            original_size: self.original_size,
            extractor: self.extractor,
            foreground_pixels: self.mask.count(),
            quantization,
            exclusion: self.exclusion,
        }
    }
}

// ───────────────────────── Stage 4: Quantized ────────────────────────

/// Pipeline state after color quantization.
///
/// Call [`segment`](Self::segment) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .segment() to continue"]
pub struct Quantized {
    options: PipelineOptions,
    original_size: Dimensions,
    extractor: ExtractorKind,
    foreground_pixels: u64,
    quantization: Quantization,
    exclusion: Option<ExclusionMask>,
}

impl Quantized {
    /// The palette, in descending coverage order.
    #[must_use]
    pub fn palette(&self) -> &[PaletteEntry] {
        &self.quantization.palette
    }

    /// The foreground repainted in palette colors.
    #[must_use]
    pub const fn flattened(&self) -> &RgbImage {
        &self.quantization.flattened
    }

    /// Metrics describing this stage.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        let stats = &self.quantization.stats;
        StageMetrics::Quantize {
            foreground_pixels: self.foreground_pixels,
            palette_size: self.quantization.palette.len(),
            distinct_bins: stats.distinct_bins,
            iterations: stats.iterations,
            merged: stats.merged,
            dissolved: stats.dissolved,
        }
    }

    /// Split each palette color into connected regions.
    pub fn segment(self) -> Segmented {
        let params = SegmentParams {
            min_artifact_size: self.options.min_artifact_size,
            preserve_style: self.options.preserve_style,
            turd_size: self.options.trace_smoothing,
        };
        let processed_size = Dimensions::of(&self.quantization.labels);
        let segmentation = segment(
            &self.quantization.labels,
            self.quantization.palette.len(),
            self.exclusion.as_ref(),
            &params,
        );
        Segmented {
            options: self.options,
            original_size: self.original_size,
            processed_size,
            extractor: self.extractor,
            palette: self.quantization.palette,
            segmentation,
        }
    }
}

// ───────────────────────── Stage 5: Segmented ────────────────────────

/// Pipeline state after region segmentation.
///
/// Call [`trace`](Self::trace) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .trace() to continue"]
pub struct Segmented {
    options: PipelineOptions,
    original_size: Dimensions,
    processed_size: Dimensions,
    extractor: ExtractorKind,
    palette: Vec<PaletteEntry>,
    segmentation: Segmentation,
}

impl Segmented {
    /// Surviving regions, grouped in palette order.
    #[must_use]
    pub fn regions(&self) -> &[ColorRegion] {
        &self.segmentation.regions
    }

    /// Metrics describing this stage.
    #[must_use]
    pub const fn metrics(&self) -> StageMetrics {
        StageMetrics::Segment {
            region_count: self.segmentation.regions.len(),
            dropped: self.segmentation.dropped,
            excluded_pixels: self.segmentation.excluded_pixels,
            smoothed: self.segmentation.smoothed,
        }
    }

    /// Trace every region into vector outlines.
    pub fn trace(self) -> Traced {
        let params = TraceParams::new(self.options.preserve_style, self.options.trace_smoothing);
        let output = trace_regions(&self.segmentation.regions, &self.palette, &params);
        Traced {
            options: self.options,
            original_size: self.original_size,
            processed_size: self.processed_size,
            extractor: self.extractor,
            palette: self.palette,
            output,
        }
    }
}

// ───────────────────────── Stage 6: Traced ───────────────────────────

/// Pipeline state after tracing.
///
/// Call [`assemble`](Self::assemble) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing; call .assemble() to continue"]
pub struct Traced {
    options: PipelineOptions,
    original_size: Dimensions,
    processed_size: Dimensions,
    extractor: ExtractorKind,
    palette: Vec<PaletteEntry>,
    output: TraceOutput,
}

impl Traced {
    /// The traced paths, one per region that produced outlines.
    #[must_use]
    pub fn paths(&self) -> &[VectorPath] {
        &self.output.paths
    }

    /// Metrics describing this stage.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Trace {
            path_count: self.output.paths.len(),
            subpath_count: self.output.subpath_count(),
            skipped: self.output.skipped,
        }
    }

    /// Build the SVG document.
    pub fn assemble(self) -> Assembled {
        let drawing = Drawing {
            palette: &self.palette,
            paths: &self.output.paths,
            original_size: self.original_size,
            processed_size: self.processed_size,
            style: self.options.style_label(),
            extractor: self.extractor,
            invert_fill: self.options.invert_fill,
        };
        let svg = to_svg(&drawing);
        let metadata = ResultMetadata {
            color_count: self.palette.len(),
            region_count: drawing.region_count(),
            subpath_count: drawing.subpath_count(),
            style: drawing.style,
            extractor: self.extractor,
        };
        Assembled {
            svg,
            palette: self.palette,
            original_size: self.original_size,
            processed_size: self.processed_size,
            metadata,
        }
    }
}

// ───────────────────────── Stage 7: Assembled ────────────────────────

/// Final pipeline state holding the SVG document.
///
/// Call [`into_result`](Self::into_result) to obtain the
/// [`PipelineResult`].
#[must_use = "call .into_result() to obtain the pipeline result"]
pub struct Assembled {
    svg: String,
    palette: Vec<PaletteEntry>,
    original_size: Dimensions,
    processed_size: Dimensions,
    metadata: ResultMetadata,
}

impl Assembled {
    /// The SVG document text.
    #[must_use]
    pub fn svg(&self) -> &str {
        &self.svg
    }

    /// Summary counts.
    #[must_use]
    pub const fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    /// Metrics describing this stage.
    #[must_use]
    pub fn metrics(&self) -> StageMetrics {
        StageMetrics::Assemble {
            svg_bytes: self.svg.len(),
            path_elements: self.svg.matches("<path").count(),
        }
    }

    /// Consume the final stage, recording the total elapsed time.
    #[must_use]
    pub fn into_result(self, elapsed: Duration) -> PipelineResult {
        PipelineResult {
            svg: self.svg,
            palette: self.palette,
            original_size: self.original_size,
            processed_size: self.processed_size,
            elapsed,
            metadata: self.metadata,
        }
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Entry point for the typed pipeline.
///
/// See the [module documentation](self) for an example.
pub struct Pipeline;

impl Pipeline {
    /// Validate a request and create the [`Received`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidOptions`] when an option is out
    /// of range and [`PipelineError::InvalidInput`] when the image is
    /// empty or the exclusion mask does not match the image size.
    pub fn new(
        image: RgbaImage,
        exclusion: Option<ExclusionMask>,
        options: PipelineOptions,
    ) -> Result<Received, PipelineError> {
        options.validate()?;
        let size = Dimensions::of(&image);
        if size.pixel_count() == 0 {
            return Err(PipelineError::InvalidInput(format!(
                "image has no pixels ({size})"
            )));
        }
        if let Some(mask) = &exclusion
            && mask.dimensions() != size
        {
            return Err(PipelineError::InvalidInput(format!(
                "exclusion mask is {} but the image is {size}",
                mask.dimensions(),
            )));
        }
        Ok(Received {
            options,
            image,
            exclusion,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::GrayImage;

    /// Red square on the left, blue square on the right, white paper.
    fn two_squares(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let in_band = y >= height / 4 && y < height * 3 / 4;
            if in_band && x >= width / 10 && x < width * 4 / 10 {
                image::Rgba([220, 30, 30, 255])
            } else if in_band && x >= width * 6 / 10 && x < width * 9 / 10 {
                image::Rgba([30, 40, 200, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        })
    }

    fn threshold_options() -> PipelineOptions {
        PipelineOptions {
            use_learned_extractor: false,
            color_count: 3,
            ..PipelineOptions::default()
        }
    }

    #[test]
    fn new_rejects_invalid_options() {
        let options = PipelineOptions {
            color_count: 9,
            ..PipelineOptions::default()
        };
        let result = Pipeline::new(two_squares(20, 20), None, options);
        assert!(matches!(result, Err(PipelineError::InvalidOptions(_))));
    }

    #[test]
    fn new_rejects_mismatched_exclusion_mask() {
        let mask = ExclusionMask::from_gray(GrayImage::new(10, 10));
        let result = Pipeline::new(two_squares(20, 20), Some(mask), threshold_options());
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn new_rejects_empty_image() {
        let result = Pipeline::new(RgbaImage::new(0, 0), None, threshold_options());
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn downsample_shrinks_image_and_mask() {
        let options = PipelineOptions {
            working_resolution: 50,
            ..threshold_options()
        };
        let mask = ExclusionMask::from_gray(GrayImage::new(200, 100));
        let downsampled = Pipeline::new(two_squares(200, 100), Some(mask), options)
            .unwrap()
            .downsample();
        assert!(downsampled.applied());
        assert_eq!(downsampled.image().dimensions(), (50, 25));
        assert_eq!(
            downsampled.exclusion.as_ref().unwrap().dimensions(),
            Dimensions::new(50, 25)
        );
    }

    #[test]
    fn small_image_is_not_downsampled() {
        let downsampled = Pipeline::new(two_squares(40, 40), None, threshold_options())
            .unwrap()
            .downsample();
        assert!(!downsampled.applied());
        assert!(matches!(
            downsampled.metrics(),
            StageMetrics::Downsample { applied: false, .. }
        ));
    }

    #[test]
    fn extracted_exposes_mask_and_white_background() {
        let extracted = Pipeline::new(two_squares(60, 40), None, threshold_options())
            .unwrap()
            .downsample()
            .extract(None)
            .unwrap();
        assert_eq!(extracted.extractor(), ExtractorKind::Threshold);
        assert!(extracted.mask().contains(10, 20));
        assert!(!extracted.mask().contains(0, 0));
        assert_eq!(extracted.image().get_pixel(0, 0).0, [255, 255, 255]);
    }

    #[test]
    fn blank_image_fails_extraction() {
        let white = RgbaImage::from_pixel(30, 30, image::Rgba([255, 255, 255, 255]));
        let result = Pipeline::new(white, None, threshold_options())
            .unwrap()
            .downsample()
            .extract(None);
        assert!(matches!(
            result,
            Err(PipelineError::EmptyForeground { .. })
        ));
    }

    #[test]
    fn quantized_palette_has_two_colors() {
        let quantized = Pipeline::new(two_squares(60, 40), None, threshold_options())
            .unwrap()
            .downsample()
            .extract(None)
            .unwrap()
            .normalize()
            .quantize();
        assert_eq!(quantized.palette().len(), 2);
        let total: f64 = quantized.palette().iter().map(|e| e.coverage).sum();
        assert!(total <= 100.0 + 1e-9);
    }

    #[test]
    fn full_chain_produces_one_path_per_color() {
        let assembled = Pipeline::new(two_squares(60, 40), None, threshold_options())
            .unwrap()
            .downsample()
            .extract(None)
            .unwrap()
            .normalize()
            .quantize()
            .segment()
            .trace()
            .assemble();
        assert_eq!(assembled.metadata().color_count, 2);
        assert_eq!(assembled.metadata().region_count, 2);
        assert_eq!(assembled.svg().matches("<path").count(), 2);

        let result = assembled.into_result(Duration::from_millis(5));
        assert_eq!(result.original_size, Dimensions::new(60, 40));
        assert_eq!(result.processed_size, Dimensions::new(60, 40));
        assert_eq!(result.elapsed, Duration::from_millis(5));
    }

    #[test]
    fn segmented_regions_follow_palette_order() {
        let segmented = Pipeline::new(two_squares(60, 40), None, threshold_options())
            .unwrap()
            .downsample()
            .extract(None)
            .unwrap()
            .normalize()
            .quantize()
            .segment();
        let indices: Vec<usize> = segmented.regions().iter().map(|r| r.palette_index).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }
}
