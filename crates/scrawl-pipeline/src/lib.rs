//! scrawl-pipeline: color-preserving vectorization of drawings (sans-IO).
//!
//! Converts a photo of a drawing into a layered SVG through:
//! downsample -> foreground extraction -> tone normalization ->
//! color quantization -> region segmentation -> tracing -> assembly.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! images or byte slices and returns structured data. Reading files,
//! loading models from disk, and printing live in `scrawl-bench`.
//!
//! The stages can also be driven one at a time through
//! [`Pipeline`](pipeline::Pipeline), or timed with
//! [`diagnostics::process_with_diagnostics`].

pub mod assemble;
pub mod boundary;
mod color;
pub mod decode;
pub mod diagnostics;
pub mod downsample;
pub mod foreground;
pub mod pipeline;
pub mod quantize;
pub mod segment;
pub mod simplify;
pub mod tone;
pub mod trace;
pub mod types;

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

pub use diagnostics::{Clock, PipelineDiagnostics, WebClock};
pub use downsample::DownsampleFilter;
pub use foreground::{
    HistogramModel, ModelError, SegmentationModel, install_shared_model, shared_model,
};
pub use pipeline::Pipeline;
pub use types::{
    Color, Dimensions, ExclusionMask, ExtractorKind, ForegroundMask, GrayImage, PaletteEntry,
    PipelineError, PipelineOptions, PipelineResult, Point, ResultMetadata, RgbImage, RgbaImage,
    StyleLabel,
};

/// Run the full pipeline with the process-wide segmentation model.
///
/// The model installed with [`install_shared_model`] is used when
/// `options.use_learned_extractor` is set; without one, extraction
/// falls back to the lightness threshold.
///
/// # Pipeline steps
///
/// 1. Downscale to `working_resolution` (image and exclusion mask)
/// 2. Foreground extraction (learned model or lightness threshold)
/// 3. Tone normalization (CLAHE on L*, bilateral denoise)
/// 4. Color quantization (k-means in CIELAB)
/// 5. Region segmentation (connected components per color)
/// 6. Tracing (Potrace-style curve fitting)
/// 7. SVG assembly (one path per color, descending coverage)
///
/// # Errors
///
/// Returns [`PipelineError::InvalidOptions`] for out-of-range options,
/// [`PipelineError::InvalidInput`] for an empty image or a mismatched
/// exclusion mask, and [`PipelineError::EmptyForeground`] when no
/// drawing is found.
pub fn process(
    image: &RgbaImage,
    exclusion: Option<&ExclusionMask>,
    options: &PipelineOptions,
) -> Result<PipelineResult, PipelineError> {
    let model = shared_model();
    process_with_model(
        image.clone(),
        exclusion.cloned(),
        options.clone(),
        model.as_deref(),
    )
}

/// Run the full pipeline with an explicit segmentation model.
///
/// # Errors
///
/// Same as [`process`].
pub fn process_with_model(
    image: RgbaImage,
    exclusion: Option<ExclusionMask>,
    options: PipelineOptions,
    model: Option<&dyn SegmentationModel>,
) -> Result<PipelineResult, PipelineError> {
    let clock = WebClock;
    let start = clock.now();
    let result = Pipeline::new(image, exclusion, options)?
        .downsample()
        .extract(model)?
        .normalize()
        .quantize()
        .segment()
        .trace()
        .assemble()
        .into_result(clock.elapsed(&start));
    log_summary(&result);
    Ok(result)
}

/// Decode image bytes (and optional exclusion-mask bytes), then run
/// [`process`].
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `image_bytes` is empty and
/// [`PipelineError::ImageDecode`] if either input cannot be decoded,
/// in addition to the errors of [`process`].
pub fn process_bytes(
    image_bytes: &[u8],
    exclusion_bytes: Option<&[u8]>,
    options: &PipelineOptions,
) -> Result<PipelineResult, PipelineError> {
    let image = decode::decode_image(image_bytes)?;
    let exclusion = exclusion_bytes
        .map(decode::decode_exclusion_mask)
        .transpose()?;
    let model = shared_model();
    process_with_model(image, exclusion, options.clone(), model.as_deref())
}

/// Run the pipeline on a worker thread, giving up after `deadline`.
///
/// On timeout the worker is abandoned: it runs to completion in the
/// background and its result is discarded.
///
/// # Errors
///
/// Returns [`PipelineError::Timeout`] if the deadline elapses first,
/// otherwise the errors of [`process`].
pub fn process_with_deadline(
    image: RgbaImage,
    exclusion: Option<ExclusionMask>,
    options: PipelineOptions,
    model: Option<Arc<dyn SegmentationModel>>,
    deadline: Duration,
) -> Result<PipelineResult, PipelineError> {
    let (tx, rx) = mpsc::sync_channel(1);
    thread::spawn(move || {
        let result = process_with_model(image, exclusion, options, model.as_deref());
        // The receiver is gone once the deadline has passed.
        let _ = tx.send(result);
    });
    rx.recv_timeout(deadline).unwrap_or_else(|_| {
        tracing::warn!(?deadline, "pipeline deadline exceeded");
        Err(PipelineError::Timeout(deadline))
    })
}

pub(crate) fn log_summary(result: &PipelineResult) {
    tracing::info!(
        original = %result.original_size,
        processed = %result.processed_size,
        colors = result.metadata.color_count,
        regions = result.metadata.region_count,
        subpaths = result.metadata.subpath_count,
        style = %result.metadata.style,
        extractor = %result.metadata.extractor,
        elapsed_ms = result.elapsed.as_secs_f64() * 1000.0,
        "drawing vectorized"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn blob_png(width: u32, height: u32) -> Vec<u8> {
        encode_png(&RgbaImage::from_fn(width, height, |x, y| {
            if (width / 4..width * 3 / 4).contains(&x) && (height / 4..height * 3 / 4).contains(&y)
            {
                image::Rgba([200, 40, 40, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        }))
    }

    fn in_circle(x: u32, y: u32) -> bool {
        let dx = i64::from(x) - 145;
        let dy = i64::from(y) - 60;
        dx * dx + dy * dy <= 25 * 25
    }

    fn encode_png(img: &RgbaImage) -> Vec<u8> {
        let mut buf = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buf);
        image::ImageEncoder::write_image(
            encoder,
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .unwrap();
        buf
    }

    fn threshold_options() -> PipelineOptions {
        PipelineOptions {
            use_learned_extractor: false,
            ..PipelineOptions::default()
        }
    }

    #[test]
    fn process_bytes_empty_input() {
        let result = process_bytes(&[], None, &PipelineOptions::default());
        assert!(matches!(result, Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn process_bytes_corrupt_input() {
        let result = process_bytes(&[0xFF, 0x00], None, &PipelineOptions::default());
        assert!(matches!(result, Err(PipelineError::ImageDecode(_))));
    }

    #[test]
    fn process_bytes_produces_svg() {
        let png = blob_png(40, 40);
        let result = process_bytes(&png, None, &threshold_options()).unwrap();
        assert!(result.svg.contains("viewBox=\"0 0 40 40\""));
        assert_eq!(result.palette.len(), 1);
        assert_eq!(result.metadata.region_count, 1);
        assert_eq!(result.metadata.extractor, ExtractorKind::Threshold);
    }

    #[test]
    fn process_bytes_rejects_mismatched_mask() {
        let png = blob_png(40, 40);
        let mask = blob_png(20, 20);
        let result = process_bytes(&png, Some(&mask), &threshold_options());
        assert!(matches!(result, Err(PipelineError::InvalidInput(_))));
    }

    #[test]
    fn red_brush_overlay_removes_painted_shape() {
        let drawing = encode_png(&RgbaImage::from_fn(200, 120, |x, y| {
            if (20..80).contains(&x) && (30..90).contains(&y) {
                image::Rgba([220, 30, 30, 255])
            } else if in_circle(x, y) {
                image::Rgba([30, 60, 200, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        }));
        // Translucent red strokes over the circle, transparent elsewhere.
        let overlay = encode_png(&RgbaImage::from_fn(200, 120, |x, y| {
            if in_circle(x, y) {
                image::Rgba([255, 0, 0, 160])
            } else {
                image::Rgba([0, 0, 0, 0])
            }
        }));

        let full = process_bytes(&drawing, None, &threshold_options()).unwrap();
        let masked = process_bytes(&drawing, Some(&overlay), &threshold_options()).unwrap();

        assert_eq!(full.metadata.region_count, 2);
        assert_eq!(masked.metadata.region_count, 1);
        assert_eq!(masked.svg.matches(" d=\"").count(), 1);
    }

    #[test]
    fn process_matches_process_with_model() {
        let image = decode::decode_image(&blob_png(40, 40)).unwrap();
        let a = process(&image, None, &threshold_options()).unwrap();
        let b = process_with_model(image, None, threshold_options(), None).unwrap();
        assert_eq!(a.svg, b.svg);
    }

    #[test]
    fn generous_deadline_returns_result() {
        let image = decode::decode_image(&blob_png(40, 40)).unwrap();
        let result = process_with_deadline(
            image,
            None,
            threshold_options(),
            None,
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(result.metadata.color_count, 1);
    }
}
