//! Foreground extraction: separate the drawing from the paper.
//!
//! Two interchangeable [`ForegroundExtractor`]s exist:
//!
//! - [`LearnedExtractor`] asks a [`SegmentationModel`] for a per-pixel
//!   foreground alpha.
//! - [`ThresholdExtractor`] thresholds CIE L* lightness and cleans the
//!   result with a morphological close followed by an open.
//!
//! [`extract_foreground`] tries the learned path when requested and
//! degrades to the threshold once, with a warning, if the model is
//! missing or fails. The extractor that actually ran is reported so the
//! caller can tell the two apart.
//!
//! Fully transparent pixels are always background.

use std::sync::{Arc, OnceLock};

use image::buffer::ConvertBuffer;
use imageproc::distance_transform::Norm;
use serde::{Deserialize, Serialize};

use crate::color;
use crate::types::{
    Color, Dimensions, ExtractorKind, ForegroundMask, GrayImage, PipelineError, RgbImage,
    RgbaImage,
};

/// Foreground below this share of the image counts as an empty drawing.
pub const MIN_FOREGROUND_FRACTION: f64 = 0.001;

/// Pixels with alpha below this are treated as background.
const MIN_OPAQUE_ALPHA: u8 = 128;

/// Errors raised by a segmentation model.
///
/// None of these end an invocation: [`extract_foreground`] logs them
/// and falls back to the threshold extractor.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The model could not be loaded or is not installed.
    #[error("segmentation model unavailable: {0}")]
    Unavailable(String),

    /// The model ran but produced no usable prediction.
    #[error("segmentation model failed: {0}")]
    Inference(String),

    /// Training data was unusable.
    #[error("cannot fit segmentation model: {0}")]
    Training(String),

    /// A shared model was already installed for this process.
    #[error("a shared segmentation model is already installed")]
    AlreadyInstalled,
}

/// A learned background-segmentation model.
///
/// Implementations are read-only after construction and may be shared
/// across threads.
pub trait SegmentationModel: Send + Sync {
    /// Short identifier used in log messages.
    fn name(&self) -> &str;

    /// Predict a per-pixel foreground alpha (`0` = background,
    /// `255` = drawing) with the same dimensions as `image`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Inference`] when no prediction can be made.
    fn predict_alpha(&self, image: &RgbaImage) -> Result<GrayImage, ModelError>;
}

/// Produces a binary foreground mask from an RGBA image.
pub trait ForegroundExtractor {
    /// Which extractor this is.
    fn kind(&self) -> ExtractorKind;

    /// Compute the cleaned foreground mask.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelError`] when the underlying model fails.
    fn extract_mask(&self, image: &RgbaImage) -> Result<ForegroundMask, ModelError>;
}

/// Deterministic lightness-threshold extractor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExtractor {
    /// Pixels darker than this L* (0-100) are ink.
    pub lightness_threshold: f32,
    /// Chebyshev radius of the close/open structuring element.
    pub cleanup_radius: u8,
}

impl ThresholdExtractor {
    /// 240/255 of full lightness.
    pub const DEFAULT_LIGHTNESS_THRESHOLD: f32 = 94.0;

    /// Compute the cleaned foreground mask. Never fails.
    #[must_use]
    pub fn mask(&self, image: &RgbaImage) -> ForegroundMask {
        let rgb: RgbImage = image.convert();
        let labs = color::image_to_labs(&rgb);
        let raw = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let idx = y as usize * image.width() as usize + x as usize;
            let opaque = image.get_pixel(x, y).0[3] >= MIN_OPAQUE_ALPHA;
            let ink = labs.get(idx).is_some_and(|lab| lab.l < self.lightness_threshold);
            image::Luma([if opaque && ink { 255 } else { 0 }])
        });
        cleanup(&raw, self.cleanup_radius)
    }
}

impl Default for ThresholdExtractor {
    fn default() -> Self {
        Self {
            lightness_threshold: Self::DEFAULT_LIGHTNESS_THRESHOLD,
            cleanup_radius: 1,
        }
    }
}

impl ForegroundExtractor for ThresholdExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Threshold
    }

    fn extract_mask(&self, image: &RgbaImage) -> Result<ForegroundMask, ModelError> {
        Ok(self.mask(image))
    }
}

/// Extractor backed by a [`SegmentationModel`].
pub struct LearnedExtractor<'a> {
    model: &'a dyn SegmentationModel,
    cleanup_radius: u8,
}

impl<'a> LearnedExtractor<'a> {
    /// Wrap a model.
    #[must_use]
    pub fn new(model: &'a dyn SegmentationModel) -> Self {
        Self {
            model,
            cleanup_radius: 1,
        }
    }
}

impl ForegroundExtractor for LearnedExtractor<'_> {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Learned
    }

    fn extract_mask(&self, image: &RgbaImage) -> Result<ForegroundMask, ModelError> {
        let alpha = self.model.predict_alpha(image)?;
        if alpha.dimensions() != image.dimensions() {
            return Err(ModelError::Inference(format!(
                "{} predicted a {}x{} mask for a {}x{} image",
                self.model.name(),
                alpha.width(),
                alpha.height(),
                image.width(),
                image.height(),
            )));
        }
        let raw = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let opaque = image.get_pixel(x, y).0[3] >= MIN_OPAQUE_ALPHA;
            let ink = alpha.get_pixel(x, y).0[0] > 128;
            image::Luma([if opaque && ink { 255 } else { 0 }])
        });
        Ok(cleanup(&raw, self.cleanup_radius))
    }
}

/// Close (fill pinholes) then open (remove speckle).
fn cleanup(mask: &GrayImage, radius: u8) -> ForegroundMask {
    if radius == 0 {
        return ForegroundMask::from_gray(mask.clone());
    }
    let closed = imageproc::morphology::close(mask, Norm::LInf, radius);
    ForegroundMask::from_gray(imageproc::morphology::open(&closed, Norm::LInf, radius))
}

/// Output of the extraction stage.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// The image with every background pixel set to white.
    pub image: RgbImage,
    /// Binary foreground mask, same size as `image`.
    pub mask: ForegroundMask,
    /// Extractor that produced `mask`.
    pub extractor: ExtractorKind,
}

impl Extraction {
    /// Foreground share of the image, in percent.
    #[must_use]
    pub fn coverage(&self) -> f64 {
        mask_coverage(&self.mask)
    }
}

#[allow(clippy::cast_precision_loss)]
fn mask_coverage(mask: &ForegroundMask) -> f64 {
    let total = mask.dimensions().pixel_count();
    if total == 0 {
        return 0.0;
    }
    mask.count() as f64 / total as f64 * 100.0
}

/// Run foreground extraction.
///
/// When `use_learned` is set and `model` is present, the learned
/// extractor runs first. A model failure, a missing model, or a
/// prediction with no usable foreground is logged and the threshold
/// extractor runs instead.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyForeground`] when the mask covers less
/// than [`MIN_FOREGROUND_FRACTION`] of the image.
pub fn extract_foreground(
    image: &RgbaImage,
    use_learned: bool,
    model: Option<&dyn SegmentationModel>,
) -> Result<Extraction, PipelineError> {
    let threshold = ThresholdExtractor::default();
    let min_coverage = MIN_FOREGROUND_FRACTION * 100.0;
    let learned = match (use_learned, model) {
        (true, Some(model)) => match LearnedExtractor::new(model).extract_mask(image) {
            Ok(mask) if mask_coverage(&mask) >= min_coverage => Some(mask),
            Ok(mask) => {
                tracing::warn!(
                    model = model.name(),
                    coverage = mask_coverage(&mask),
                    "learned extractor found no foreground, using lightness threshold"
                );
                None
            }
            Err(e) => {
                tracing::warn!(model = model.name(), error = %e, "learned extractor failed, using lightness threshold");
                None
            }
        },
        (true, None) => {
            tracing::warn!("no segmentation model installed, using lightness threshold");
            None
        }
        (false, _) => None,
    };
    let (mask, extractor) = match learned {
        Some(mask) => (mask, ExtractorKind::Learned),
        None => (threshold.mask(image), threshold.kind()),
    };

    let extraction = Extraction {
        image: restrict_to_foreground(image, &mask),
        mask,
        extractor,
    };
    let coverage = extraction.coverage();
    if coverage < min_coverage {
        return Err(PipelineError::EmptyForeground { coverage });
    }
    tracing::debug!(%extractor, coverage, "foreground extracted");
    Ok(extraction)
}

/// Copy foreground RGB values; paint everything else white.
fn restrict_to_foreground(image: &RgbaImage, mask: &ForegroundMask) -> RgbImage {
    let white = image::Rgb(Color::WHITE.to_array());
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        if mask.contains(x, y) {
            let [r, g, b, _] = image.get_pixel(x, y).0;
            image::Rgb([r, g, b])
        } else {
            white
        }
    })
}

// ───────────────────────── Histogram model ──────────────────────────

/// Color-histogram segmentation model.
///
/// Quantizes RGB to `bits` bits per channel and stores, per bin, the
/// probability that a pixel of that color belongs to the drawing.
/// Trained with [`fit`](Self::fit) on labelled images and stored as
/// JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramModel {
    bits: u8,
    probabilities: Vec<f32>,
}

impl HistogramModel {
    /// Bits per channel used by [`fit`](Self::fit) callers that have no
    /// preference.
    pub const DEFAULT_BITS: u8 = 4;

    /// Largest supported bits per channel.
    pub const MAX_BITS: u8 = 6;

    /// Learn per-color foreground probabilities from labelled images.
    ///
    /// Colors never seen during training predict background.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Training`] for an unsupported `bits`, a
    /// mask whose size differs from its image, or no usable samples.
    pub fn fit(samples: &[(&RgbaImage, &ForegroundMask)], bits: u8) -> Result<Self, ModelError> {
        if !(1..=Self::MAX_BITS).contains(&bits) {
            return Err(ModelError::Training(format!(
                "bits per channel must be between 1 and {}, got {bits}",
                Self::MAX_BITS,
            )));
        }
        let bins = 1usize << (3 * u32::from(bits));
        let mut foreground = vec![0u64; bins];
        let mut total = vec![0u64; bins];
        for (image, mask) in samples {
            if Dimensions::of(*image) != mask.dimensions() {
                return Err(ModelError::Training(format!(
                    "mask is {} but image is {}",
                    mask.dimensions(),
                    Dimensions::of(*image),
                )));
            }
            for (x, y, pixel) in image.enumerate_pixels() {
                if pixel.0[3] < MIN_OPAQUE_ALPHA {
                    continue;
                }
                let bin = bin_index(bits, [pixel.0[0], pixel.0[1], pixel.0[2]]);
                total[bin] += 1;
                foreground[bin] += u64::from(mask.contains(x, y));
            }
        }
        if total.iter().all(|&n| n == 0) {
            return Err(ModelError::Training(
                "no opaque pixels in the training set".to_string(),
            ));
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let probabilities = foreground
            .iter()
            .zip(&total)
            .map(|(&fg, &n)| if n == 0 { 0.0 } else { (fg as f64 / n as f64) as f32 })
            .collect();
        Ok(Self {
            bits,
            probabilities,
        })
    }

    /// Load a model from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Unavailable`] for malformed JSON or an
    /// inconsistent table.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let model: Self = serde_json::from_slice(bytes)
            .map_err(|e| ModelError::Unavailable(format!("invalid model file: {e}")))?;
        if !(1..=Self::MAX_BITS).contains(&model.bits) {
            return Err(ModelError::Unavailable(format!(
                "unsupported bits per channel: {}",
                model.bits
            )));
        }
        let expected = 1usize << (3 * u32::from(model.bits));
        if model.probabilities.len() != expected {
            return Err(ModelError::Unavailable(format!(
                "expected {expected} probabilities, found {}",
                model.probabilities.len(),
            )));
        }
        if model
            .probabilities
            .iter()
            .any(|p| !p.is_finite() || !(0.0..=1.0).contains(p))
        {
            return Err(ModelError::Unavailable(
                "probabilities must lie in [0, 1]".to_string(),
            ));
        }
        Ok(model)
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Unavailable`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ModelError> {
        serde_json::to_string(self).map_err(|e| ModelError::Unavailable(e.to_string()))
    }
}

impl SegmentationModel for HistogramModel {
    fn name(&self) -> &str {
        "histogram"
    }

    fn predict_alpha(&self, image: &RgbaImage) -> Result<GrayImage, ModelError> {
        Ok(GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let [r, g, b, a] = image.get_pixel(x, y).0;
            if a < MIN_OPAQUE_ALPHA {
                return image::Luma([0]);
            }
            let p = self
                .probabilities
                .get(bin_index(self.bits, [r, g, b]))
                .copied()
                .unwrap_or(0.0);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let alpha = (p * 255.0).round().clamp(0.0, 255.0) as u8;
            image::Luma([alpha])
        }))
    }
}

fn bin_index(bits: u8, [r, g, b]: [u8; 3]) -> usize {
    let shift = 8 - bits;
    let q = |c: u8| usize::from(c >> shift);
    (q(r) << (2 * bits)) | (q(g) << bits) | q(b)
}

// ───────────────────────── Shared model ──────────────────────────

static SHARED_MODEL: OnceLock<Arc<dyn SegmentationModel>> = OnceLock::new();

/// Install the process-wide segmentation model.
///
/// The model can be installed once; later invocations of
/// [`crate::process`] read it without locking.
///
/// # Errors
///
/// Returns [`ModelError::AlreadyInstalled`] on a second call.
pub fn install_shared_model(model: Arc<dyn SegmentationModel>) -> Result<(), ModelError> {
    SHARED_MODEL
        .set(model)
        .map_err(|_| ModelError::AlreadyInstalled)
}

/// The process-wide segmentation model, if one was installed.
#[must_use]
pub fn shared_model() -> Option<Arc<dyn SegmentationModel>> {
    SHARED_MODEL.get().cloned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// White page with a dark `size`-square at `(x0, y0)`.
    fn page_with_square(w: u32, h: u32, x0: u32, y0: u32, size: u32) -> RgbaImage {
        RgbaImage::from_fn(w, h, |x, y| {
            if (x0..x0 + size).contains(&x) && (y0..y0 + size).contains(&y) {
                image::Rgba([20, 30, 160, 255])
            } else {
                image::Rgba([255, 255, 255, 255])
            }
        })
    }

    struct FixedModel(GrayImage);

    impl SegmentationModel for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn predict_alpha(&self, _image: &RgbaImage) -> Result<GrayImage, ModelError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenModel;

    impl SegmentationModel for BrokenModel {
        fn name(&self) -> &str {
            "broken"
        }

        fn predict_alpha(&self, _image: &RgbaImage) -> Result<GrayImage, ModelError> {
            Err(ModelError::Inference("weights corrupted".to_string()))
        }
    }

    #[test]
    fn threshold_finds_dark_square() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let mask = ThresholdExtractor::default().mask(&img);
        assert_eq!(mask.count(), 144);
        assert!(mask.contains(10, 10));
        assert!(!mask.contains(9, 10));
    }

    #[test]
    fn threshold_removes_single_pixel_speckle() {
        let mut img = page_with_square(40, 40, 10, 10, 12);
        img.put_pixel(35, 35, image::Rgba([0, 0, 0, 255]));
        let mask = ThresholdExtractor::default().mask(&img);
        assert!(!mask.contains(35, 35));
    }

    #[test]
    fn threshold_fills_pinhole() {
        let mut img = page_with_square(40, 40, 10, 10, 12);
        img.put_pixel(15, 15, image::Rgba([255, 255, 255, 255]));
        let mask = ThresholdExtractor::default().mask(&img);
        assert!(mask.contains(15, 15));
    }

    #[test]
    fn transparent_pixels_are_background() {
        let img = RgbaImage::from_pixel(20, 20, image::Rgba([0, 0, 0, 0]));
        let mask = ThresholdExtractor::default().mask(&img);
        assert_eq!(mask.count(), 0);
    }

    #[test]
    fn all_white_is_empty_foreground() {
        let img = RgbaImage::from_pixel(50, 50, image::Rgba([255, 255, 255, 255]));
        let result = extract_foreground(&img, false, None);
        assert!(matches!(result, Err(PipelineError::EmptyForeground { .. })));
    }

    #[test]
    fn background_is_painted_white() {
        let mut img = page_with_square(40, 40, 10, 10, 12);
        img.put_pixel(0, 0, image::Rgba([250, 250, 245, 255]));
        let extraction = extract_foreground(&img, false, None).unwrap();
        assert_eq!(extraction.image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(extraction.image.get_pixel(12, 12).0, [20, 30, 160]);
        assert_eq!(extraction.extractor, ExtractorKind::Threshold);
    }

    #[test]
    fn learned_model_is_used_when_available() {
        let img = page_with_square(40, 40, 10, 10, 12);
        // The model claims a different square than the threshold would.
        let alpha = GrayImage::from_fn(40, 40, |x, y| {
            image::Luma([if (20..30).contains(&x) && (20..30).contains(&y) {
                255
            } else {
                0
            }])
        });
        let model = FixedModel(alpha);
        let extraction = extract_foreground(&img, true, Some(&model)).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Learned);
        assert_eq!(extraction.mask.count(), 100);
        assert!(extraction.mask.contains(25, 25));
    }

    #[test]
    fn failing_model_falls_back_to_threshold() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let extraction = extract_foreground(&img, true, Some(&BrokenModel)).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Threshold);
        assert_eq!(extraction.mask.count(), 144);
    }

    #[test]
    fn wrong_sized_prediction_falls_back() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let model = FixedModel(GrayImage::new(10, 10));
        let extraction = extract_foreground(&img, true, Some(&model)).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Threshold);
    }

    #[test]
    fn empty_prediction_falls_back_to_threshold() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let model = FixedModel(GrayImage::new(40, 40));
        let extraction = extract_foreground(&img, true, Some(&model)).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Threshold);
        assert_eq!(extraction.mask.count(), 144);
    }

    #[test]
    fn empty_prediction_on_blank_page_is_empty_foreground() {
        let img = RgbaImage::from_pixel(40, 40, image::Rgba([255, 255, 255, 255]));
        let model = FixedModel(GrayImage::new(40, 40));
        let result = extract_foreground(&img, true, Some(&model));
        assert!(matches!(result, Err(PipelineError::EmptyForeground { .. })));
    }

    #[test]
    fn threshold_trait_path_matches_inherent_mask() {
        let img = page_with_square(40, 40, 5, 8, 9);
        let threshold = ThresholdExtractor::default();
        assert_eq!(threshold.extract_mask(&img).unwrap(), threshold.mask(&img));
        assert_eq!(threshold.kind(), ExtractorKind::Threshold);
    }

    #[test]
    fn missing_model_falls_back() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let extraction = extract_foreground(&img, true, None).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Threshold);
    }

    #[test]
    fn learned_flag_off_ignores_model() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let model = FixedModel(GrayImage::from_pixel(40, 40, image::Luma([255])));
        let extraction = extract_foreground(&img, false, Some(&model)).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Threshold);
    }

    #[test]
    fn histogram_model_learns_ink_colors() {
        let img = page_with_square(40, 40, 10, 10, 12);
        let truth = ThresholdExtractor::default().mask(&img);
        let model = HistogramModel::fit(&[(&img, &truth)], HistogramModel::DEFAULT_BITS).unwrap();
        let alpha = model.predict_alpha(&img).unwrap();
        assert_eq!(alpha.get_pixel(12, 12).0[0], 255);
        assert_eq!(alpha.get_pixel(0, 0).0[0], 0);

        let extraction = extract_foreground(&img, true, Some(&model)).unwrap();
        assert_eq!(extraction.extractor, ExtractorKind::Learned);
        assert_eq!(extraction.mask, truth);
    }

    #[test]
    fn histogram_model_json_round_trip() {
        let img = page_with_square(20, 20, 5, 5, 6);
        let truth = ThresholdExtractor::default().mask(&img);
        let model = HistogramModel::fit(&[(&img, &truth)], 3).unwrap();
        let json = model.to_json().unwrap();
        assert_eq!(HistogramModel::from_json(json.as_bytes()).unwrap(), model);
    }

    #[test]
    fn histogram_model_rejects_bad_files() {
        assert!(matches!(
            HistogramModel::from_json(b"not json"),
            Err(ModelError::Unavailable(_))
        ));
        assert!(matches!(
            HistogramModel::from_json(br#"{"bits": 2, "probabilities": [0.5]}"#),
            Err(ModelError::Unavailable(_))
        ));
    }

    #[test]
    fn histogram_fit_rejects_mismatched_mask() {
        let img = page_with_square(20, 20, 5, 5, 6);
        let mask = ForegroundMask::from_gray(GrayImage::new(10, 10));
        assert!(matches!(
            HistogramModel::fit(&[(&img, &mask)], 4),
            Err(ModelError::Training(_))
        ));
    }
}
