//! Shared types for the scrawl vectorization pipeline.

use std::fmt;
use std::time::Duration;

use imageproc::distance_transform::Norm;
use serde::{Deserialize, Serialize};

use crate::downsample::DownsampleFilter;

/// Re-export the raster types so downstream crates can hand images to
/// the pipeline without depending on `image` directly.
pub use image::{GrayImage, RgbImage, RgbaImage};

/// A 2D point in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// The point a fraction `t` of the way from `self` to `other`.
    #[must_use]
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self::new(
            t.mul_add(other.x - self.x, self.x),
            t.mul_add(other.y - self.y, self.y),
        )
    }

    /// Translate by an integer pixel offset.
    #[must_use]
    pub fn offset(self, dx: u32, dy: u32) -> Self {
        Self::new(self.x + f64::from(dx), self.y + f64::from(dy))
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create dimensions from a width and height.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of any `image` buffer.
    #[must_use]
    pub fn of<I: image::GenericImageView>(image: &I) -> Self {
        let (width, height) = image.dimensions();
        Self { width, height }
    }

    /// Total number of pixels.
    #[must_use]
    pub fn pixel_count(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An sRGB color with 8-bit channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

impl Color {
    /// Pure white, the constant background value.
    pub const WHITE: Self = Self::new(255, 255, 255);

    /// Create a color from its channels.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Create a color from an `[r, g, b]` array.
    #[must_use]
    pub const fn from_array([r, g, b]: [u8; 3]) -> Self {
        Self { r, g, b }
    }

    /// The channels as an `[r, g, b]` array.
    #[must_use]
    pub const fn to_array(self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// The photometric complement (`255 - c` per channel).
    #[must_use]
    pub const fn complement(self) -> Self {
        Self::new(255 - self.r, 255 - self.g, 255 - self.b)
    }

    /// Lowercase `#rrggbb` form.
    #[must_use]
    pub fn hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// One representative palette color and its share of the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteEntry {
    /// The palette color.
    pub color: Color,
    /// Foreground pixels remapped to this color.
    pub pixel_count: u64,
    /// `pixel_count / foreground_pixels * 100`.
    pub coverage: f64,
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left column (inclusive).
    pub x: u32,
    /// Top row (inclusive).
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl BoundingBox {
    /// Grow the box to include pixel `(x, y)`.
    #[must_use]
    pub const fn including(self, x: u32, y: u32) -> Self {
        let min_x = if x < self.x { x } else { self.x };
        let min_y = if y < self.y { y } else { self.y };
        let right = self.x + self.width;
        let bottom = self.y + self.height;
        let max_x = if x + 1 > right { x + 1 } else { right };
        let max_y = if y + 1 > bottom { y + 1 } else { bottom };
        Self {
            x: min_x,
            y: min_y,
            width: max_x - min_x,
            height: max_y - min_y,
        }
    }

    /// A one-pixel box at `(x, y)`.
    #[must_use]
    pub const fn pixel(x: u32, y: u32) -> Self {
        Self {
            x,
            y,
            width: 1,
            height: 1,
        }
    }
}

/// Binary mask marking the pixels that belong to the drawing.
///
/// Stored as a [`GrayImage`] holding only `0` and `255`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundMask(GrayImage);

impl ForegroundMask {
    /// Wrap a grayscale image, binarizing any non-zero value to `255`.
    #[must_use]
    pub fn from_gray(mut mask: GrayImage) -> Self {
        for p in mask.pixels_mut() {
            p.0[0] = if p.0[0] == 0 { 0 } else { 255 };
        }
        Self(mask)
    }

    /// Whether pixel `(x, y)` is foreground.
    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y).0[0] != 0
    }

    /// Number of foreground pixels.
    #[must_use]
    pub fn count(&self) -> u64 {
        count_set(&self.0)
    }

    /// Mask dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.0)
    }

    /// Borrow the underlying 0/255 image.
    #[must_use]
    pub const fn as_image(&self) -> &GrayImage {
        &self.0
    }
}

/// Caller-supplied mask of pixels to drop from every region.
///
/// Stored as a [`GrayImage`] holding only `0` and `255`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionMask(GrayImage);

impl ExclusionMask {
    /// Wrap a grayscale image; values at or above `128` are excluded.
    #[must_use]
    pub fn from_gray(mut mask: GrayImage) -> Self {
        for p in mask.pixels_mut() {
            p.0[0] = if p.0[0] >= 128 { 255 } else { 0 };
        }
        Self(mask)
    }

    /// Channel value above which a painted overlay pixel is excluded.
    pub const PAINT_THRESHOLD: u8 = 50;

    /// Build from a painted RGBA overlay: any pixel whose alpha exceeds
    /// [`Self::PAINT_THRESHOLD`] is excluded, whatever its color.
    #[must_use]
    pub fn from_rgba(overlay: &RgbaImage) -> Self {
        Self::from_channel(overlay, 3)
    }

    /// Build from an overlay without alpha: the red channel carries the
    /// brush strokes.
    #[must_use]
    pub fn from_rgb(overlay: &RgbImage) -> Self {
        Self::from_channel(overlay, 0)
    }

    fn from_channel<P>(overlay: &image::ImageBuffer<P, Vec<u8>>, channel: usize) -> Self
    where
        P: image::Pixel<Subpixel = u8>,
    {
        Self(GrayImage::from_fn(overlay.width(), overlay.height(), |x, y| {
            let value = overlay.get_pixel(x, y).channels()[channel];
            image::Luma([if value > Self::PAINT_THRESHOLD { 255 } else { 0 }])
        }))
    }

    /// Grow the excluded area by a 5x5 square, applied twice, so brush
    /// edges cover the anti-aliased rim of what they paint over.
    #[must_use]
    pub fn dilated(self) -> Self {
        let once = imageproc::morphology::dilate(&self.0, Norm::LInf, 2);
        Self(imageproc::morphology::dilate(&once, Norm::LInf, 2))
    }

    /// Whether pixel `(x, y)` is excluded.
    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.0.get_pixel(x, y).0[0] != 0
    }

    /// Number of excluded pixels.
    #[must_use]
    pub fn count(&self) -> u64 {
        count_set(&self.0)
    }

    /// Mask dimensions.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions::of(&self.0)
    }

    /// Borrow the underlying 0/255 image.
    #[must_use]
    pub const fn as_image(&self) -> &GrayImage {
        &self.0
    }
}

/// Count non-zero pixels in a binary mask.
pub(crate) fn count_set(mask: &GrayImage) -> u64 {
    mask.pixels().map(|p| u64::from(p.0[0] != 0)).sum()
}

/// Which foreground extractor produced the mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// A learned background-segmentation model.
    Learned,
    /// Lightness threshold plus morphological cleanup.
    Threshold,
}

impl fmt::Display for ExtractorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Learned => f.write_str("learned"),
            Self::Threshold => f.write_str("threshold"),
        }
    }
}

/// Style label reported in result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleLabel {
    /// `preserve_style = true`: irregular strokes kept.
    Authentic,
    /// `preserve_style = false`: smoothed boundaries.
    Clean,
}

impl StyleLabel {
    /// Label for the given `preserve_style` flag.
    #[must_use]
    pub const fn from_preserve_style(preserve_style: bool) -> Self {
        if preserve_style {
            Self::Authentic
        } else {
            Self::Clean
        }
    }
}

impl fmt::Display for StyleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentic => f.write_str("authentic"),
            Self::Clean => f.write_str("clean"),
        }
    }
}

/// Per-invocation options.
///
/// Serialized with camelCase keys; every field falls back to its
/// default when missing, so `{}` is a valid options document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineOptions {
    /// Maximum palette size, `3..=7`.
    pub color_count: u8,

    /// Keep hand-drawn irregularity (minimal boundary smoothing, low
    /// curve-fit tolerance). When `false`, region boundaries are closed
    /// and small holes filled before tracing.
    pub preserve_style: bool,

    /// Try the installed learned segmentation model before the
    /// lightness threshold.
    pub use_learned_extractor: bool,

    /// Fill paths with the complement of each palette color.
    pub invert_fill: bool,

    /// Connected regions with fewer pixels are discarded as noise.
    pub min_artifact_size: u32,

    /// Traced outlines enclosing this many square pixels or fewer are
    /// dropped (the tracer's speckle size).
    pub trace_smoothing: f64,

    /// Longest image side after downscaling, in pixels.
    pub working_resolution: u32,

    /// Resampling filter used when downscaling.
    pub downsample_filter: DownsampleFilter,

    /// Palette colors covering less than this percentage of the
    /// foreground are folded into their nearest surviving color.
    pub min_color_coverage: f64,
}

impl PipelineOptions {
    /// Default palette size.
    pub const DEFAULT_COLOR_COUNT: u8 = 5;
    /// Smallest accepted palette size.
    pub const MIN_COLOR_COUNT: u8 = 3;
    /// Largest accepted palette size.
    pub const MAX_COLOR_COUNT: u8 = 7;
    /// Default minimum region size in pixels.
    pub const DEFAULT_MIN_ARTIFACT_SIZE: u32 = 20;
    /// Default tracer speckle size.
    pub const DEFAULT_TRACE_SMOOTHING: f64 = 5.0;
    /// Default working resolution.
    pub const DEFAULT_WORKING_RESOLUTION: u32 = 1500;
    /// Default downscale filter.
    pub const DEFAULT_DOWNSAMPLE_FILTER: DownsampleFilter = DownsampleFilter::Lanczos3;
    /// Default minimum palette coverage percentage.
    pub const DEFAULT_MIN_COLOR_COVERAGE: f64 = 2.0;

    /// Check every field against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidOptions`] naming the first
    /// offending field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(Self::MIN_COLOR_COUNT..=Self::MAX_COLOR_COUNT).contains(&self.color_count) {
            return Err(PipelineError::InvalidOptions(format!(
                "colorCount must be between {} and {}, got {}",
                Self::MIN_COLOR_COUNT,
                Self::MAX_COLOR_COUNT,
                self.color_count,
            )));
        }
        if !self.trace_smoothing.is_finite() || self.trace_smoothing < 0.0 {
            return Err(PipelineError::InvalidOptions(format!(
                "traceSmoothing must be a finite non-negative number, got {}",
                self.trace_smoothing,
            )));
        }
        if self.working_resolution == 0 {
            return Err(PipelineError::InvalidOptions(
                "workingResolution must be at least 1".to_string(),
            ));
        }
        if !self.min_color_coverage.is_finite() || !(0.0..100.0).contains(&self.min_color_coverage)
        {
            return Err(PipelineError::InvalidOptions(format!(
                "minColorCoverage must be in [0, 100), got {}",
                self.min_color_coverage,
            )));
        }
        Ok(())
    }

    /// Style label matching `preserve_style`.
    #[must_use]
    pub const fn style_label(&self) -> StyleLabel {
        StyleLabel::from_preserve_style(self.preserve_style)
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            color_count: Self::DEFAULT_COLOR_COUNT,
            preserve_style: true,
            use_learned_extractor: true,
            invert_fill: false,
            min_artifact_size: Self::DEFAULT_MIN_ARTIFACT_SIZE,
            trace_smoothing: Self::DEFAULT_TRACE_SMOOTHING,
            working_resolution: Self::DEFAULT_WORKING_RESOLUTION,
            downsample_filter: Self::DEFAULT_DOWNSAMPLE_FILTER,
            min_color_coverage: Self::DEFAULT_MIN_COLOR_COVERAGE,
        }
    }
}

/// Summary counts attached to every [`PipelineResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    /// Number of palette entries.
    pub color_count: usize,
    /// Number of regions that were traced into at least one subpath.
    pub region_count: usize,
    /// Total subpaths across every emitted path.
    pub subpath_count: usize,
    /// `authentic` or `clean`.
    pub style: StyleLabel,
    /// Which extractor produced the foreground mask.
    pub extractor: ExtractorKind,
}

/// Output of one successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Complete SVG document text.
    pub svg: String,
    /// Palette ordered by descending coverage.
    pub palette: Vec<PaletteEntry>,
    /// Size of the image as received.
    pub original_size: Dimensions,
    /// Size after downscaling; the SVG `viewBox` uses this.
    pub processed_size: Dimensions,
    /// Wall-clock time spent inside the pipeline (seconds).
    #[serde(with = "crate::diagnostics::duration_serde")]
    pub elapsed: Duration,
    /// Summary counts.
    pub metadata: ResultMetadata,
}

/// Errors that end an invocation.
///
/// Model failures and degenerate regions are absorbed inside their
/// stages and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The image or mask is structurally unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An option is out of range.
    #[error("invalid pipeline options: {0}")]
    InvalidOptions(String),

    /// Foreground extraction found (almost) nothing to vectorize.
    #[error("no drawing found: foreground covers {coverage:.3}% of the image")]
    EmptyForeground {
        /// Foreground share of the image, in percent.
        coverage: f64,
    },

    /// The caller's deadline passed before the pipeline finished.
    #[error("processing exceeded the {0:?} deadline")]
    Timeout(Duration),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn point_lerp_midpoint() {
        let m = Point::new(0.0, 0.0).lerp(Point::new(4.0, -2.0), 0.5);
        assert_eq!(m, Point::new(2.0, -1.0));
    }

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance(b) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn color_hex_and_complement() {
        let c = Color::new(255, 16, 0);
        assert_eq!(c.hex(), "#ff1000");
        assert_eq!(c.complement(), Color::new(0, 239, 255));
        assert_eq!(c.complement().complement(), c);
    }

    #[test]
    fn bounding_box_grows() {
        let bbox = BoundingBox::pixel(5, 5).including(2, 7).including(9, 1);
        assert_eq!(
            bbox,
            BoundingBox {
                x: 2,
                y: 1,
                width: 8,
                height: 7,
            }
        );
    }

    #[test]
    fn foreground_mask_binarizes() {
        let mask = ForegroundMask::from_gray(GrayImage::from_fn(4, 1, |x, _| {
            image::Luma([u8::try_from(x).unwrap()])
        }));
        assert!(!mask.contains(0, 0));
        assert!(mask.contains(1, 0));
        assert_eq!(mask.count(), 3);
    }

    #[test]
    fn red_brush_overlay_is_excluded() {
        let overlay = RgbaImage::from_pixel(4, 4, image::Rgba([255, 0, 0, 255]));
        assert_eq!(ExclusionMask::from_rgba(&overlay).count(), 16);
    }

    #[test]
    fn exclusion_overlay_follows_alpha_only() {
        let overlay = RgbaImage::from_fn(4, 1, |x, _| match x {
            0 => image::Rgba([255, 0, 0, 100]),
            1 => image::Rgba([0, 0, 0, 51]),
            2 => image::Rgba([255, 255, 255, 50]),
            _ => image::Rgba([255, 0, 0, 0]),
        });
        let mask = ExclusionMask::from_rgba(&overlay);
        assert!(mask.contains(0, 0));
        assert!(mask.contains(1, 0));
        assert!(!mask.contains(2, 0));
        assert!(!mask.contains(3, 0));
    }

    #[test]
    fn opaque_overlay_uses_red_channel() {
        let overlay = RgbImage::from_fn(3, 1, |x, _| match x {
            0 => image::Rgb([200, 0, 0]),
            1 => image::Rgb([0, 200, 200]),
            _ => image::Rgb([40, 255, 255]),
        });
        let mask = ExclusionMask::from_rgb(&overlay);
        assert!(mask.contains(0, 0));
        assert!(!mask.contains(1, 0));
        assert!(!mask.contains(2, 0));
    }

    #[test]
    fn dilation_grows_a_dot_to_nine_square() {
        let mut dot = GrayImage::new(15, 15);
        dot.put_pixel(7, 7, image::Luma([255]));
        let mask = ExclusionMask::from_gray(dot).dilated();
        assert_eq!(mask.count(), 81);
        assert!(mask.contains(3, 3));
        assert!(mask.contains(11, 11));
        assert!(!mask.contains(2, 7));
        assert!(!mask.contains(7, 12));
    }

    #[test]
    fn default_options_match_documented_values() {
        let opts = PipelineOptions::default();
        assert_eq!(opts.color_count, 5);
        assert!(opts.preserve_style);
        assert!(opts.use_learned_extractor);
        assert!(!opts.invert_fill);
        assert_eq!(opts.min_artifact_size, 20);
        assert!((opts.trace_smoothing - 5.0).abs() < f64::EPSILON);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn options_deserialize_camel_case_with_defaults() {
        let opts: PipelineOptions =
            serde_json::from_str(r#"{"colorCount": 3, "invertFill": true}"#).unwrap();
        assert_eq!(opts.color_count, 3);
        assert!(opts.invert_fill);
        assert_eq!(opts.min_artifact_size, 20);
    }

    #[test]
    fn validate_rejects_color_count_out_of_range() {
        for count in [0, 2, 8, 255] {
            let opts = PipelineOptions {
                color_count: count,
                ..PipelineOptions::default()
            };
            assert!(matches!(
                opts.validate(),
                Err(PipelineError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn validate_rejects_negative_smoothing() {
        let opts = PipelineOptions {
            trace_smoothing: -1.0,
            ..PipelineOptions::default()
        };
        assert!(opts.validate().is_err());
        let opts = PipelineOptions {
            trace_smoothing: f64::NAN,
            ..PipelineOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn style_label_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&StyleLabel::Authentic).unwrap(),
            "\"authentic\""
        );
        assert_eq!(StyleLabel::from_preserve_style(false), StyleLabel::Clean);
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            PipelineError::EmptyInput.to_string(),
            "input image data is empty"
        );
        let err = PipelineError::EmptyForeground { coverage: 0.0 };
        assert_eq!(
            err.to_string(),
            "no drawing found: foreground covers 0.000% of the image"
        );
    }
}
