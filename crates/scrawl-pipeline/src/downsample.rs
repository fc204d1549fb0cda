//! Image downscaling to the working resolution.
//!
//! Photos from phone cameras are far larger than anything a drawing
//! needs; every later stage runs on the reduced grid. The exclusion
//! mask is resized alongside the image with nearest-neighbour sampling
//! so it stays binary and aligned.
//!
//! If the image is already at or below the target resolution, it is
//! returned unchanged.

use std::fmt;

use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, ExclusionMask, RgbaImage};

/// Resampling filter used when downscaling.
///
/// Ordered from fastest/lowest-quality to slowest/highest-quality,
/// with a `Disabled` variant to skip downscaling entirely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownsampleFilter {
    /// Skip downscaling regardless of image size.
    Disabled,
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Gaussian: moderate speed, smooth output.
    Gaussian,
    /// Lanczos with 3 lobes: slowest, sharpest/best for photos.
    #[default]
    Lanczos3,
}

impl DownsampleFilter {
    /// Convert to the `image` crate's `FilterType`.
    const fn to_image_filter(self) -> Option<FilterType> {
        match self {
            Self::Disabled => None,
            Self::Nearest => Some(FilterType::Nearest),
            Self::Triangle => Some(FilterType::Triangle),
            Self::CatmullRom => Some(FilterType::CatmullRom),
            Self::Gaussian => Some(FilterType::Gaussian),
            Self::Lanczos3 => Some(FilterType::Lanczos3),
        }
    }
}

impl fmt::Display for DownsampleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Gaussian => f.write_str("Gaussian"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Size the image takes after downscaling, or `None` when it already
/// fits within `max_dimension`.
///
/// The aspect ratio is preserved and neither side drops below one
/// pixel.
#[must_use]
pub fn target_dimensions(source: Dimensions, max_dimension: u32) -> Option<Dimensions> {
    let long_axis = source.width.max(source.height);
    if long_axis <= max_dimension {
        return None;
    }
    let scale = f64::from(max_dimension) / f64::from(long_axis);
    let shrink = |side: u32| -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (f64::from(side) * scale).round() as u32;
        scaled.clamp(1, max_dimension)
    };
    Some(Dimensions::new(shrink(source.width), shrink(source.height)))
}

/// Downscale an image so the longest axis is at most `max_dimension`
/// pixels, using the specified resampling filter.
///
/// Returns the (possibly unchanged) image and whether downscaling was
/// actually applied.
#[must_use]
pub fn downsample(
    image: RgbaImage,
    max_dimension: u32,
    filter: DownsampleFilter,
) -> (RgbaImage, bool) {
    let Some(image_filter) = filter.to_image_filter() else {
        return (image, false);
    };
    let Some(target) = target_dimensions(Dimensions::of(&image), max_dimension) else {
        return (image, false);
    };
    let resized = imageops::resize(&image, target.width, target.height, image_filter);
    (resized, true)
}

/// Resize an exclusion mask to `target` with nearest-neighbour sampling.
///
/// Returns the mask unchanged when it already has the target size.
#[must_use]
pub fn resize_exclusion(mask: ExclusionMask, target: Dimensions) -> ExclusionMask {
    if mask.dimensions() == target {
        return mask;
    }
    ExclusionMask::from_gray(imageops::resize(
        mask.as_image(),
        target.width,
        target.height,
        FilterType::Nearest,
    ))
}
