//! CIE L*a*b* helpers shared by the normalizer and the quantizer.

use lab::{Lab, labs_to_rgb_bytes, rgb_bytes_to_labs};

use crate::types::{Color, RgbImage};

/// Convert every pixel of an RGB image to L*a*b*, in row-major order.
pub(crate) fn image_to_labs(image: &RgbImage) -> Vec<Lab> {
    rgb_bytes_to_labs(image.as_raw())
}

/// Rebuild an RGB image from row-major L*a*b* pixels.
///
/// Returns `None` when `labs` does not hold exactly `width * height`
/// entries.
pub(crate) fn labs_to_image(labs: &[Lab], width: u32, height: u32) -> Option<RgbImage> {
    RgbImage::from_raw(width, height, labs_to_rgb_bytes(labs))
}

/// Squared CIE76 color difference (ΔE²).
#[inline]
pub(crate) fn delta_e_sq(a: &Lab, b: &Lab) -> f32 {
    let dl = a.l - b.l;
    let da = a.a - b.a;
    let db = a.b - b.b;
    dl.mul_add(dl, da.mul_add(da, db * db))
}

/// L*a*b* value of an sRGB color.
pub(crate) fn color_to_lab(color: Color) -> Lab {
    Lab::from_rgb(&color.to_array())
}
