//! Decoding of encoded image and exclusion-mask buffers.
//!
//! Accepts raw bytes in any format the `image` crate can read (PNG,
//! JPEG, BMP, WebP) and produces the RGBA buffer the pipeline works on.

use crate::types::{ExclusionMask, PipelineError, RgbaImage};

/// Decode raw image bytes to RGBA.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyInput`] if `bytes` is empty.
/// Returns [`PipelineError::ImageDecode`] if the image format is
/// unrecognized or the data is corrupt. Returns
/// [`PipelineError::InvalidInput`] for a zero-sized image.
pub fn decode_image(bytes: &[u8]) -> Result<RgbaImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let rgba = image::load_from_memory(bytes)?.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(PipelineError::InvalidInput(
            "image has zero width or height".to_string(),
        ));
    }
    Ok(rgba)
}

/// Decode an exclusion-mask image painted by a brush.
///
/// Overlays with an alpha channel are excluded wherever they are
/// painted ([`ExclusionMask::from_rgba`]); overlays without one use the
/// red channel ([`ExclusionMask::from_rgb`]). The result is dilated
/// with [`ExclusionMask::dilated`].
///
/// # Errors
///
/// Same conditions as [`decode_image`].
pub fn decode_exclusion_mask(bytes: &[u8]) -> Result<ExclusionMask, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::EmptyInput);
    }
    let overlay = image::load_from_memory(bytes)?;
    if overlay.width() == 0 || overlay.height() == 0 {
        return Err(PipelineError::InvalidInput(
            "exclusion mask has zero width or height".to_string(),
        ));
    }
    let mask = if overlay.color().has_alpha() {
        ExclusionMask::from_rgba(&overlay.to_rgba8())
    } else {
        ExclusionMask::from_rgb(&overlay.to_rgb8())
    };
    tracing::debug!(excluded = mask.count(), "decoded exclusion mask");
    Ok(mask.dilated())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

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

    #[test]
    fn empty_input_returns_error() {
        assert!(matches!(decode_image(&[]), Err(PipelineError::EmptyInput)));
    }

    #[test]
    fn corrupt_bytes_returns_image_decode_error() {
        let result = decode_image(&[0xFF, 0xFE, 0x00, 0x01]);
        assert!(matches!(result, Err(PipelineError::ImageDecode(_))));
    }

    #[test]
    fn valid_png_round_trips_pixels() {
        let img = RgbaImage::from_fn(17, 31, |x, y| {
            image::Rgba([u8::try_from(x).unwrap(), u8::try_from(y).unwrap(), 7, 255])
        });
        let decoded = decode_image(&encode_png(&img)).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn exclusion_mask_from_png_is_dilated() {
        let overlay = RgbaImage::from_fn(20, 10, |x, _| {
            if x < 2 {
                image::Rgba([255, 0, 0, 255])
            } else {
                image::Rgba([0, 0, 0, 0])
            }
        });
        let mask = decode_exclusion_mask(&encode_png(&overlay)).unwrap();
        // Columns 0..2 painted, grown by 4 columns.
        assert_eq!(mask.count(), 6 * 10);
        assert!(mask.contains(5, 9));
        assert!(!mask.contains(6, 0));
    }

    #[test]
    fn exclusion_mask_without_alpha_uses_red() {
        let overlay = image::RgbImage::from_fn(20, 10, |x, _| {
            if x >= 18 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 0])
            }
        });
        let mut buf = Vec::new();
        image::ImageEncoder::write_image(
            image::codecs::png::PngEncoder::new(&mut buf),
            overlay.as_raw(),
            overlay.width(),
            overlay.height(),
            image::ExtendedColorType::Rgb8,
        )
        .unwrap();
        let mask = decode_exclusion_mask(&buf).unwrap();
        assert_eq!(mask.count(), 6 * 10);
        assert!(mask.contains(14, 0));
        assert!(!mask.contains(13, 0));
    }

    #[test]
    fn empty_exclusion_mask_returns_error() {
        assert!(matches!(
            decode_exclusion_mask(&[]),
            Err(PipelineError::EmptyInput)
        ));
    }
}
