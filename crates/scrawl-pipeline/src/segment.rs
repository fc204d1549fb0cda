//! Per-color region segmentation.
//!
//! Each palette color's pixels are split into 8-connected components.
//! Components smaller than the artifact threshold are discarded before
//! they can reach the tracer, and pixels under the exclusion mask are
//! removed from every color.
//!
//! Style preservation controls how much the region boundary is touched:
//! authentic mode only removes isolated pixels and single-pixel
//! pinholes, while clean mode also closes each region with a 3x3 kernel
//! and fills small enclosed holes. Clean-mode smoothing is accepted only
//! when it keeps the region in one piece without adding outlines.

use std::collections::HashMap;

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::boundary::count_significant;
use crate::types::{BoundingBox, ExclusionMask, count_set};

/// Extra pixels around a region's bounding box given to clean-mode
/// closing so it can grow past the original extent.
const SMOOTHING_PADDING: u32 = 2;

/// Segmentation parameters derived from the pipeline options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentParams {
    /// Components with fewer pixels are discarded.
    pub min_artifact_size: u32,
    /// Skip clean-mode smoothing.
    pub preserve_style: bool,
    /// Outline area at or below which the tracer drops a boundary.
    pub turd_size: f64,
}

/// One connected region of a single palette color.
///
/// The mask is cropped to the bounding box; pixel `(x, y)` of the mask
/// is pixel `(bounding_box.x + x, bounding_box.y + y)` of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorRegion {
    /// Index into the palette.
    pub palette_index: usize,
    /// Cropped 0/255 region mask.
    pub mask: GrayImage,
    /// Position of the mask in image coordinates.
    pub bounding_box: BoundingBox,
    /// Set pixels in `mask`.
    pub pixel_count: u64,
}

/// Output of [`segment`].
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Surviving regions, grouped by palette index in palette order and
    /// in scan order of their first pixel within a color.
    pub regions: Vec<ColorRegion>,
    /// Components discarded as smaller than the artifact threshold.
    pub dropped: usize,
    /// Foreground pixels removed by the exclusion mask.
    pub excluded_pixels: u64,
    /// Regions whose clean-mode smoothing was accepted.
    pub smoothed: usize,
}

/// Split the label image into per-color connected regions.
///
/// `labels` holds a palette index per pixel (or
/// [`NO_LABEL`](crate::quantize::NO_LABEL) outside the foreground).
#[must_use = "returns the segmented regions"]
pub fn segment(
    labels: &GrayImage,
    palette_len: usize,
    exclusion: Option<&ExclusionMask>,
    params: &SegmentParams,
) -> Segmentation {
    let mut segmentation = Segmentation {
        regions: Vec::new(),
        dropped: 0,
        excluded_pixels: 0,
        smoothed: 0,
    };

    for palette_index in 0..palette_len {
        let Ok(label) = u8::try_from(palette_index) else {
            break;
        };
        let mut mask = GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
            Luma([if labels.get_pixel(x, y).0[0] == label { 255 } else { 0 }])
        });
        despeckle(&mut mask);
        if let Some(exclusion) = exclusion {
            segmentation.excluded_pixels += apply_exclusion(&mut mask, exclusion);
        }

        for (mask, bounding_box) in components(&mask) {
            let pixel_count = count_set(&mask);
            if pixel_count < u64::from(params.min_artifact_size) {
                segmentation.dropped += 1;
                continue;
            }
            let mut region = ColorRegion {
                palette_index,
                mask,
                bounding_box,
                pixel_count,
            };
            if !params.preserve_style {
                let (width, height) = labels.dimensions();
                if let Some(smoothed) = smooth_region(&region, width, height, exclusion, params) {
                    region = smoothed;
                    segmentation.smoothed += 1;
                }
            }
            segmentation.regions.push(region);
        }
    }

    tracing::debug!(
        regions = segmentation.regions.len(),
        dropped = segmentation.dropped,
        excluded_pixels = segmentation.excluded_pixels,
        smoothed = segmentation.smoothed,
        "segmented regions",
    );
    segmentation
}

/// Remove isolated pixels and fill single-pixel pinholes.
///
/// A set pixel with no set 8-neighbour is cleared. An unset interior
/// pixel whose four edge neighbours are all set is filled. Decisions
/// are made against the unmodified mask.
fn despeckle(mask: &mut GrayImage) {
    let snapshot = mask.clone();
    let (w, h) = snapshot.dimensions();
    let set = |x: i64, y: i64| {
        u32::try_from(x)
            .ok()
            .zip(u32::try_from(y).ok())
            .filter(|&(x, y)| x < w && y < h)
            .is_some_and(|(x, y)| snapshot.get_pixel(x, y).0[0] != 0)
    };

    for y in 0..h {
        for x in 0..w {
            let (xi, yi) = (i64::from(x), i64::from(y));
            if set(xi, yi) {
                let isolated = (-1..=1)
                    .flat_map(|dy| (-1..=1).map(move |dx| (dx, dy)))
                    .filter(|&d| d != (0, 0))
                    .all(|(dx, dy)| !set(xi + dx, yi + dy));
                if isolated {
                    mask.put_pixel(x, y, Luma([0]));
                }
            } else if x > 0
                && y > 0
                && x + 1 < w
                && y + 1 < h
                && set(xi - 1, yi)
                && set(xi + 1, yi)
                && set(xi, yi - 1)
                && set(xi, yi + 1)
            {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
}

/// Clear pixels of `mask` that fall under the exclusion mask. Returns
/// how many were cleared.
fn apply_exclusion(mask: &mut GrayImage, exclusion: &ExclusionMask) -> u64 {
    let mut cleared = 0;
    for (x, y, p) in mask.enumerate_pixels_mut() {
        if p.0[0] != 0 && exclusion.contains(x, y) {
            p.0[0] = 0;
            cleared += 1;
        }
    }
    cleared
}

/// 8-connected components of `mask`, each cropped to its bounding box,
/// in scan order of their first pixel.
fn components(mask: &GrayImage) -> Vec<(GrayImage, BoundingBox)> {
    let labelled = connected_components(mask, Connectivity::Eight, Luma([0u8]));

    let mut order: HashMap<u32, usize> = HashMap::new();
    let mut found: Vec<(u32, BoundingBox)> = Vec::new();
    for (x, y, p) in labelled.enumerate_pixels() {
        let label = p.0[0];
        if label == 0 {
            continue;
        }
        match order.get(&label) {
            Some(&i) => found[i].1 = found[i].1.including(x, y),
            None => {
                order.insert(label, found.len());
                found.push((label, BoundingBox::pixel(x, y)));
            }
        }
    }

    found
        .into_iter()
        .map(|(label, bbox)| {
            let crop = GrayImage::from_fn(bbox.width, bbox.height, |x, y| {
                let inside = labelled.get_pixel(bbox.x + x, bbox.y + y).0[0] == label;
                Luma([if inside { 255 } else { 0 }])
            });
            (crop, bbox)
        })
        .collect()
}

/// Clean-mode smoothing of one region.
///
/// Tries a 3x3 closing followed by small-hole filling, then hole filling
/// alone. A candidate is accepted when it stays a single component and
/// has no more significant outlines than the original. Returns `None`
/// when neither candidate is accepted.
fn smooth_region(
    region: &ColorRegion,
    image_width: u32,
    image_height: u32,
    exclusion: Option<&ExclusionMask>,
    params: &SegmentParams,
) -> Option<ColorRegion> {
    let bbox = region.bounding_box;
    let pad = SMOOTHING_PADDING;
    // Image position of the padded crop's top-left pixel; may be negative.
    let ox = i64::from(bbox.x) - i64::from(pad);
    let oy = i64::from(bbox.y) - i64::from(pad);
    let to_image = |x: u32, y: u32| -> Option<(u32, u32)> {
        let ix = u32::try_from(ox + i64::from(x)).ok()?;
        let iy = u32::try_from(oy + i64::from(y)).ok()?;
        (ix < image_width && iy < image_height).then_some((ix, iy))
    };

    let padded = GrayImage::from_fn(bbox.width + 2 * pad, bbox.height + 2 * pad, |x, y| {
        let inside = x >= pad
            && y >= pad
            && x - pad < bbox.width
            && y - pad < bbox.height
            && region.mask.get_pixel(x - pad, y - pad).0[0] != 0;
        Luma([if inside { 255 } else { 0 }])
    });
    let baseline = count_significant(&padded, params.turd_size);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let max_hole_area = f64::from(params.min_artifact_size).max(params.turd_size) as u64;

    let finish = |mut candidate: GrayImage| -> Option<GrayImage> {
        fill_holes(&mut candidate, max_hole_area);
        for (x, y, p) in candidate.enumerate_pixels_mut() {
            let keep = to_image(x, y)
                .is_some_and(|(ix, iy)| exclusion.is_none_or(|e| !e.contains(ix, iy)));
            if !keep {
                p.0[0] = 0;
            }
        }
        let accepted = components(&candidate).len() == 1
            && count_significant(&candidate, params.turd_size) <= baseline;
        accepted.then_some(candidate)
    };

    let closed = imageproc::morphology::close(&padded, Norm::LInf, 1);
    let smoothed = finish(closed).or_else(|| finish(padded.clone()))?;

    let (mask, inner) = components(&smoothed).into_iter().next()?;
    let (x, y) = to_image(inner.x, inner.y)?;
    let pixel_count = count_set(&mask);
    Some(ColorRegion {
        palette_index: region.palette_index,
        mask,
        bounding_box: BoundingBox {
            x,
            y,
            width: inner.width,
            height: inner.height,
        },
        pixel_count,
    })
}

/// Fill background pockets of at most `max_area` pixels that do not
/// touch the mask border.
fn fill_holes(mask: &mut GrayImage, max_area: u64) {
    let (w, h) = mask.dimensions();
    let background = GrayImage::from_fn(w, h, |x, y| {
        Luma([if mask.get_pixel(x, y).0[0] == 0 { 255 } else { 0 }])
    });
    let labelled = connected_components(&background, Connectivity::Four, Luma([0u8]));

    // label -> (area, touches border)
    let mut pockets: HashMap<u32, (u64, bool)> = HashMap::new();
    for (x, y, p) in labelled.enumerate_pixels() {
        let label = p.0[0];
        if label == 0 {
            continue;
        }
        let entry = pockets.entry(label).or_insert((0, false));
        entry.0 += 1;
        entry.1 |= x == 0 || y == 0 || x + 1 == w || y + 1 == h;
    }

    for (x, y, p) in mask.enumerate_pixels_mut() {
        let label = labelled.get_pixel(x, y).0[0];
        if let Some(&(area, border)) = pockets.get(&label)
            && !border
            && area <= max_area
        {
            p.0[0] = 255;
        }
    }
}
