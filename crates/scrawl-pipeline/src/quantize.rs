//! Color quantization: reduce the foreground to a small palette.
//!
//! Foreground colors are first binned at 5 bits per channel. A weighted
//! k-means then runs over the bins in CIE L*a*b*:
//!
//! - Seeding is deterministic. The most frequent bin seeds the first
//!   cluster; each further seed is the bin maximising
//!   `count * distance² to the nearest seed` (earliest bin wins ties).
//! - Lloyd iterations reassign bins until nothing moves.
//! - Centers closer than [`QuantizeParams::merge_distance`] are merged,
//!   and clusters below the minimum coverage are dissolved into their
//!   nearest neighbour.
//!
//! Every foreground pixel is then remapped to its nearest center, and
//! each palette color is the mean sRGB of the pixels it received, so a
//! flat patch of paint keeps its exact color. The palette is ordered by
//! descending pixel count; equal counts keep cluster order.

use std::collections::HashMap;

use lab::Lab;

use crate::color;
use crate::types::{Color, ForegroundMask, GrayImage, PaletteEntry, RgbImage};

/// Label value for pixels outside the foreground.
pub const NO_LABEL: u8 = u8::MAX;

/// Bits kept per channel when binning colors.
const BIN_BITS: u32 = 5;

/// Quantizer tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizeParams {
    /// Maximum palette size.
    pub color_count: usize,
    /// Clusters covering less than this percentage are dissolved.
    pub min_coverage: f64,
    /// Centers closer than this ΔE are merged.
    pub merge_distance: f32,
    /// Lloyd iteration cap.
    pub max_iterations: usize,
}

impl QuantizeParams {
    /// Parameters for a palette of at most `color_count` colors.
    #[must_use]
    pub const fn new(color_count: usize, min_coverage: f64) -> Self {
        Self {
            color_count,
            min_coverage,
            merge_distance: 8.0,
            max_iterations: 100,
        }
    }
}

/// Counters describing one quantization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantizeStats {
    /// Non-empty color bins in the foreground.
    pub distinct_bins: usize,
    /// Lloyd iterations executed.
    pub iterations: usize,
    /// Centers merged into a near-duplicate.
    pub merged: usize,
    /// Clusters dissolved for low coverage.
    pub dissolved: usize,
}

/// Output of the quantization stage.
#[derive(Debug, Clone)]
pub struct Quantization {
    /// Palette ordered by descending coverage.
    pub palette: Vec<PaletteEntry>,
    /// Per-pixel palette index, [`NO_LABEL`] outside the foreground.
    pub labels: GrayImage,
    /// The image with every foreground pixel set to its palette color.
    pub flattened: RgbImage,
    /// Run counters.
    pub stats: QuantizeStats,
}

/// A populated color bin.
#[derive(Debug, Clone, Copy)]
struct Bin {
    key: u32,
    count: u64,
    lab: Lab,
}

/// Quantize the foreground of `image`.
#[must_use = "returns the palette and label map"]
pub fn quantize(image: &RgbImage, mask: &ForegroundMask, params: &QuantizeParams) -> Quantization {
    let (bins, total) = collect_bins(image, mask);
    let mut stats = QuantizeStats {
        distinct_bins: bins.len(),
        ..QuantizeStats::default()
    };

    let k = params.color_count.min(bins.len());
    let mut centers = seed_centers(&bins, k);
    stats.iterations = refine(&bins, &mut centers, params.max_iterations);
    stats.merged = merge_close(&bins, &mut centers, params.merge_distance);
    stats.dissolved = dissolve_small(&bins, &mut centers, total, params.min_coverage);

    let (labels, sums) = remap(image, mask, &centers);
    let counts: Vec<u64> = sums.iter().map(|s| s[3]).collect();
    let order = palette_order(&counts);

    // Old cluster index -> final palette index.
    let mut rank = vec![NO_LABEL; centers.len()];
    for (new, &old) in order.iter().enumerate() {
        rank[old] = u8::try_from(new).unwrap_or(NO_LABEL);
    }
    let colors: Vec<Color> = sums.iter().map(mean_color).collect();

    #[allow(clippy::cast_precision_loss)]
    let palette: Vec<PaletteEntry> = order
        .iter()
        .map(|&old| PaletteEntry {
            color: colors[old],
            pixel_count: counts[old],
            coverage: if total == 0 {
                0.0
            } else {
                counts[old] as f64 * 100.0 / total as f64
            },
        })
        .collect();

    let mut labels = labels;
    for p in labels.pixels_mut() {
        if p.0[0] != NO_LABEL {
            p.0[0] = rank[usize::from(p.0[0])];
        }
    }
    let flattened = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let label = labels.get_pixel(x, y).0[0];
        let color = palette
            .get(usize::from(label))
            .map_or(Color::WHITE, |entry| entry.color);
        image::Rgb(color.to_array())
    });

    tracing::debug!(
        colors = palette.len(),
        bins = stats.distinct_bins,
        iterations = stats.iterations,
        merged = stats.merged,
        dissolved = stats.dissolved,
        "palette extracted"
    );

    Quantization {
        palette,
        labels,
        flattened,
        stats,
    }
}

/// Bin foreground colors; bins come back ordered by descending count,
/// then ascending key.
fn collect_bins(image: &RgbImage, mask: &ForegroundMask) -> (Vec<Bin>, u64) {
    let shift = 8 - BIN_BITS;
    let mut sums = vec![[0u64; 4]; 1 << (3 * BIN_BITS)];
    let mut total = 0u64;
    for (x, y, pixel) in image.enumerate_pixels() {
        if !mask.contains(x, y) {
            continue;
        }
        let [r, g, b] = pixel.0;
        let key = (u32::from(r >> shift) << (2 * BIN_BITS))
            | (u32::from(g >> shift) << BIN_BITS)
            | u32::from(b >> shift);
        let slot = &mut sums[key as usize];
        slot[0] += u64::from(r);
        slot[1] += u64::from(g);
        slot[2] += u64::from(b);
        slot[3] += 1;
        total += 1;
    }

    let mut bins: Vec<Bin> = sums
        .iter()
        .enumerate()
        .filter(|(_, s)| s[3] > 0)
        .map(|(key, s)| Bin {
            key: u32::try_from(key).unwrap_or(u32::MAX),
            count: s[3],
            lab: color::color_to_lab(mean_color(s)),
        })
        .collect();
    bins.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.cmp(&b.key)));
    (bins, total)
}

/// Rounded mean of `[r_sum, g_sum, b_sum, count]`.
fn mean_color(sums: &[u64; 4]) -> Color {
    let n = sums[3].max(1);
    let mean = |sum: u64| u8::try_from((sum + n / 2) / n).unwrap_or(u8::MAX);
    Color::new(mean(sums[0]), mean(sums[1]), mean(sums[2]))
}

/// Weighted farthest-point seeding starting from the most frequent bin.
fn seed_centers(bins: &[Bin], k: usize) -> Vec<Lab> {
    let Some(first) = bins.first() else {
        return Vec::new();
    };
    let mut centers = vec![first.lab];
    while centers.len() < k {
        let mut best: Option<(f64, usize)> = None;
        for (i, bin) in bins.iter().enumerate() {
            let d = centers
                .iter()
                .map(|c| color::delta_e_sq(&bin.lab, c))
                .fold(f32::INFINITY, f32::min);
            #[allow(clippy::cast_precision_loss)]
            let score = bin.count as f64 * f64::from(d);
            if best.is_none_or(|(s, _)| score > s) {
                best = Some((score, i));
            }
        }
        match best {
            Some((score, i)) if score > 0.0 => centers.push(bins[i].lab),
            _ => break,
        }
    }
    centers
}

/// Index of the nearest center (lowest index on ties).
fn nearest(centers: &[Lab], lab: &Lab) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = color::delta_e_sq(lab, c);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Assign every bin to its nearest center.
fn assign(bins: &[Bin], centers: &[Lab]) -> Vec<usize> {
    bins.iter().map(|b| nearest(centers, &b.lab)).collect()
}

/// Total bin count per center.
fn cluster_weights(bins: &[Bin], assignment: &[usize], clusters: usize) -> Vec<u64> {
    let mut weights = vec![0u64; clusters];
    for (bin, &c) in bins.iter().zip(assignment) {
        weights[c] += bin.count;
    }
    weights
}

/// Lloyd iterations; returns how many ran.
fn refine(bins: &[Bin], centers: &mut [Lab], max_iterations: usize) -> usize {
    let mut assignment = assign(bins, centers);
    for iteration in 1..=max_iterations {
        let mut sums = vec![(0f64, 0f64, 0f64, 0u64); centers.len()];
        for (bin, &c) in bins.iter().zip(&assignment) {
            #[allow(clippy::cast_precision_loss)]
            let w = bin.count as f64;
            let s = &mut sums[c];
            s.0 += w * f64::from(bin.lab.l);
            s.1 += w * f64::from(bin.lab.a);
            s.2 += w * f64::from(bin.lab.b);
            s.3 += bin.count;
        }
        for (center, s) in centers.iter_mut().zip(&sums) {
            // Empty clusters keep their previous center.
            if s.3 > 0 {
                #[allow(clippy::cast_precision_loss)]
                let n = s.3 as f64;
                *center = lab_from_f64(s.0 / n, s.1 / n, s.2 / n);
            }
        }
        let next = assign(bins, centers);
        if next == assignment {
            return iteration;
        }
        assignment = next;
    }
    max_iterations
}

#[allow(clippy::cast_possible_truncation)]
fn lab_from_f64(l: f64, a: f64, b: f64) -> Lab {
    Lab {
        l: l as f32,
        a: a as f32,
        b: b as f32,
    }
}

/// Merge pairs of centers closer than `distance`; returns merge count.
fn merge_close(bins: &[Bin], centers: &mut Vec<Lab>, distance: f32) -> usize {
    let limit = distance * distance;
    let mut merged = 0;
    loop {
        let weights = cluster_weights(bins, &assign(bins, centers), centers.len());
        let pair = (0..centers.len())
            .flat_map(|i| ((i + 1)..centers.len()).map(move |j| (i, j)))
            .find(|&(i, j)| color::delta_e_sq(&centers[i], &centers[j]) < limit);
        let Some((i, j)) = pair else {
            return merged;
        };
        let (wi, wj) = (weights[i], weights[j]);
        if wi + wj > 0 {
            #[allow(clippy::cast_precision_loss)]
            let (fi, fj) = (wi as f32, wj as f32);
            let mix = |a: f32, b: f32| a.mul_add(fi, b * fj) / (fi + fj);
            centers[i] = Lab {
                l: mix(centers[i].l, centers[j].l),
                a: mix(centers[i].a, centers[j].a),
                b: mix(centers[i].b, centers[j].b),
            };
        }
        centers.remove(j);
        merged += 1;
    }
}

/// Remove clusters below `min_coverage` percent one at a time,
/// smallest first; the last cluster always survives.
fn dissolve_small(bins: &[Bin], centers: &mut Vec<Lab>, total: u64, min_coverage: f64) -> usize {
    let mut dissolved = 0;
    while centers.len() > 1 && total > 0 {
        let weights = cluster_weights(bins, &assign(bins, centers), centers.len());
        // Smallest weight; among equals the latest cluster goes first.
        let Some((idx, &weight)) = weights
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
        else {
            break;
        };
        #[allow(clippy::cast_precision_loss)]
        let coverage = weight as f64 * 100.0 / total as f64;
        if coverage >= min_coverage {
            break;
        }
        centers.remove(idx);
        dissolved += 1;
    }
    dissolved
}

/// Label every foreground pixel with its nearest center.
///
/// Returns the label map and, per center, `[r_sum, g_sum, b_sum, count]`
/// of the pixels assigned to it.
fn remap(image: &RgbImage, mask: &ForegroundMask, centers: &[Lab]) -> (GrayImage, Vec<[u64; 4]>) {
    let mut cache: HashMap<[u8; 3], u8> = HashMap::new();
    let mut sums = vec![[0u64; 4]; centers.len()];
    let mut labels = GrayImage::from_pixel(image.width(), image.height(), image::Luma([NO_LABEL]));
    if centers.is_empty() {
        return (labels, sums);
    }
    for (x, y, pixel) in image.enumerate_pixels() {
        if !mask.contains(x, y) {
            continue;
        }
        let label = *cache.entry(pixel.0).or_insert_with(|| {
            let lab = color::color_to_lab(Color::from_array(pixel.0));
            u8::try_from(nearest(centers, &lab)).unwrap_or(NO_LABEL)
        });
        let slot = &mut sums[usize::from(label)];
        slot[0] += u64::from(pixel.0[0]);
        slot[1] += u64::from(pixel.0[1]);
        slot[2] += u64::from(pixel.0[2]);
        slot[3] += 1;
        labels.put_pixel(x, y, image::Luma([label]));
    }
    (labels, sums)
}

/// Cluster indices with pixels, by descending count (stable).
fn palette_order(counts: &[u64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..counts.len()).filter(|&i| counts[i] > 0).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
    order
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn all_foreground(w: u32, h: u32) -> ForegroundMask {
        ForegroundMask::from_gray(GrayImage::from_pixel(w, h, image::Luma([255])))
    }

    /// Vertical stripes of the given colors and widths.
    fn stripes(parts: &[([u8; 3], u32)], h: u32) -> RgbImage {
        let w: u32 = parts.iter().map(|(_, n)| n).sum();
        RgbImage::from_fn(w, h, |x, _| {
            let mut edge = 0;
            for (color, n) in parts {
                edge += n;
                if x < edge {
                    return image::Rgb(*color);
                }
            }
            image::Rgb([0, 0, 0])
        })
    }

    #[test]
    fn fewer_colors_than_requested_is_not_padded() {
        let img = stripes(&[([200, 0, 0], 30), ([0, 0, 200], 10)], 10);
        let q = quantize(&img, &all_foreground(40, 10), &QuantizeParams::new(5, 2.0));
        assert_eq!(q.palette.len(), 2);
        assert_eq!(q.palette[0].color, Color::new(200, 0, 0));
        assert_eq!(q.palette[0].pixel_count, 300);
        assert!((q.palette[0].coverage - 75.0).abs() < 1e-9);
        assert!((q.palette[1].coverage - 25.0).abs() < 1e-9);
    }

    #[test]
    fn palette_never_exceeds_color_count() {
        let img = stripes(
            &[
                ([255, 0, 0], 10),
                ([0, 255, 0], 10),
                ([0, 0, 255], 10),
                ([255, 255, 0], 10),
                ([0, 0, 0], 10),
            ],
            10,
        );
        let q = quantize(&img, &all_foreground(50, 10), &QuantizeParams::new(3, 0.0));
        assert!(q.palette.len() <= 3);
        assert!(!q.palette.is_empty());
        let sum: f64 = q.palette.iter().map(|e| e.coverage).sum();
        assert!(sum <= 100.0 + 1e-9);
    }

    #[test]
    fn near_duplicates_merge() {
        // Different 5-bit bins, under 8 ΔE apart.
        let img = stripes(&[([200, 20, 20], 20), ([210, 26, 20], 20), ([0, 0, 200], 20)], 5);
        let q = quantize(&img, &all_foreground(60, 5), &QuantizeParams::new(5, 0.0));
        assert_eq!(q.palette.len(), 2);
        assert_eq!(q.stats.merged, 1);
    }

    #[test]
    fn rare_colors_are_dissolved() {
        // 1% green must fold into a neighbour at the default 2% floor.
        let img = stripes(&[([200, 0, 0], 60), ([0, 0, 200], 39), ([0, 200, 0], 1)], 10);
        let q = quantize(&img, &all_foreground(100, 10), &QuantizeParams::new(5, 2.0));
        assert_eq!(q.palette.len(), 2);
        assert_eq!(q.stats.dissolved, 1);
        let total: u64 = q.palette.iter().map(|e| e.pixel_count).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn background_is_unlabelled_and_white() {
        let img = RgbImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                image::Rgb([10, 120, 10])
            } else {
                image::Rgb([255, 255, 255])
            }
        });
        let mask = ForegroundMask::from_gray(GrayImage::from_fn(10, 10, |x, _| {
            image::Luma([if x < 5 { 255 } else { 0 }])
        }));
        let q = quantize(&img, &mask, &QuantizeParams::new(3, 2.0));
        assert_eq!(q.palette.len(), 1);
        assert_eq!(q.labels.get_pixel(7, 3).0[0], NO_LABEL);
        assert_eq!(q.labels.get_pixel(2, 3).0[0], 0);
        assert_eq!(q.flattened.get_pixel(7, 3).0, [255, 255, 255]);
        assert!((q.palette[0].coverage - 100.0).abs() < 1e-9);
    }

    #[test]
    fn flattened_uses_only_palette_colors() {
        let img = RgbImage::from_fn(30, 30, |x, y| {
            let v = u8::try_from((x * 7 + y * 3) % 256).unwrap();
            image::Rgb([v, 255 - v, v / 2])
        });
        let q = quantize(&img, &all_foreground(30, 30), &QuantizeParams::new(4, 2.0));
        let colors: Vec<[u8; 3]> = q.palette.iter().map(|e| e.color.to_array()).collect();
        assert!(q.flattened.pixels().all(|p| colors.contains(&p.0)));
    }

    #[test]
    fn quantization_is_deterministic() {
        let img = RgbImage::from_fn(40, 40, |x, y| {
            let v = u8::try_from((x * 11 + y * 5) % 256).unwrap();
            image::Rgb([v, v / 3, 255 - v])
        });
        let mask = all_foreground(40, 40);
        let a = quantize(&img, &mask, &QuantizeParams::new(5, 2.0));
        let b = quantize(&img, &mask, &QuantizeParams::new(5, 2.0));
        assert_eq!(a.palette, b.palette);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn equal_counts_keep_cluster_order() {
        // Equal areas: the earlier bin key seeds first and stays first.
        let img = stripes(&[([0, 0, 200], 10), ([200, 0, 0], 10)], 10);
        let q = quantize(&img, &all_foreground(20, 10), &QuantizeParams::new(3, 2.0));
        assert_eq!(q.palette.len(), 2);
        assert_eq!(q.palette[0].pixel_count, q.palette[1].pixel_count);
        assert_eq!(q.palette[0].color, Color::new(0, 0, 200));
    }

    #[test]
    fn coverage_sorted_descending() {
        let img = stripes(&[([0, 0, 200], 5), ([200, 0, 0], 25), ([0, 160, 0], 10)], 10);
        let q = quantize(&img, &all_foreground(40, 10), &QuantizeParams::new(5, 2.0));
        assert!(
            q.palette
                .windows(2)
                .all(|w| w[0].coverage >= w[1].coverage)
        );
        assert_eq!(q.palette[0].color, Color::new(200, 0, 0));
    }
}
