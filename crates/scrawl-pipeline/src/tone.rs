//! Tone normalization: even out lighting and denoise without softening
//! stroke edges.
//!
//! Two passes run in CIE L*a*b*, touching foreground pixels only:
//!
//! 1. Contrast-limited adaptive histogram equalization (CLAHE) of L*.
//!    Histograms are built per tile from foreground pixels, clipped,
//!    and blended bilinearly between tile centers. a* and b* are left
//!    alone.
//! 2. A bilateral filter whose range kernel suppresses averaging across
//!    color edges. Background neighbours never contribute.
//!
//! Background pixels stay pure white.

use lab::Lab;

use crate::color;
use crate::types::{Color, ForegroundMask, RgbImage};

/// Normalizer tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneParams {
    /// CLAHE clip limit, as a multiple of the mean bin height.
    pub clip_limit: f64,
    /// CLAHE tiles along each axis.
    pub grid_size: u32,
    /// Bilateral window radius in pixels.
    pub radius: u32,
    /// Bilateral spatial sigma in pixels.
    pub sigma_space: f32,
    /// Bilateral range sigma in ΔE units.
    pub sigma_color: f32,
}

impl Default for ToneParams {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            grid_size: 8,
            radius: 3,
            sigma_space: 3.0,
            sigma_color: 12.0,
        }
    }
}

/// Normalize tone inside the foreground.
#[must_use = "returns the normalized image"]
pub fn normalize_tone(image: &RgbImage, mask: &ForegroundMask, params: &ToneParams) -> RgbImage {
    let (width, height) = image.dimensions();
    let inside: Vec<bool> = mask.as_image().pixels().map(|p| p.0[0] != 0).collect();
    let mut labs = color::image_to_labs(image);

    equalize_lightness(&mut labs, &inside, width, height, params);
    let mut labs = bilateral(&labs, &inside, width, height, params);

    let white = color::color_to_lab(Color::WHITE);
    for (lab, &fg) in labs.iter_mut().zip(&inside) {
        if !fg {
            *lab = white;
        }
    }
    let mut out = color::labs_to_image(&labs, width, height).unwrap_or_else(|| image.clone());
    // Lab round trips of white can land a unit short of 255.
    for (px, &fg) in out.pixels_mut().zip(&inside) {
        if !fg {
            px.0 = Color::WHITE.to_array();
        }
    }
    out
}

/// Map an L* value (0-100) to a histogram bin.
fn lightness_bin(l: f32) -> usize {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let bin = (l * 2.55).round().clamp(0.0, 255.0) as usize;
    bin
}

/// CLAHE tile layout over an image.
#[derive(Debug, Clone, Copy)]
struct TileGrid {
    width: u32,
    height: u32,
    tile_w: u32,
    tile_h: u32,
    tiles_x: u32,
    tiles_y: u32,
}

impl TileGrid {
    fn new(width: u32, height: u32, grid_size: u32) -> Self {
        let grid = grid_size.max(1);
        let tile_w = width.div_ceil(grid).max(1);
        let tile_h = height.div_ceil(grid).max(1);
        Self {
            width,
            height,
            tile_w,
            tile_h,
            tiles_x: width.div_ceil(tile_w),
            tiles_y: height.div_ceil(tile_h),
        }
    }

    /// Build one clipped lookup table per tile.
    ///
    /// Tiles without foreground pixels get the identity table.
    fn tables(&self, labs: &[Lab], inside: &[bool], clip_limit: f64) -> Vec<[f32; 256]> {
        let mut tables = Vec::with_capacity((self.tiles_x * self.tiles_y) as usize);
        for ty in 0..self.tiles_y {
            for tx in 0..self.tiles_x {
                let mut hist = [0f64; 256];
                let mut n = 0u64;
                for y in (ty * self.tile_h)..((ty + 1) * self.tile_h).min(self.height) {
                    for x in (tx * self.tile_w)..((tx + 1) * self.tile_w).min(self.width) {
                        let idx = (y * self.width + x) as usize;
                        if inside[idx] {
                            hist[lightness_bin(labs[idx].l)] += 1.0;
                            n += 1;
                        }
                    }
                }
                tables.push(clipped_table(&mut hist, n, clip_limit));
            }
        }
        tables
    }
}

/// Position of pixel `p` in tile-center coordinates along one axis:
/// the two neighbouring tiles and the blend weight of the second.
fn tile_axis(p: u32, tile: u32, tiles: u32) -> (u32, u32, f32) {
    #[allow(clippy::cast_precision_loss)]
    let f = (p as f32 + 0.5) / tile as f32 - 0.5;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let t0 = (f.floor().max(0.0) as u32).min(tiles - 1);
    let t1 = (t0 + 1).min(tiles - 1);
    #[allow(clippy::cast_precision_loss)]
    let w = (f - t0 as f32).clamp(0.0, 1.0);
    (t0, t1, w)
}

/// Clip a histogram, redistribute the excess evenly, and return the
/// cumulative mapping to L* (0-100).
fn clipped_table(hist: &mut [f64; 256], n: u64, clip_limit: f64) -> [f32; 256] {
    let mut table = [0f32; 256];
    if n == 0 {
        for (v, slot) in table.iter_mut().enumerate() {
            #[allow(clippy::cast_precision_loss)]
            let l = v as f32 / 2.55;
            *slot = l;
        }
        return table;
    }
    #[allow(clippy::cast_precision_loss)]
    let total = n as f64;
    let limit = (clip_limit * total / 256.0).max(1.0);
    let mut excess = 0.0;
    for h in hist.iter_mut() {
        if *h > limit {
            excess += *h - limit;
            *h = limit;
        }
    }
    let bonus = excess / 256.0;
    let mut cdf = 0.0;
    for (h, slot) in hist.iter().zip(table.iter_mut()) {
        cdf += h + bonus;
        #[allow(clippy::cast_possible_truncation)]
        let l = (cdf / total * 100.0).min(100.0) as f32;
        *slot = l;
    }
    table
}

/// CLAHE on the L* channel of foreground pixels.
fn equalize_lightness(
    labs: &mut [Lab],
    inside: &[bool],
    width: u32,
    height: u32,
    params: &ToneParams,
) {
    let grid = TileGrid::new(width, height, params.grid_size);
    let tables = grid.tables(labs, inside, params.clip_limit);

    for y in 0..height {
        let (ty0, ty1, wy) = tile_axis(y, grid.tile_h, grid.tiles_y);
        for x in 0..width {
            let idx = (y * width + x) as usize;
            if !inside[idx] {
                continue;
            }
            let (tx0, tx1, wx) = tile_axis(x, grid.tile_w, grid.tiles_x);
            let bin = lightness_bin(labs[idx].l);
            let at = |tx: u32, ty: u32| tables[(ty * grid.tiles_x + tx) as usize][bin];
            let top = (at(tx1, ty0) - at(tx0, ty0)).mul_add(wx, at(tx0, ty0));
            let bottom = (at(tx1, ty1) - at(tx0, ty1)).mul_add(wx, at(tx0, ty1));
            labs[idx].l = (bottom - top).mul_add(wy, top);
        }
    }
}

/// Edge-preserving smoothing over foreground neighbours.
fn bilateral(
    labs: &[Lab],
    inside: &[bool],
    width: u32,
    height: u32,
    params: &ToneParams,
) -> Vec<Lab> {
    let r = i64::from(params.radius);
    let space_denom = 2.0 * params.sigma_space * params.sigma_space;
    let color_denom = 2.0 * params.sigma_color * params.sigma_color;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let side = (2 * r + 1) as usize;
    let mut spatial = vec![0f32; side * side];
    for dy in -r..=r {
        for dx in -r..=r {
            #[allow(clippy::cast_precision_loss)]
            let d2 = (dx * dx + dy * dy) as f32;
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let slot = ((dy + r) as usize) * side + (dx + r) as usize;
            spatial[slot] = (-d2 / space_denom).exp();
        }
    }

    let (w, h) = (i64::from(width), i64::from(height));
    let mut out = labs.to_vec();
    for y in 0..h {
        for x in 0..w {
            #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let idx = (y * w + x) as usize;
            if !inside[idx] {
                continue;
            }
            let center = labs[idx];
            let (mut sum_w, mut l, mut a, mut b) = (0f32, 0f32, 0f32, 0f32);
            for ny in (y - r).max(0)..=(y + r).min(h - 1) {
                for nx in (x - r).max(0)..=(x + r).min(w - 1) {
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    let nidx = (ny * w + nx) as usize;
                    if !inside[nidx] {
                        continue;
                    }
                    let neighbour = &labs[nidx];
                    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                    let slot = ((ny - y + r) as usize) * side + (nx - x + r) as usize;
                    let weight =
                        spatial[slot] * (-color::delta_e_sq(&center, neighbour) / color_denom).exp();
                    sum_w += weight;
                    l = weight.mul_add(neighbour.l, l);
                    a = weight.mul_add(neighbour.a, a);
                    b = weight.mul_add(neighbour.b, b);
                }
            }
            // The center always contributes weight 1.
            out[idx] = Lab {
                l: l / sum_w,
                a: a / sum_w,
                b: b / sum_w,
            };
        }
    }
    out
}
