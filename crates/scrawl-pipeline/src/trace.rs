//! Bitmap-to-vector tracing of color regions.
//!
//! Follows the Potrace recipe in three steps:
//!
//! 1. Decompose the region mask into closed pixel-edge boundaries
//!    ([`crate::boundary`]) and drop those enclosing no more than the
//!    speckle size.
//! 2. Reduce each boundary to a polygon with
//!    [`simplify_closed`](crate::simplify::simplify_closed). The
//!    tolerance grows with the curve-fit tolerance, so clean output is
//!    straighter than authentic output.
//! 3. Smooth the polygon: at every vertex, decide from how sharply the
//!    outline turns whether to keep a corner or replace it with a cubic
//!    Bezier through the midpoints of the adjacent edges.
//!
//! Coordinates are emitted in image space.

use crate::boundary::trace_boundaries;
use crate::segment::ColorRegion;
use crate::simplify::simplify_closed;
use crate::types::{Color, PaletteEntry, Point};

/// Tracing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceParams {
    /// Boundaries enclosing this area or less are dropped.
    pub turd_size: f64,
    /// Corner threshold: vertices whose smoothness reaches this value
    /// stay sharp.
    pub alpha_max: f64,
    /// Curve-fit tolerance in pixels.
    pub opt_tolerance: f64,
}

impl TraceParams {
    /// Default corner threshold.
    pub const DEFAULT_ALPHA_MAX: f64 = 1.0;
    /// Curve-fit tolerance used when preserving style.
    pub const AUTHENTIC_TOLERANCE: f64 = 0.2;
    /// Curve-fit tolerance used for clean output.
    pub const CLEAN_TOLERANCE: f64 = 0.4;

    /// Parameters for the given style and speckle size.
    #[must_use]
    pub const fn new(preserve_style: bool, trace_smoothing: f64) -> Self {
        Self {
            turd_size: trace_smoothing,
            alpha_max: Self::DEFAULT_ALPHA_MAX,
            opt_tolerance: if preserve_style {
                Self::AUTHENTIC_TOLERANCE
            } else {
                Self::CLEAN_TOLERANCE
            },
        }
    }

    /// Polygon simplification tolerance in pixels.
    ///
    /// Staircase vertices sit about 0.71 px from the line they
    /// approximate, so anything below that keeps every step.
    #[must_use]
    pub fn simplify_tolerance(&self) -> f64 {
        0.5 + self.opt_tolerance
    }
}

/// One segment of a traced outline, starting where the previous
/// segment ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment {
    /// Straight line to `vertex`, then straight line to `end`.
    Corner {
        /// The sharp vertex.
        vertex: Point,
        /// Segment end point.
        end: Point,
    },
    /// Cubic Bezier curve to `end`.
    Curve {
        /// First control point.
        c1: Point,
        /// Second control point.
        c2: Point,
        /// Segment end point.
        end: Point,
    },
}

impl Segment {
    /// Where this segment ends.
    #[must_use]
    pub const fn end(&self) -> Point {
        match *self {
            Self::Corner { end, .. } | Self::Curve { end, .. } => end,
        }
    }
}

/// One closed outline. The last segment ends at `start`.
#[derive(Debug, Clone, PartialEq)]
pub struct Subpath {
    /// Starting point.
    pub start: Point,
    /// Segments in drawing order.
    pub segments: Vec<Segment>,
}

/// All outlines traced from one region.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPath {
    /// Index of the palette entry the region was built from.
    pub palette_index: usize,
    /// Fill color taken from the palette entry, before any inversion.
    pub color: Color,
    /// Index of the source region in the segmentation output.
    pub source_region: usize,
    /// Outer boundaries wind clockwise on screen and holes the other
    /// way, so a nonzero fill renders holes as holes.
    pub subpaths: Vec<Subpath>,
}

/// A region that produced no usable outline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// Every boundary was at or below the speckle size.
    #[error("region {region} has no boundary above the speckle size")]
    Degenerate {
        /// Index of the region in the segmentation output.
        region: usize,
    },
    /// The region's palette index has no palette entry.
    #[error("region {region} refers to missing palette entry {palette_index}")]
    MissingColor {
        /// Index of the region in the segmentation output.
        region: usize,
        /// The dangling palette index.
        palette_index: usize,
    },
}

/// Output of [`trace_regions`].
#[derive(Debug, Clone)]
pub struct TraceOutput {
    /// One path per region that produced at least one subpath.
    pub paths: Vec<VectorPath>,
    /// Regions skipped as degenerate.
    pub skipped: usize,
}

impl TraceOutput {
    /// Total subpaths across all paths.
    #[must_use]
    pub fn subpath_count(&self) -> usize {
        self.paths.iter().map(|p| p.subpaths.len()).sum()
    }
}

/// Trace one region into closed subpaths.
///
/// # Errors
///
/// Returns [`TraceError::Degenerate`] when no boundary survives the
/// speckle filter. Returns [`TraceError::MissingColor`] when the region
/// refers to a palette entry that does not exist.
pub fn trace_region(
    index: usize,
    region: &ColorRegion,
    palette: &[PaletteEntry],
    params: &TraceParams,
) -> Result<VectorPath, TraceError> {
    let entry = palette
        .get(region.palette_index)
        .ok_or(TraceError::MissingColor {
            region: index,
            palette_index: region.palette_index,
        })?;

    let bbox = region.bounding_box;
    let subpaths: Vec<Subpath> = trace_boundaries(&region.mask)
        .into_iter()
        .filter(|contour| contour.area.abs() > params.turd_size)
        .filter_map(|contour| {
            let points: Vec<Point> = contour
                .points
                .iter()
                .map(|p| p.offset(bbox.x, bbox.y))
                .collect();
            let polygon = simplify_closed(&points, params.simplify_tolerance());
            smooth(&polygon, params.alpha_max)
        })
        .collect();

    if subpaths.is_empty() {
        return Err(TraceError::Degenerate { region: index });
    }
    Ok(VectorPath {
        palette_index: region.palette_index,
        color: entry.color,
        source_region: index,
        subpaths,
    })
}

/// Trace every region, skipping the ones that yield nothing.
#[must_use = "returns the traced paths"]
pub fn trace_regions(
    regions: &[ColorRegion],
    palette: &[PaletteEntry],
    params: &TraceParams,
) -> TraceOutput {
    let mut traced = TraceOutput {
        paths: Vec::with_capacity(regions.len()),
        skipped: 0,
    };
    for (index, region) in regions.iter().enumerate() {
        match trace_region(index, region, palette, params) {
            Ok(path) => traced.paths.push(path),
            Err(e) => {
                tracing::debug!(error = %e, "skipping region");
                traced.skipped += 1;
            }
        }
    }
    traced
}

/// Fit corners and curves to a closed polygon.
///
/// Segment `j` runs from the midpoint of edge `(v[j-1], v[j])` to the
/// midpoint of edge `(v[j], v[j+1])`, bending around vertex `v[j]`.
fn smooth(vertices: &[Point], alpha_max: f64) -> Option<Subpath> {
    let m = vertices.len();
    if m < 3 {
        return None;
    }

    let segments = (0..m)
        .map(|j| {
            let vi = vertices[(j + m - 1) % m];
            let vj = vertices[j];
            let vk = vertices[(j + 1) % m];
            let end = vj.lerp(vk, 0.5);

            let denom = ddenom(vi, vk);
            let alpha = if denom == 0.0 {
                4.0 / 3.0
            } else {
                let dd = (dpara(vi, vj, vk) / denom).abs();
                let alpha = if dd > 1.0 { 1.0 - 1.0 / dd } else { 0.0 };
                alpha / 0.75
            };

            if alpha >= alpha_max {
                Segment::Corner { vertex: vj, end }
            } else {
                let alpha = alpha.clamp(0.55, 1.0);
                let t = 0.5f64.mul_add(alpha, 0.5);
                Segment::Curve {
                    c1: vi.lerp(vj, t),
                    c2: vk.lerp(vj, t),
                    end,
                }
            }
        })
        .collect();

    Some(Subpath {
        start: vertices[m - 1].lerp(vertices[0], 0.5),
        segments,
    })
}

/// Twice the signed area of the triangle `(p0, p1, p2)`.
fn dpara(p0: Point, p1: Point, p2: Point) -> f64 {
    let (x1, y1) = (p1.x - p0.x, p1.y - p0.y);
    let (x2, y2) = (p2.x - p0.x, p2.y - p0.y);
    x1.mul_add(y2, -(x2 * y1))
}

/// Normalizing denominator for [`dpara`]: the chord `p0 -> p2` measured
/// against the L-infinity unit normal.
fn ddenom(p0: Point, p2: Point) -> f64 {
    let (nx, ny) = dorth_infty(p0, p2);
    ny.mul_add(p2.x - p0.x, -(nx * (p2.y - p0.y)))
}

/// Direction orthogonal to `p0 -> p2`, restricted to `{-1, 0, 1}` per axis.
fn dorth_infty(p0: Point, p2: Point) -> (f64, f64) {
    (-sign(p2.y - p0.y), sign(p2.x - p0.x))
}

fn sign(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}
