//! Boundary decomposition of a binary mask.
//!
//! Boundaries run along pixel edges on the `(width + 1) x (height + 1)`
//! corner lattice, always keeping the set pixels on the right. Outer
//! boundaries therefore wind clockwise on screen and have positive
//! signed area; holes wind the other way and have negative area.
//!
//! Where two set pixels touch only at a corner (a saddle), the walk
//! turns left, so diagonally touching pixels share one outline
//! (8-connectivity for the set pixels).

use image::GrayImage;

use crate::types::Point;

/// Edge directions, clockwise on screen.
const EAST: usize = 0;
const SOUTH: usize = 1;
const WEST: usize = 2;
const NORTH: usize = 3;

/// A closed boundary reduced to its corner vertices.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour {
    /// Corner vertices in walk order (the closing edge is implicit).
    pub points: Vec<Point>,
    /// Signed enclosed area: positive for outer boundaries, negative
    /// for holes.
    pub area: f64,
}

impl Contour {
    /// Whether this boundary encloses a hole.
    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.area < 0.0
    }
}

/// Trace every boundary of the non-zero pixels in `mask`.
///
/// Contours are returned in the scan order of their first edge, so an
/// outer boundary always precedes the holes it contains.
#[must_use = "returns the traced contours"]
pub fn trace_boundaries(mask: &GrayImage) -> Vec<Contour> {
    let lattice = Lattice::new(mask);
    let mut used = vec![false; lattice.present.len()];
    let mut contours = Vec::new();

    for start in 0..lattice.present.len() {
        if !lattice.present[start] || used[start] {
            continue;
        }
        let contour = lattice.walk(start, &mut used);
        if contour.points.len() >= 4 {
            contours.push(contour);
        }
    }
    contours
}

/// Number of boundaries whose enclosed area exceeds `min_area`.
#[must_use]
pub fn count_significant(mask: &GrayImage, min_area: f64) -> usize {
    trace_boundaries(mask)
        .iter()
        .filter(|c| c.area.abs() > min_area)
        .count()
}

/// Directed boundary edges keyed by `(vertex, direction)`.
struct Lattice {
    /// Vertices per lattice row (`width + 1`).
    stride: usize,
    present: Vec<bool>,
}

impl Lattice {
    fn new(mask: &GrayImage) -> Self {
        let (w, h) = mask.dimensions();
        let stride = w as usize + 1;
        let mut lattice = Self {
            stride,
            present: vec![false; stride * (h as usize + 1) * 4],
        };
        let set = |x: i64, y: i64| -> bool {
            x >= 0
                && y >= 0
                && x < i64::from(w)
                && y < i64::from(h)
                && u32::try_from(x)
                    .ok()
                    .zip(u32::try_from(y).ok())
                    .is_some_and(|(x, y)| mask.get_pixel(x, y).0[0] != 0)
        };
        for y in 0..i64::from(h) {
            for x in 0..i64::from(w) {
                if !set(x, y) {
                    continue;
                }
                if !set(x, y - 1) {
                    lattice.mark(x, y, EAST);
                }
                if !set(x + 1, y) {
                    lattice.mark(x + 1, y, SOUTH);
                }
                if !set(x, y + 1) {
                    lattice.mark(x + 1, y + 1, WEST);
                }
                if !set(x - 1, y) {
                    lattice.mark(x, y + 1, NORTH);
                }
            }
        }
        lattice
    }

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    fn mark(&mut self, vx: i64, vy: i64, dir: usize) {
        let id = self.edge(vx as usize, vy as usize, dir);
        self.present[id] = true;
    }

    const fn edge(&self, vx: usize, vy: usize, dir: usize) -> usize {
        (vy * self.stride + vx) * 4 + dir
    }

    /// Follow edges from `start` until the walk closes.
    fn walk(&self, start: usize, used: &mut [bool]) -> Contour {
        let mut vertices: Vec<(usize, usize)> = Vec::new();
        let mut dirs: Vec<usize> = Vec::new();
        let mut id = start;
        loop {
            used[id] = true;
            let dir = id % 4;
            let vertex = id / 4;
            let (vx, vy) = (vertex % self.stride, vertex / self.stride);
            vertices.push((vx, vy));
            dirs.push(dir);

            let (nx, ny) = match dir {
                EAST => (vx + 1, vy),
                SOUTH => (vx, vy + 1),
                WEST => (vx - 1, vy),
                _ => (vx, vy - 1),
            };
            // Left, straight, right: left first keeps diagonal pixels joined.
            let next = [(dir + 3) % 4, dir, (dir + 1) % 4]
                .into_iter()
                .map(|d| self.edge(nx, ny, d))
                .find(|&candidate| {
                    self.present[candidate] && (candidate == start || !used[candidate])
                });
            match next {
                Some(next) if next != start => id = next,
                _ => break,
            }
        }

        let n = dirs.len();
        let points: Vec<Point> = (0..n)
            .filter(|&i| dirs[i] != dirs[(i + n - 1) % n])
            .map(|i| {
                let (x, y) = vertices[i];
                #[allow(clippy::cast_precision_loss)]
                let point = Point::new(x as f64, y as f64);
                point
            })
            .collect();
        let area = signed_area(&points);
        Contour { points, area }
    }
}

/// Shoelace area; positive for clockwise-on-screen (y down) polygons.
#[must_use]
pub fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f64 = (0..n)
        .map(|i| {
            let a = points[i];
            let b = points[(i + 1) % n];
            a.x.mul_add(b.y, -(b.x * a.y))
        })
        .sum();
    twice / 2.0
}
