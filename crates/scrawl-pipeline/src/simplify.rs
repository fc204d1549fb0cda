//! Polygon simplification using the Ramer-Douglas-Peucker algorithm.
//!
//! Boundary polygons come off the pixel lattice as staircases. RDP
//! removes vertices within a tolerance of the chord between their kept
//! neighbours, which straightens staircases into the diagonal they
//! approximate while keeping genuine corners.
//!
//! Polygons are closed: the first vertex and the vertex farthest from
//! it are both anchored, and each half of the ring is simplified
//! separately.

use crate::types::Point;

/// Simplify a closed polygon.
///
/// A tolerance of 0.0 only drops exactly collinear vertices. If
/// simplification would leave fewer than three vertices the polygon is
/// returned unchanged.
#[must_use = "returns the simplified polygon"]
pub fn simplify_closed(points: &[Point], tolerance: f64) -> Vec<Point> {
    let n = points.len();
    if n <= 3 {
        return points.to_vec();
    }

    let far = (1..n)
        .max_by(|&a, &b| {
            points[0]
                .distance_squared(points[a])
                .total_cmp(&points[0].distance_squared(points[b]))
                .then(b.cmp(&a))
        })
        .unwrap_or(n / 2);

    // Ring with the first vertex repeated at the end.
    let mut ring = points.to_vec();
    ring.push(points[0]);

    let mut kept = vec![false; ring.len()];
    kept[0] = true;
    kept[far] = true;
    simplify_arc(&ring, 0, far, tolerance, &mut kept);
    simplify_arc(&ring, far, n, tolerance, &mut kept);

    let simplified: Vec<Point> = points
        .iter()
        .zip(&kept)
        .filter(|&(_, k)| *k)
        .map(|(&p, _)| p)
        .collect();

    if simplified.len() < 3 {
        return points.to_vec();
    }
    simplified
}

/// Simplify one arc of a closed ring in place.
///
/// `ring` repeats its first vertex at the end, so the arc closing the
/// polygon is `far..n` with both endpoints addressable. The arc's
/// endpoints are anchors and are never dropped; interior vertices are
/// kept only when they sit farther than `tolerance` from the chord of
/// the sub-arc they split. Pending sub-arcs live on an explicit stack.
fn simplify_arc(ring: &[Point], start: usize, end: usize, tolerance: f64, kept: &mut [bool]) {
    let mut pending = vec![(start, end)];
    while let Some((lo, hi)) = pending.pop() {
        if hi <= lo + 1 {
            continue;
        }
        let (split, dist) = ((lo + 1)..hi)
            .map(|i| (i, distance_to_chord(ring[i], ring[lo], ring[hi])))
            .fold((lo, 0.0), |best, cand| if cand.1 > best.1 { cand } else { best });
        if dist > tolerance {
            kept[split] = true;
            pending.push((split, hi));
            pending.push((lo, split));
        }
    }
}

/// Distance from `p` to the infinite line through chord `a`-`b`.
///
/// On a ring the chord endpoints only coincide when every vertex of the
/// arc is at one spot, so a zero-length chord measures straight to `a`.
fn distance_to_chord(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let chord_sq = dx.mul_add(dx, dy * dy);
    if chord_sq == 0.0 {
        return p.distance(a);
    }
    dx.mul_add(a.y - p.y, -(dy * (a.x - p.x))).abs() / chord_sq.sqrt()
}
