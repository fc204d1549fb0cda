//! SVG document assembly.
//!
//! Every palette color that traced into at least one subpath becomes one
//! `<path>` element holding all of that color's subpaths. Paths are
//! emitted in palette order (descending coverage), so larger areas are
//! drawn first and smaller details are layered on top.
//!
//! The document carries a human-readable `<desc>` and a `<metadata>`
//! block with a JSON record of the palette and counts. Output is fully
//! determined by its inputs: no ids beyond the fixed group id and no
//! timestamps.

use serde::Serialize;
use svg::Document;
use svg::node::element::path::Data;
use svg::node::element::{Description, Element, Group, Path};
use svg::node::{Node, Text, Value};

use crate::trace::{Segment, Subpath, VectorPath};
use crate::types::{Color, Dimensions, ExtractorKind, PaletteEntry, Point, StyleLabel};

/// Namespace of the embedded metadata record.
pub const METADATA_NAMESPACE: &str = "https://scrawl.dev/ns/1";

/// Everything the assembler needs to build a document.
#[derive(Debug, Clone, Copy)]
pub struct Drawing<'a> {
    /// Palette in descending coverage order.
    pub palette: &'a [PaletteEntry],
    /// Traced paths, one per surviving region.
    pub paths: &'a [VectorPath],
    /// Size of the image as received.
    pub original_size: Dimensions,
    /// Size of the traced image; becomes the `viewBox`.
    pub processed_size: Dimensions,
    /// Style label recorded in the metadata.
    pub style: StyleLabel,
    /// Extractor recorded in the metadata.
    pub extractor: ExtractorKind,
    /// Fill each path with the complement of its palette color.
    pub invert_fill: bool,
}

impl Drawing<'_> {
    /// Number of regions that produced at least one subpath.
    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.paths.len()
    }

    /// Total number of subpaths.
    #[must_use]
    pub fn subpath_count(&self) -> usize {
        self.paths.iter().map(|p| p.subpaths.len()).sum()
    }

    /// Fill for a traced color, honouring `invert_fill`.
    fn fill(&self, color: Color) -> String {
        if self.invert_fill {
            color.complement().hex()
        } else {
            color.hex()
        }
    }
}

/// Palette entry as recorded in the metadata block.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaletteRecord {
    hex: String,
    fill: String,
    rgb: [u8; 3],
    coverage: f64,
}

/// JSON record embedded in `<metadata>`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DrawingRecord {
    palette: Vec<PaletteRecord>,
    color_count: usize,
    region_count: usize,
    subpath_count: usize,
    original_size: Dimensions,
    processed_size: Dimensions,
    style: StyleLabel,
    extractor: ExtractorKind,
}

/// Build the SVG document text.
#[must_use]
pub fn to_svg(drawing: &Drawing<'_>) -> String {
    let Dimensions { width, height } = drawing.processed_size;
    let mut doc = Document::new()
        .set("width", width)
        .set("height", height)
        .set("viewBox", (0, 0, width, height));

    doc = doc.add(Description::new().add(Text::new(describe(drawing))));

    match metadata_json(drawing) {
        Ok(json) => {
            let mut record_el = Element::new("scrawl:drawing");
            record_el.assign("xmlns:scrawl", METADATA_NAMESPACE);
            record_el.append(Text::new(json));
            let mut metadata_el = Element::new("metadata");
            metadata_el.append(record_el);
            doc = doc.add(metadata_el);
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize drawing metadata, omitting <metadata>");
        }
    }

    let mut group = Group::new().set("id", "drawing");
    for index in 0..drawing.palette.len() {
        let members: Vec<&VectorPath> = drawing
            .paths
            .iter()
            .filter(|p| p.palette_index == index)
            .collect();
        let Some(first) = members.first() else {
            continue;
        };
        let subpaths: Vec<&Subpath> = members.iter().flat_map(|p| &p.subpaths).collect();
        if subpaths.is_empty() {
            continue;
        }
        let path = Path::new()
            .set("fill", drawing.fill(first.color))
            .set("fill-rule", "nonzero")
            .set("d", build_path_data(&subpaths));
        group = group.add(path);
    }
    doc = doc.add(group);

    // The svg crate omits the XML declaration, so we prepend it.
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{doc}\n")
}

/// Build an SVG path `d` attribute from closed subpaths.
///
/// Each subpath starts with `M`, uses `L` around corners and `C` for
/// curves, and ends with `z`. Coordinates are rounded to 0.01 px.
///
/// ```
/// use scrawl_pipeline::Point;
/// use scrawl_pipeline::assemble::build_path_data;
/// use scrawl_pipeline::trace::{Segment, Subpath};
///
/// let triangle = Subpath {
///     start: Point::new(0.0, 0.0),
///     segments: vec![
///         Segment::Corner { vertex: Point::new(4.0, 0.0), end: Point::new(4.0, 3.0) },
///         Segment::Corner { vertex: Point::new(0.0, 3.0), end: Point::new(0.0, 0.0) },
///     ],
/// };
/// assert_eq!(build_path_data(&[&triangle]), "M0,0 L4,0 L4,3 L0,3 L0,0 z");
/// ```
#[must_use]
pub fn build_path_data(subpaths: &[&Subpath]) -> String {
    let mut data = Data::new();
    for subpath in subpaths {
        data = data.move_to(coords(&[subpath.start]));
        for segment in &subpath.segments {
            data = match *segment {
                Segment::Corner { vertex, end } => {
                    data.line_to(coords(&[vertex])).line_to(coords(&[end]))
                }
                Segment::Curve { c1, c2, end } => data.cubic_curve_to(coords(&[c1, c2, end])),
            };
        }
        data = data.close();
    }
    String::from(Value::from(data))
}

/// Flatten points into path parameters rounded to 0.01 px.
fn coords(points: &[Point]) -> Vec<f32> {
    points
        .iter()
        .flat_map(|p| [round_coord(p.x), round_coord(p.y)])
        .collect()
}

#[allow(clippy::cast_possible_truncation)]
fn round_coord(v: f64) -> f32 {
    // Adding zero turns -0 into 0.
    ((v * 100.0).round() / 100.0 + 0.0) as f32
}

/// One-line summary for `<desc>`.
fn describe(drawing: &Drawing<'_>) -> String {
    let hexes: Vec<String> = drawing.palette.iter().map(|e| e.color.hex()).collect();
    format!(
        "Vectorized drawing with {} colors ({}); original size {}; style {}",
        drawing.palette.len(),
        hexes.join(", "),
        drawing.original_size,
        drawing.style,
    )
}

fn metadata_json(drawing: &Drawing<'_>) -> Result<String, serde_json::Error> {
    let record = DrawingRecord {
        palette: drawing
            .palette
            .iter()
            .map(|entry| PaletteRecord {
                hex: entry.color.hex(),
                fill: drawing.fill(entry.color),
                rgb: entry.color.to_array(),
                coverage: (entry.coverage * 100.0).round() / 100.0,
            })
            .collect(),
        color_count: drawing.palette.len(),
        region_count: drawing.region_count(),
        subpath_count: drawing.subpath_count(),
        original_size: drawing.original_size,
        processed_size: drawing.processed_size,
        style: drawing.style,
        extractor: drawing.extractor,
    };
    serde_json::to_string(&record)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, side: f64) -> Subpath {
        let corner = |vx: f64, vy: f64, ex: f64, ey: f64| Segment::Corner {
            vertex: Point::new(vx, vy),
            end: Point::new(ex, ey),
        };
        Subpath {
            start: Point::new(x, y + side / 2.0),
            segments: vec![
                corner(x, y, x + side / 2.0, y),
                corner(x + side, y, x + side, y + side / 2.0),
                corner(x + side, y + side, x + side / 2.0, y + side),
                corner(x, y + side, x, y + side / 2.0),
            ],
        }
    }

    fn entry(color: Color, coverage: f64) -> PaletteEntry {
        PaletteEntry {
            color,
            pixel_count: 100,
            coverage,
        }
    }

    fn path(palette: &[PaletteEntry], palette_index: usize, subpaths: Vec<Subpath>) -> VectorPath {
        VectorPath {
            palette_index,
            color: palette[palette_index].color,
            source_region: 0,
            subpaths,
        }
    }

    fn drawing<'a>(palette: &'a [PaletteEntry], paths: &'a [VectorPath]) -> Drawing<'a> {
        Drawing {
            palette,
            paths,
            original_size: Dimensions::new(400, 300),
            processed_size: Dimensions::new(200, 150),
            style: StyleLabel::Authentic,
            extractor: ExtractorKind::Threshold,
            invert_fill: false,
        }
    }

    #[test]
    fn svg_has_xml_declaration_and_viewbox() {
        let svg = to_svg(&drawing(&[], &[]));
        assert!(svg.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<svg"));
        assert!(svg.contains("viewBox=\"0 0 200 150\""));
        assert!(svg.contains("width=\"200\""));
        assert!(svg.contains("xmlns=\"http://www.w3.org/2000/svg\""));
        assert!(svg.trim_end().ends_with("</svg>"));
    }

    #[test]
    fn one_path_per_color_in_palette_order() {
        let palette = [
            entry(Color::new(255, 0, 0), 60.0),
            entry(Color::new(0, 0, 255), 40.0),
        ];
        let paths = [
            path(&palette, 1, vec![square(50.0, 50.0, 10.0)]),
            path(&palette, 0, vec![square(0.0, 0.0, 10.0)]),
            path(&palette, 0, vec![square(20.0, 0.0, 10.0)]),
        ];
        let svg = to_svg(&drawing(&palette, &paths));
        assert_eq!(svg.matches("<path").count(), 2);
        let red = svg.find("fill=\"#ff0000\"").unwrap();
        let blue = svg.find("fill=\"#0000ff\"").unwrap();
        assert!(red < blue);
        assert_eq!(svg.matches(" z").count(), 3);
    }

    #[test]
    fn colors_without_subpaths_are_skipped() {
        let palette = [
            entry(Color::new(255, 0, 0), 60.0),
            entry(Color::new(0, 0, 255), 40.0),
        ];
        let paths = [path(&palette, 1, vec![square(0.0, 0.0, 10.0)])];
        let svg = to_svg(&drawing(&palette, &paths));
        assert_eq!(svg.matches("<path").count(), 1);
        assert!(!svg.contains("fill=\"#ff0000\""));
    }

    #[test]
    fn fill_comes_from_traced_color() {
        let palette = [entry(Color::new(255, 0, 0), 100.0)];
        let mut traced = path(&palette, 0, vec![square(0.0, 0.0, 10.0)]);
        traced.color = Color::new(1, 2, 3);
        let svg = to_svg(&drawing(&palette, &[traced]));
        assert!(svg.contains("fill=\"#010203\""));
        assert!(!svg.contains("fill=\"#ff0000\""));
    }

    #[test]
    fn invert_fill_complements_colors() {
        let palette = [entry(Color::new(255, 16, 0), 100.0)];
        let paths = [path(&palette, 0, vec![square(0.0, 0.0, 10.0)])];
        let mut inverted = drawing(&palette, &paths);
        inverted.invert_fill = true;
        let svg = to_svg(&inverted);
        assert!(svg.contains("fill=\"#00efff\""));
        assert!(!svg.contains("fill=\"#ff1000\""));
    }

    #[test]
    fn metadata_block_carries_palette_json() {
        let palette = [entry(Color::new(255, 0, 0), 66.666_666)];
        let paths = [path(&palette, 0, vec![square(0.0, 0.0, 10.0)])];
        let svg = to_svg(&drawing(&palette, &paths));
        assert!(svg.contains("<metadata>"));
        assert!(svg.contains("xmlns:scrawl=\"https://scrawl.dev/ns/1\""));
        assert!(svg.contains("66.67"));
        assert!(svg.contains("subpathCount"));
        assert!(svg.contains("threshold"));
    }

    #[test]
    fn metadata_payload_is_valid_json() {
        let palette = [
            entry(Color::new(255, 0, 0), 75.0),
            entry(Color::new(0, 0, 255), 25.0),
        ];
        let paths = [path(&palette, 0, vec![square(0.0, 0.0, 10.0)])];
        let svg = to_svg(&drawing(&palette, &paths));
        let open = "<scrawl:drawing xmlns:scrawl=\"https://scrawl.dev/ns/1\">";
        let start = svg.find(open).unwrap() + open.len();
        let end = svg.find("</scrawl:drawing>").unwrap();
        let payload = &svg[start..end];
        let record: serde_json::Value = serde_json::from_str(payload).unwrap();
        assert_eq!(record["colorCount"], 2);
        assert_eq!(record["regionCount"], 1);
        assert_eq!(record["palette"][1]["hex"], "#0000ff");
    }

    #[test]
    fn desc_lists_palette_and_style() {
        let palette = [entry(Color::new(255, 0, 0), 100.0)];
        let svg = to_svg(&drawing(&palette, &[]));
        assert!(svg.contains("<desc>"));
        assert!(svg.contains("#ff0000"));
        assert!(svg.contains("400x300"));
        assert!(svg.contains("authentic"));
    }

    #[test]
    fn output_is_deterministic() {
        let palette = [entry(Color::new(10, 20, 30), 100.0)];
        let paths = [path(&palette, 0, vec![square(1.5, 2.25, 7.0)])];
        assert_eq!(
            to_svg(&drawing(&palette, &paths)),
            to_svg(&drawing(&palette, &paths))
        );
    }

    #[test]
    fn curves_use_cubic_commands() {
        let subpath = Subpath {
            start: Point::new(0.0, 0.0),
            segments: vec![Segment::Curve {
                c1: Point::new(1.0, 2.0),
                c2: Point::new(3.0, 4.0),
                end: Point::new(0.0, 0.0),
            }],
        };
        assert_eq!(build_path_data(&[&subpath]), "M0,0 C1,2,3,4,0,0 z");
    }

    #[test]
    fn coordinates_are_rounded() {
        assert!((round_coord(1.234_56) - 1.23).abs() < 1e-6);
        assert!(round_coord(-0.001).is_sign_positive());
    }
}
