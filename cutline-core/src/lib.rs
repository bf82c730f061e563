use std::fmt::Write;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CutError {
    #[error("image dimensions must be positive")]
    InvalidDimensions,
    #[error("maximum piece count is below the minimum")]
    InvalidPieceCount,
    #[error("unknown cut-line variant: {0}")]
    UnknownVariant(String),
}

/// How the planner rounds the exact row/column counts.
///
/// With `AtLeast` (the default) the final piece count may exceed the
/// request slightly. `AtMost` rounds down instead and never
/// overshoots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rounding {
    #[default]
    AtLeast,
    AtMost,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GridPlanner {
    /// Minimum piece edge length in pixels; 0 disables the fit cap.
    pub min_piece_edge: f64,
    pub min_count: u32,
    pub max_count: u32,
    pub rounding: Rounding,
}

impl Default for GridPlanner {
    fn default() -> Self {
        Self {
            min_piece_edge: 42.0,
            min_count: 9,
            max_count: 150_000,
            rounding: Rounding::AtLeast,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridLayout {
    pub rows: u32,
    pub cols: u32,
    pub piece_width: f64,
    pub piece_height: f64,
    pub image_width: f64,
    pub image_height: f64,
}

impl GridLayout {
    pub fn piece_count(&self) -> u32 {
        self.rows * self.cols
    }
}

impl GridPlanner {
    /// Turn a target piece count into a grid that fits the image.
    ///
    /// A `target_pieces` of 0 means unconstrained: the minimum piece
    /// edge alone decides how many pieces fit.
    pub fn plan(&self, width: f64, height: f64, target_pieces: u32) -> Result<GridLayout, CutError> {
        if width <= 0.0 || height <= 0.0 {
            return Err(CutError::InvalidDimensions);
        }
        if self.max_count < self.min_count {
            return Err(CutError::InvalidPieceCount);
        }
        let mut pieces = target_pieces;
        if self.min_piece_edge > 0.0 {
            // Cap at the count that keeps every piece at least one
            // minimum edge on a side.
            let fit = ((width / self.min_piece_edge).floor()
                * (height / self.min_piece_edge).floor()) as u32;
            pieces = if pieces > 0 { pieces.min(fit) } else { fit };
        }
        let pieces = pieces.clamp(self.min_count, self.max_count);

        // rows = H/s and cols = W/s with s = sqrt(W*H/p). Folding each
        // into a single radical keeps large integer inputs from
        // drifting across the rounding threshold.
        let p = f64::from(pieces);
        let rows_exact = (height * p / width).sqrt();
        let cols_exact = (width * p / height).sqrt();
        let (rows, cols) = match self.rounding {
            Rounding::AtLeast => (rows_exact.ceil(), cols_exact.ceil()),
            Rounding::AtMost => (rows_exact.floor(), cols_exact.floor()),
        };
        let rows = (rows as u32).max(1);
        let cols = (cols as u32).max(1);
        Ok(GridLayout {
            rows,
            cols,
            piece_width: width / f64::from(cols),
            piece_height: height / f64::from(rows),
            image_width: width,
            image_height: height,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NubVariant {
    Interlocking,
    Stochastic,
}

/// Name → variant table, built once at startup and passed to the
/// generator. Selection stays a value lookup, never an ambient global.
pub struct NubRegistry {
    entries: Vec<(&'static str, NubVariant)>,
}

impl NubRegistry {
    pub fn standard() -> Self {
        Self {
            entries: vec![
                ("interlockingnubs", NubVariant::Interlocking),
                ("stochasticnubs", NubVariant::Stochastic),
            ],
        }
    }

    pub fn resolve(&self, name: &str) -> Result<NubVariant, CutError> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| CutError::UnknownVariant(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(n, _)| *n)
    }
}

#[derive(Clone, Copy)]
enum Axis {
    Horizontal,
    Vertical,
}

/// One tab's proportions. `shoulder` is the straight run on each side
/// as a fraction of the span, `apex` the protrusion as a fraction of
/// the available depth, `flip` the side the tab bulges toward.
struct NubShape {
    shoulder: f64,
    apex: f64,
    flip: bool,
}

impl NubVariant {
    fn shape(self, line: u32, cell: u32, rng: &mut StdRng) -> NubShape {
        match self {
            // Fixed proportions, direction alternating by grid parity.
            NubVariant::Interlocking => NubShape {
                shoulder: 0.40,
                apex: 0.20,
                flip: (line + cell) % 2 == 0,
            },
            NubVariant::Stochastic => NubShape {
                shoulder: rng.random_range(0.32..=0.42),
                apex: rng.random_range(0.16..=0.26),
                flip: rng.random(),
            },
        }
    }

    /// One nub along a horizontal cut: advances `span` in x, returns to
    /// the baseline in y.
    pub fn horizontal_path(
        self,
        span: f64,
        depth: f64,
        line: u32,
        cell: u32,
        rng: &mut StdRng,
    ) -> String {
        render_nub(Axis::Horizontal, self.shape(line, cell, rng), span, depth)
    }

    /// One nub along a vertical cut: advances `span` in y, returns to
    /// the baseline in x.
    pub fn vertical_path(
        self,
        span: f64,
        depth: f64,
        line: u32,
        cell: u32,
        rng: &mut StdRng,
    ) -> String {
        render_nub(Axis::Vertical, self.shape(line, cell, rng), span, depth)
    }
}

fn render_nub(axis: Axis, shape: NubShape, span: f64, depth: f64) -> String {
    let run = shape.shoulder * span;
    let neck = (0.5 - shape.shoulder) * span;
    // Lateral apex offset; sign picks which neighbor gets the tab.
    let d = if shape.flip {
        shape.apex * depth
    } else {
        -(shape.apex * depth)
    };
    let xy = |adv: f64, lat: f64| match axis {
        Axis::Horizontal => (adv, lat),
        Axis::Vertical => (lat, adv),
    };
    let mut out = String::new();
    let (x, y) = xy(run, 0.0);
    let _ = write!(out, "l {x:.3} {y:.3} ");
    // Into the apex; the bulb control points swing back over the neck
    // so the tab is wider than its throat.
    let (c1x, c1y) = xy(-neck, 0.6 * d);
    let (c2x, c2y) = xy(-neck, d);
    let (ex, ey) = xy(neck, d);
    let _ = write!(out, "c {c1x:.3} {c1y:.3} {c2x:.3} {c2y:.3} {ex:.3} {ey:.3} ");
    // Mirror back down to the baseline.
    let (c1x, c1y) = xy(2.0 * neck, 0.0);
    let (c2x, c2y) = xy(2.0 * neck, -0.4 * d);
    let (ex, ey) = xy(neck, -d);
    let _ = write!(out, "c {c1x:.3} {c1y:.3} {c2x:.3} {c2y:.3} {ex:.3} {ey:.3} ");
    let (x, y) = xy(run, 0.0);
    let _ = write!(out, "l {x:.3} {y:.3}");
    out
}

/// Emits the full cut-line drawing for one grid layout.
pub struct CutLineGenerator {
    variant: NubVariant,
    seed: u64,
}

impl CutLineGenerator {
    pub fn new(registry: &NubRegistry, variant_name: &str, seed: u64) -> Result<Self, CutError> {
        Ok(Self {
            variant: registry.resolve(variant_name)?,
            seed,
        })
    }

    /// Build the SVG document the raster cutter consumes. The document
    /// pixel size equals the image size with a one-to-one viewBox, so
    /// cutting happens in source pixel space. Same layout + variant +
    /// seed reproduces the output byte for byte.
    pub fn generate(&self, layout: &GridLayout) -> String {
        let w = fmt_px(layout.image_width);
        let h = fmt_px(layout.image_height);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut s = String::new();
        s.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            s,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\" preserveAspectRatio=\"none\" shape-rendering=\"geometricPrecision\">"
        );
        s.push_str("<title>Jigsaw puzzle piece clips</title>\n");
        let _ = writeln!(s, "<desc>Piece count: {}</desc>", layout.piece_count());
        let _ = writeln!(
            s,
            "<rect x=\"0\" y=\"0\" width=\"{w}\" height=\"{h}\" fill=\"white\"/>"
        );
        s.push_str("<g>\n");
        for i in 0..layout.cols.saturating_sub(1) {
            let x = f64::from(i + 1) * layout.piece_width;
            let mut d = format!("M 0 0 L {} 0 ", fmt_px(x));
            for j in 0..layout.rows {
                let nub = self.variant.vertical_path(
                    layout.piece_height,
                    layout.piece_width,
                    i,
                    j,
                    &mut rng,
                );
                d.push_str(&nub);
                d.push(' ');
            }
            let _ = write!(d, "L 0 {h}");
            push_cut_path(&mut s, &d);
        }
        s.push_str("</g>\n<g>\n");
        for i in 0..layout.rows.saturating_sub(1) {
            let y = f64::from(i + 1) * layout.piece_height;
            let mut d = format!("M 0 0 L 0 {} ", fmt_px(y));
            for j in 0..layout.cols {
                let nub = self.variant.horizontal_path(
                    layout.piece_width,
                    layout.piece_height,
                    i,
                    j,
                    &mut rng,
                );
                d.push_str(&nub);
                d.push(' ');
            }
            let _ = write!(d, "L {w} 0");
            push_cut_path(&mut s, &d);
        }
        s.push_str("</g>\n</svg>\n");
        s
    }
}

fn push_cut_path(s: &mut String, d: &str) {
    let _ = writeln!(
        s,
        "<path d=\"{d}\" stroke=\"black\" stroke-width=\"1\" style=\"vector-effect:non-scaling-stroke;\" fill=\"none\"/>"
    );
}

// Near-integers as integers, else up to 3 decimals with zeros trimmed.
fn fmt_px(v: f64) -> String {
    if (v - v.round()).abs() < 1e-6 {
        format!("{:.0}", v)
    } else {
        format!("{:.3}", v)
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> GridPlanner {
        GridPlanner::default()
    }

    #[test]
    fn plan_worked_example_rounds_up() {
        let layout = planner().plan(1000.0, 800.0, 12).unwrap();
        // sqrt(800*12/1000) = 3.098.. and sqrt(1000*12/800) = 3.873..
        // both ceil to 4.
        assert_eq!((layout.rows, layout.cols), (4, 4));
        assert!(layout.piece_count() >= 12);
        assert_eq!(layout.piece_width, 1000.0 / 4.0);
        assert_eq!(layout.piece_height, 800.0 / 4.0);
    }

    #[test]
    fn plan_is_deterministic() {
        let a = planner().plan(1920.0, 1080.0, 500).unwrap();
        let b = planner().plan(1920.0, 1080.0, 500).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn plan_clamps_to_minimum_count() {
        // Only 2x2 pieces of edge 42 fit in 100x100; the absolute
        // minimum of 9 still wins. A playable count beats the edge
        // floor.
        let layout = planner().plan(100.0, 100.0, 1000).unwrap();
        assert_eq!(layout.piece_count(), 9);
        assert_eq!((layout.rows, layout.cols), (3, 3));
    }

    #[test]
    fn plan_unconstrained_uses_edge_fit() {
        let layout = planner().plan(420.0, 420.0, 0).unwrap();
        // floor(420/42)^2 = 100 pieces fit exactly.
        assert_eq!((layout.rows, layout.cols), (10, 10));
    }

    #[test]
    fn plan_at_most_never_overshoots() {
        let p = GridPlanner {
            rounding: Rounding::AtMost,
            ..GridPlanner::default()
        };
        let layout = p.plan(1000.0, 800.0, 12).unwrap();
        assert!(layout.piece_count() <= 12);
        assert!(layout.rows >= 1 && layout.cols >= 1);
    }

    #[test]
    fn plan_rejects_bad_dimensions() {
        assert!(matches!(
            planner().plan(0.0, 600.0, 12),
            Err(CutError::InvalidDimensions)
        ));
        assert!(matches!(
            planner().plan(800.0, -1.0, 12),
            Err(CutError::InvalidDimensions)
        ));
    }

    #[test]
    fn plan_rejects_impossible_bounds() {
        let p = GridPlanner {
            min_count: 100,
            max_count: 10,
            ..GridPlanner::default()
        };
        assert!(matches!(
            p.plan(800.0, 600.0, 12),
            Err(CutError::InvalidPieceCount)
        ));
    }

    #[test]
    fn registry_resolves_known_variants() {
        let reg = NubRegistry::standard();
        assert_eq!(
            reg.resolve("interlockingnubs").unwrap(),
            NubVariant::Interlocking
        );
        assert_eq!(
            reg.resolve("stochasticnubs").unwrap(),
            NubVariant::Stochastic
        );
    }

    #[test]
    fn registry_rejects_unknown_variant() {
        let reg = NubRegistry::standard();
        assert!(matches!(
            reg.resolve("zigzag"),
            Err(CutError::UnknownVariant(name)) if name == "zigzag"
        ));
    }

    /// Sum up the relative deltas of one nub segment.
    fn segment_deltas(d: &str) -> (f64, f64) {
        let mut tokens = d.split_whitespace();
        let (mut dx, mut dy) = (0.0, 0.0);
        while let Some(tok) = tokens.next() {
            let take = match tok {
                "l" => 1,
                "c" => 3,
                other => panic!("unexpected command {other:?}"),
            };
            for k in 0..take {
                let x: f64 = tokens.next().unwrap().parse().unwrap();
                let y: f64 = tokens.next().unwrap().parse().unwrap();
                // only the last pair of a curve moves the pen
                if k == take - 1 {
                    dx += x;
                    dy += y;
                }
            }
        }
        (dx, dy)
    }

    #[test]
    fn nub_returns_to_baseline() {
        let mut rng = StdRng::seed_from_u64(7);
        for variant in [NubVariant::Interlocking, NubVariant::Stochastic] {
            let (dx, dy) = segment_deltas(&variant.horizontal_path(120.0, 90.0, 0, 3, &mut rng));
            assert!((dx - 120.0).abs() < 0.01, "advance {dx}");
            assert_eq!(dy, 0.0, "lateral offset must cancel exactly");

            let (dx, dy) = segment_deltas(&variant.vertical_path(90.0, 120.0, 1, 2, &mut rng));
            assert_eq!(dx, 0.0);
            assert!((dy - 90.0).abs() < 0.01);
        }
    }

    #[test]
    fn interlocking_output_is_byte_identical() {
        let reg = NubRegistry::standard();
        let layout = planner().plan(1000.0, 800.0, 12).unwrap();
        // Seeds differ: the interlocking variant must not care.
        let a = CutLineGenerator::new(&reg, "interlockingnubs", 1).unwrap();
        let b = CutLineGenerator::new(&reg, "interlockingnubs", 2).unwrap();
        assert_eq!(a.generate(&layout), b.generate(&layout));
    }

    #[test]
    fn stochastic_output_depends_on_seed_only() {
        let reg = NubRegistry::standard();
        let layout = planner().plan(1000.0, 800.0, 12).unwrap();
        let a = CutLineGenerator::new(&reg, "stochasticnubs", 42).unwrap();
        let b = CutLineGenerator::new(&reg, "stochasticnubs", 42).unwrap();
        let c = CutLineGenerator::new(&reg, "stochasticnubs", 43).unwrap();
        let doc_a = a.generate(&layout);
        assert_eq!(doc_a, b.generate(&layout));
        let doc_c = c.generate(&layout);
        assert_ne!(doc_a, doc_c);
        // Same structure either way.
        assert_eq!(
            doc_a.matches("<path").count(),
            doc_c.matches("<path").count()
        );
    }

    #[test]
    fn cut_paths_span_the_full_image() {
        let reg = NubRegistry::standard();
        let layout = planner().plan(1000.0, 800.0, 12).unwrap();
        let generator = CutLineGenerator::new(&reg, "interlockingnubs", 0).unwrap();
        let doc = generator.generate(&layout);

        let interior = (layout.cols - 1 + layout.rows - 1) as usize;
        let paths: Vec<&str> = doc
            .lines()
            .filter(|l| l.starts_with("<path"))
            .collect();
        assert_eq!(paths.len(), interior);
        for path in &paths[..(layout.cols - 1) as usize] {
            assert!(path.contains("d=\"M 0 0 L "));
            assert!(path.contains("L 0 800\""), "vertical path must end at y=H");
        }
        for path in &paths[(layout.cols - 1) as usize..] {
            assert!(path.contains("d=\"M 0 0 L 0 "));
            assert!(path.contains("L 1000 0\""), "horizontal path must end at x=W");
        }
    }

    #[test]
    fn drawing_declares_one_to_one_pixel_space() {
        let reg = NubRegistry::standard();
        let layout = planner().plan(640.0, 480.0, 24).unwrap();
        let doc = CutLineGenerator::new(&reg, "interlockingnubs", 0)
            .unwrap()
            .generate(&layout);
        assert!(doc.contains("width=\"640\" height=\"480\""));
        assert!(doc.contains("viewBox=\"0 0 640 480\""));
        assert!(doc.contains("preserveAspectRatio=\"none\""));
        assert!(doc.contains(&format!("Piece count: {}", layout.piece_count())));
    }
}
