use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("piece {id} is missing {missing} data")]
    MissingPieceData { id: u32, missing: &'static str },
    #[error("piece id {0:?} is not a nonnegative integer")]
    BadPieceId(String),
    #[error("piece table entry {0}: expected 2 or 4 coordinates")]
    BadRegion(String),
    #[error("mask id for piece {0} must be a string or number")]
    BadMaskId(u32),
    #[error("traced fragment is malformed: {0}")]
    MalformedFragment(String),
    #[error("clip geometry for piece {0} was never filled")]
    UnfilledClip(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn malformed(what: &str) -> AssemblyError {
    AssemblyError::MalformedFragment(what.to_string())
}

fn parse_piece_id(key: &str) -> Result<u32, AssemblyError> {
    key.trim()
        .parse()
        .map_err(|_| AssemblyError::BadPieceId(key.to_string()))
}

/// A piece's position (and optionally size) in source-image pixel
/// space, as reported by the cutter. Diagnostics only; assembly
/// geometry never depends on it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PieceRegion {
    pub x: f64,
    pub y: f64,
    pub size: Option<(f64, f64)>,
}

/// The cutter's piece metadata file: piece id → 2- or 4-tuple.
#[derive(Clone, Debug, Default)]
pub struct PieceTable {
    entries: BTreeMap<u32, PieceRegion>,
}

impl PieceTable {
    pub fn from_json(text: &str) -> Result<Self, AssemblyError> {
        let raw: BTreeMap<String, Vec<f64>> = serde_json::from_str(text)?;
        let mut entries = BTreeMap::new();
        for (key, coords) in raw {
            let id = parse_piece_id(&key)?;
            let region = match coords.as_slice() {
                [x, y] => PieceRegion {
                    x: *x,
                    y: *y,
                    size: None,
                },
                [x, y, w, h] => PieceRegion {
                    x: *x,
                    y: *y,
                    size: Some((*w, *h)),
                },
                _ => return Err(AssemblyError::BadRegion(key)),
            };
            entries.insert(id, region);
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, AssemblyError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn get(&self, id: u32) -> Option<&PieceRegion> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// piece id → mask identifier; locates the traced file `<mask>.svg`.
#[derive(Clone, Debug, Default)]
pub struct MaskMap {
    entries: BTreeMap<u32, String>,
}

impl MaskMap {
    pub fn from_json(text: &str) -> Result<Self, AssemblyError> {
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let id = parse_piece_id(&key)?;
            let mask = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                _ => return Err(AssemblyError::BadMaskId(id)),
            };
            entries.insert(id, mask);
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, AssemblyError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn get(&self, id: u32) -> Option<&str> {
        self.entries.get(&id).map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct RawAtlas {
    width: f64,
    height: f64,
    image: String,
    placements: BTreeMap<String, [f64; 2]>,
}

/// The packer's layout: canvas size, atlas image filename, and one
/// placement per packed image. Placement keys are image filenames
/// whose stem is the piece id.
#[derive(Clone, Debug)]
pub struct AtlasLayout {
    pub canvas_width: f64,
    pub canvas_height: f64,
    pub image: String,
    placements: BTreeMap<u32, (f64, f64)>,
}

impl AtlasLayout {
    pub fn from_json(text: &str) -> Result<Self, AssemblyError> {
        let raw: RawAtlas = serde_json::from_str(text)?;
        let mut placements = BTreeMap::new();
        for (filename, [x, y]) in raw.placements {
            let stem = filename
                .rsplit_once('.')
                .map(|(stem, _)| stem)
                .unwrap_or(&filename);
            placements.insert(parse_piece_id(stem)?, (x, y));
        }
        Ok(Self {
            canvas_width: raw.width,
            canvas_height: raw.height,
            image: raw.image,
            placements,
        })
    }

    pub fn load(path: &Path) -> Result<Self, AssemblyError> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn placement(&self, id: u32) -> Option<(f64, f64)> {
        self.placements.get(&id).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewRect {
    pub min_x: f64,
    pub min_y: f64,
    pub width: f64,
    pub height: f64,
}

/// The parts of a tracer-emitted SVG fragment the assembler needs:
/// the root view rectangle, the wrapper group's transform matrix
/// (copied verbatim — it encodes the tracer's pixel-to-unit
/// conversion), and the clip geometry inside that group.
#[derive(Clone, Debug, PartialEq)]
pub struct TracedFragment {
    pub view: ViewRect,
    pub transform: String,
    pub geometry: String,
}

impl TracedFragment {
    pub fn parse(text: &str) -> Result<Self, AssemblyError> {
        let svg_tag = tag_at(text, "<svg").ok_or_else(|| malformed("no <svg> root"))?;
        let vb = attr_value(svg_tag, "viewBox").ok_or_else(|| malformed("root has no viewBox"))?;
        let nums: Vec<f64> = vb
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| malformed("viewBox is not numeric"))?;
        let [min_x, min_y, width, height] = nums[..] else {
            return Err(malformed("viewBox needs four values"));
        };

        let g_start = text.find("<g").ok_or_else(|| malformed("no <g> wrapper"))?;
        let g_tag_end = text[g_start..]
            .find('>')
            .map(|off| g_start + off)
            .ok_or_else(|| malformed("unterminated <g> tag"))?;
        let transform = attr_value(&text[g_start..=g_tag_end], "transform")
            .ok_or_else(|| malformed("group has no transform"))?
            .to_string();
        let close = text.rfind("</g>").ok_or_else(|| malformed("no closing </g>"))?;
        if close <= g_tag_end {
            return Err(malformed("no closing </g>"));
        }
        Ok(Self {
            view: ViewRect {
                min_x,
                min_y,
                width,
                height,
            },
            transform,
            geometry: text[g_tag_end + 1..close].trim().to_string(),
        })
    }
}

fn tag_at<'a>(text: &'a str, open: &str) -> Option<&'a str> {
    let start = text.find(open)?;
    let end = text[start..].find('>')? + start;
    Some(&text[start..=end])
}

fn attr_value<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let pattern = format!("{name}=\"");
    let start = tag.find(&pattern)? + pattern.len();
    let rest = &tag[start..];
    rest.find('"').map(|end| &rest[..end])
}

#[derive(Clone, Debug)]
struct PieceSlot {
    id: u32,
    transform: String,
    atlas_x: f64,
    atlas_y: f64,
    local_width: f64,
    local_height: f64,
    geometry: Option<String>,
}

/// The composite preview: one shared atlas image, one clip-path and
/// fragment symbol per piece, one placed instance per piece.
///
/// Built in two phases: declare every piece slot, then splice the
/// traced clip geometry into each shell through the id index.
pub struct CompositeDocument {
    scale: u32,
    canvas_width: f64,
    canvas_height: f64,
    atlas_image: String,
    slots: Vec<PieceSlot>,
    index: HashMap<u32, usize>,
}

impl CompositeDocument {
    pub fn new(scale: u32, canvas: (f64, f64), atlas_image: impl Into<String>) -> Self {
        Self {
            scale,
            canvas_width: canvas.0,
            canvas_height: canvas.1,
            atlas_image: atlas_image.into(),
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Phase one. The fragment symbol's view rectangle takes its
    /// origin from the atlas placement but its size from the traced
    /// fragment: the packer only preserves placement, not the true
    /// boundary size.
    pub fn declare_piece(&mut self, id: u32, fragment: &TracedFragment, placement: (f64, f64)) {
        self.index.insert(id, self.slots.len());
        self.slots.push(PieceSlot {
            id,
            transform: fragment.transform.clone(),
            atlas_x: placement.0,
            atlas_y: placement.1,
            local_width: fragment.view.width,
            local_height: fragment.view.height,
            geometry: None,
        });
    }

    /// Phase two: splice traced path contents into the declared shell.
    pub fn fill_geometry(&mut self, id: u32, geometry: &str) -> Result<(), AssemblyError> {
        let at = *self.index.get(&id).ok_or(AssemblyError::MissingPieceData {
            id,
            missing: "clip-path slot",
        })?;
        self.slots[at].geometry = Some(geometry.to_string());
        Ok(())
    }

    pub fn piece_count(&self) -> usize {
        self.slots.len()
    }

    pub fn piece_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().map(|s| s.id)
    }

    fn clip_id(&self, id: u32) -> String {
        format!("piece-mask-{}-{}", self.scale, id)
    }

    fn fragment_id(&self, id: u32) -> String {
        format!("piece-fragment-{}-{}", self.scale, id)
    }

    /// Pretty-printed SVG. Fails if any clip shell was never filled;
    /// a composite missing geometry is structurally invalid.
    pub fn serialize(&self) -> Result<String, AssemblyError> {
        let mut s = String::new();
        s.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            s,
            "<svg xmlns=\"http://www.w3.org/2000/svg\" xmlns:xlink=\"http://www.w3.org/1999/xlink\" width=\"{w}\" height=\"{h}\" viewBox=\"0 0 {w} {h}\">",
            w = fmt_px(self.canvas_width),
            h = fmt_px(self.canvas_height),
        );
        s.push_str("  <title>svg preview</title>\n");
        s.push_str("  <defs>\n");
        let _ = writeln!(
            s,
            "    <image id=\"source-image-{}\" xlink:href=\"{}\"/>",
            self.scale, self.atlas_image
        );
        for slot in &self.slots {
            let geometry = slot
                .geometry
                .as_deref()
                .ok_or(AssemblyError::UnfilledClip(slot.id))?;
            let _ = writeln!(
                s,
                "    <clipPath id=\"{}\" transform=\"{}\">",
                self.clip_id(slot.id),
                slot.transform
            );
            let _ = writeln!(s, "      {geometry}");
            s.push_str("    </clipPath>\n");
            let _ = writeln!(
                s,
                "    <symbol id=\"{}\" viewBox=\"{},{},{},{}\" width=\"{w}\" height=\"{h}\">",
                self.fragment_id(slot.id),
                fmt_px(slot.atlas_x),
                fmt_px(slot.atlas_y),
                fmt_px(slot.local_width),
                fmt_px(slot.local_height),
                w = fmt_px(slot.local_width),
                h = fmt_px(slot.local_height),
            );
            let _ = writeln!(s, "      <use xlink:href=\"#source-image-{}\"/>", self.scale);
            s.push_str("    </symbol>\n");
        }
        s.push_str("  </defs>\n");
        for slot in &self.slots {
            let _ = writeln!(
                s,
                "  <use class=\"example\" clip-path=\"url(#{})\" xlink:href=\"#{}\" transform=\"translate( {}, {} )\"/>",
                self.clip_id(slot.id),
                self.fragment_id(slot.id),
                fmt_px(slot.atlas_x),
                fmt_px(slot.atlas_y),
            );
        }
        s.push_str("</svg>\n");
        Ok(s)
    }

    /// One literal clip+fragment+use triple, for the vector proof.
    /// None while the document is empty or the first slot is unfilled.
    pub fn example_block(&self) -> Option<String> {
        let slot = self.slots.first()?;
        let geometry = slot.geometry.as_deref()?;
        let mut s = String::new();
        s.push_str("<svg>\n <defs>\n");
        let _ = writeln!(
            s,
            "  <image id=\"source-image-{}\" xlink:href=\"{}\"/>",
            self.scale, self.atlas_image
        );
        let _ = writeln!(
            s,
            "  <clipPath id=\"{}\" transform=\"{}\">\n    {geometry}\n  </clipPath>",
            self.clip_id(slot.id),
            slot.transform
        );
        let _ = writeln!(
            s,
            "  <symbol id=\"{}\" viewBox=\"{},{},{},{}\" width=\"{w}\" height=\"{h}\">\n   <use xlink:href=\"#source-image-{}\"/>\n  </symbol>",
            self.fragment_id(slot.id),
            fmt_px(slot.atlas_x),
            fmt_px(slot.atlas_y),
            fmt_px(slot.local_width),
            fmt_px(slot.local_height),
            self.scale,
            w = fmt_px(slot.local_width),
            h = fmt_px(slot.local_height),
        );
        s.push_str(" </defs>\n</svg>\n");
        let _ = writeln!(
            s,
            "<svg height=\"{h}\" id=\"pc-{}-{}\" width=\"{w}\">\n  <use class=\"example\" clip-path=\"url(#{})\" xlink:href=\"#{}\"/>\n</svg>",
            self.scale,
            slot.id,
            self.clip_id(slot.id),
            self.fragment_id(slot.id),
            w = fmt_px(slot.local_width),
            h = fmt_px(slot.local_height),
        );
        Some(s)
    }
}

/// Fuse the three collaborator datasets into one composite document.
/// Any piece missing a mask, traced fragment, or atlas placement
/// aborts before a document exists — never a partial composite.
pub fn assemble(
    scale: u32,
    pieces: &PieceTable,
    masks: &MaskMap,
    fragments: &BTreeMap<u32, TracedFragment>,
    atlas: &AtlasLayout,
    atlas_image: &str,
) -> Result<CompositeDocument, AssemblyError> {
    let mut doc = CompositeDocument::new(
        scale,
        (atlas.canvas_width, atlas.canvas_height),
        atlas_image,
    );
    for id in pieces.ids() {
        if masks.get(id).is_none() {
            return Err(AssemblyError::MissingPieceData { id, missing: "mask" });
        }
        let fragment = fragments.get(&id).ok_or(AssemblyError::MissingPieceData {
            id,
            missing: "traced vector",
        })?;
        let placement = atlas.placement(id).ok_or(AssemblyError::MissingPieceData {
            id,
            missing: "atlas placement",
        })?;
        doc.declare_piece(id, fragment, placement);
    }
    for id in pieces.ids() {
        doc.fill_geometry(id, &fragments[&id].geometry)?;
    }
    Ok(doc)
}

/// Read and parse every piece's traced fragment from `vector_dir`.
pub fn load_fragments(
    vector_dir: &Path,
    pieces: &PieceTable,
    masks: &MaskMap,
) -> Result<BTreeMap<u32, TracedFragment>, AssemblyError> {
    let mut out = BTreeMap::new();
    for id in pieces.ids() {
        let mask = masks
            .get(id)
            .ok_or(AssemblyError::MissingPieceData { id, missing: "mask" })?;
        let path = vector_dir.join(format!("{mask}.svg"));
        let text = fs::read_to_string(&path).map_err(|_| AssemblyError::MissingPieceData {
            id,
            missing: "traced vector",
        })?;
        out.insert(id, TracedFragment::parse(&text)?);
    }
    Ok(out)
}

/// HTML overlay with one hoverable marker per piece at its atlas
/// placement. Pieces without a placement are skipped with a warning;
/// proofs never abort the pipeline.
pub fn raster_proof(scale: u32, pieces: &PieceTable, atlas: &AtlasLayout) -> String {
    let mut markers = String::new();
    for id in pieces.ids() {
        let Some((x, y)) = atlas.placement(id) else {
            log::warn!("piece {id} has no atlas placement; proof marker skipped");
            continue;
        };
        let mut style = format!("left:{}px;top:{}px;", fmt_px(x), fmt_px(y));
        if let Some((w, h)) = pieces.get(id).and_then(|r| r.size) {
            let _ = write!(style, "width:{}px;height:{}px;", fmt_px(w), fmt_px(h));
        }
        let _ = write!(
            markers,
            "<div class='pc pc--{scale} pc-{id}' style='{style}'>{id}</div>"
        );
    }
    format!(
        "<!doctype html>\n<html>\n<head>\n<title>Sprite Proof - {scale}</title>\n\
         <link rel=\"stylesheet\" href=\"raster.css\">\n<style>\n\
         .pc {{\n  position: absolute;\n  text-indent: -999em;\n}}\n\
         .pc:hover {{\n  text-indent: 0;\n}}\n</style>\n</head>\n<body>\n\
         {markers}\n</body>\n</html>\n"
    )
}

/// HTML page embedding one literal example triple from the composite,
/// for documentation of the clip/fragment/use convention.
pub fn vector_proof(scale: u32, doc: &CompositeDocument) -> String {
    let example = doc.example_block().unwrap_or_else(|| {
        log::warn!("composite document has no filled pieces; vector proof is empty");
        String::new()
    });
    format!(
        "<!doctype html>\n<html>\n<head>\n<title>Sprite Vector Proof - {scale}</title>\n\
         <link rel=\"stylesheet\" href=\"raster.css\">\n</head>\n<body>\n\
         {example}\n</body>\n</html>\n"
    )
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
