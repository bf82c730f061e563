use std::env;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use cutline_core::{CutLineGenerator, GridPlanner, NubRegistry};
use env_logger::Env;
use png::{BitDepth, ColorType, Compression, Encoder, FilterType};
use preview_core::{
    AtlasLayout, MaskMap, PieceTable, assemble, load_fragments, raster_proof, vector_proof,
};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("cutlines") => cmd_cutlines(&args[2..]),
        Some("assemble") => cmd_assemble(&args[2..]),
        _ => usage(),
    }
}

fn usage() -> ! {
    eprintln!("Usage: jigsaw cutlines <width> <height> <out.svg> [pieces] [variant] [seed]");
    eprintln!("       jigsaw assemble <dir> [scale]");
    std::process::exit(2);
}

fn cmd_cutlines(args: &[String]) -> Result<(), Box<dyn Error>> {
    if args.len() < 3 {
        usage();
    }
    let width: f64 = args[0].parse()?;
    let height: f64 = args[1].parse()?;
    let out = PathBuf::from(&args[2]);
    let pieces: u32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
    let variant = args
        .get(4)
        .map(String::as_str)
        .unwrap_or("interlockingnubs");
    let seed: u64 = args.get(5).and_then(|s| s.parse().ok()).unwrap_or(0);

    let layout = GridPlanner::default().plan(width, height, pieces)?;
    log::info!(
        "grid: {} rows x {} cols ({} pieces of {:.1}x{:.1})",
        layout.rows,
        layout.cols,
        layout.piece_count(),
        layout.piece_width,
        layout.piece_height
    );
    let registry = NubRegistry::standard();
    let generator = CutLineGenerator::new(&registry, variant, seed)?;
    let svg = generator.generate(&layout);
    fs::write(&out, &svg)?;

    // The raster cutter segments a bitmap, so render the same drawing
    // to a PNG beside the SVG (deterministic for same input).
    let tree = usvg::Tree::from_str(&svg, &usvg::Options::default())
        .map_err(|e| format!("SVG parse error: {e:?}"))?;
    let w_px = layout.image_width.ceil() as u32;
    let h_px = layout.image_height.ceil() as u32;
    let mut pixmap = tiny_skia::Pixmap::new(w_px, h_px).ok_or("pixmap alloc failed")?;
    let mut pm = pixmap.as_mut();
    resvg::render(&tree, tiny_skia::Transform::identity(), &mut pm);
    let png_path = out.with_extension("png");
    encode_png_deterministic(&pixmap, &png_path)?;
    log::info!("wrote {} and {}", out.display(), png_path.display());
    Ok(())
}

fn cmd_assemble(args: &[String]) -> Result<(), Box<dyn Error>> {
    if args.is_empty() || args.len() > 2 {
        usage();
    }
    let dir = Path::new(&args[0]);
    let scale: u32 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(100);

    let pieces = PieceTable::load(&dir.join("pieces.json"))?;
    let masks = MaskMap::load(&dir.join("piece_id_to_mask.json"))?;
    let atlas = AtlasLayout::load(&dir.join("atlas.json"))?;
    let fragments = load_fragments(&dir.join("vector"), &pieces, &masks)?;
    log::info!("assembling {} pieces at scale {scale}", pieces.len());

    // Companion JPEG of the atlas for viewers without vector clipping
    // support; the preview references it as its shared source image.
    let jpg_name = Path::new(&atlas.image).with_extension("jpg");
    let rgb = image::open(dir.join(&atlas.image))?.to_rgb8();
    rgb.save(dir.join(&jpg_name))?;

    let doc = assemble(
        scale,
        &pieces,
        &masks,
        &fragments,
        &atlas,
        &jpg_name.to_string_lossy(),
    )?;
    fs::write(dir.join("preview.svg"), doc.serialize()?)?;
    log::info!("wrote preview.svg with {} pieces", doc.piece_count());

    // Proofs are diagnostics only: log failures and keep going.
    if let Err(e) = fs::write(
        dir.join("sprite_proof.html"),
        raster_proof(scale, &pieces, &atlas),
    ) {
        log::warn!("raster proof skipped: {e}");
    }
    if let Err(e) = fs::write(
        dir.join("sprite_vector_proof.html"),
        vector_proof(scale, &doc),
    ) {
        log::warn!("vector proof skipped: {e}");
    }
    Ok(())
}

fn encode_png_deterministic(pixmap: &tiny_skia::Pixmap, path: &Path) -> Result<(), Box<dyn Error>> {
    let file = fs::File::create(path)?;
    let mut enc = Encoder::new(file, pixmap.width(), pixmap.height());
    enc.set_color(ColorType::Rgba);
    enc.set_depth(BitDepth::Eight);
    enc.set_filter(FilterType::NoFilter);
    enc.set_compression(Compression::Default);
    let mut writer = enc.write_header()?;
    writer.write_image_data(pixmap.data())?;
    Ok(())
}
