use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use tracing::debug;

use crate::config::IconFormat;
use crate::FaviconError;

// Fixed encoder parameters keep artifacts byte-stable across restarts.
const WEBP_QUALITY: f32 = 90.0;
const JPEG_QUALITY: u8 = 85;
const AVIF_QUALITY: u8 = 80;
const AVIF_SPEED: u8 = 4;

/// Input formats the sniffer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Png,
    Jpeg,
    Gif,
    Webp,
    Avif,
    Bmp,
    Ico,
    Svg,
}

impl Sniffed {
    fn image_format(self) -> Option<image::ImageFormat> {
        match self {
            Sniffed::Png => Some(image::ImageFormat::Png),
            Sniffed::Jpeg => Some(image::ImageFormat::Jpeg),
            Sniffed::Gif => Some(image::ImageFormat::Gif),
            Sniffed::Webp => Some(image::ImageFormat::WebP),
            Sniffed::Avif => Some(image::ImageFormat::Avif),
            Sniffed::Bmp => Some(image::ImageFormat::Bmp),
            Sniffed::Ico => Some(image::ImageFormat::Ico),
            Sniffed::Svg => None,
        }
    }
}

/// Magic-byte detection. Declared content types are only a hint; origins
/// mislabel favicons constantly.
pub fn sniff(bytes: &[u8]) -> Option<Sniffed> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some(Sniffed::Png);
    }
    if bytes.starts_with(b"GIF8") {
        return Some(Sniffed::Gif);
    }
    if bytes.starts_with(b"\xff\xd8\xff") {
        return Some(Sniffed::Jpeg);
    }
    if bytes.starts_with(b"BM") {
        return Some(Sniffed::Bmp);
    }
    if bytes.starts_with(b"\x00\x00\x01\x00") {
        return Some(Sniffed::Ico);
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(Sniffed::Webp);
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && matches!(&bytes[8..12], b"avif" | b"avis") {
        return Some(Sniffed::Avif);
    }
    if looks_like_svg(bytes) {
        return Some(Sniffed::Svg);
    }
    None
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let Ok(text) = std::str::from_utf8(head) else {
        return false;
    };
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    trimmed.starts_with('<') && trimmed.to_ascii_lowercase().contains("<svg")
}

fn hint_from_mime(mime: Option<&str>) -> Option<Sniffed> {
    match mime? {
        "image/png" => Some(Sniffed::Png),
        "image/jpeg" => Some(Sniffed::Jpeg),
        "image/gif" => Some(Sniffed::Gif),
        "image/webp" => Some(Sniffed::Webp),
        "image/avif" => Some(Sniffed::Avif),
        "image/bmp" => Some(Sniffed::Bmp),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some(Sniffed::Ico),
        "image/svg+xml" | "text/xml" => Some(Sniffed::Svg),
        _ => None,
    }
}

/// Decode icon bytes into RGBA. SVG is rasterized at the target size; ICO
/// picks the directory frame nearest the target (preferring larger); raster
/// formats go through the image crate.
pub fn decode_icon(
    bytes: &[u8],
    declared: Option<&str>,
    target: u32,
    rasterizer: &Rasterizer,
) -> Result<RgbaImage, FaviconError> {
    match sniff(bytes).or_else(|| hint_from_mime(declared)) {
        Some(Sniffed::Svg) => rasterizer.render(bytes, target),
        Some(Sniffed::Ico) => decode_ico(bytes, target),
        Some(other) => match other.image_format() {
            Some(format) => image::load_from_memory_with_format(bytes, format)
                .map(|img| img.to_rgba8())
                .map_err(|e| FaviconError::Decode(e.to_string())),
            None => Err(FaviconError::Decode("unsupported raster format".into())),
        },
        None => image::load_from_memory(bytes)
            .map(|img| img.to_rgba8())
            .map_err(|e| FaviconError::Decode(e.to_string())),
    }
}

/// ICO directories are multi-resolution; take the frame whose width is
/// nearest the target, preferring the larger one on a tie.
fn decode_ico(bytes: &[u8], target: u32) -> Result<RgbaImage, FaviconError> {
    let dir = ico::IconDir::read(std::io::Cursor::new(bytes))
        .map_err(|e| FaviconError::Decode(e.to_string()))?;
    let entry = dir
        .entries()
        .iter()
        .min_by_key(|e| (e.width().abs_diff(target), std::cmp::Reverse(e.width())))
        .ok_or_else(|| FaviconError::Decode("empty ICO directory".into()))?;
    let frame = entry
        .decode()
        .map_err(|e| FaviconError::Decode(e.to_string()))?;
    let (w, h) = (frame.width(), frame.height());
    RgbaImage::from_raw(w, h, frame.rgba_data().to_vec())
        .ok_or_else(|| FaviconError::Decode("ICO frame buffer mismatch".into()))
}

/// Decode, reject useless images, resize to a square, encode. The heuristic
/// gate is `is_nearly_blank_or_black`; the simpler blank check only feeds
/// diagnostics.
pub fn normalize(
    bytes: &[u8],
    declared: Option<&str>,
    size: u32,
    format: IconFormat,
    rasterizer: &Rasterizer,
) -> Result<Vec<u8>, FaviconError> {
    let decoded = decode_icon(bytes, declared, size, rasterizer)?;
    if is_nearly_blank(&decoded) {
        debug!("decoded icon is nearly blank");
    }
    if is_nearly_blank_or_black(&decoded) {
        return Err(FaviconError::Rejected);
    }
    let square = resize_square(&decoded, size);
    encode(&square, format)
}

/// Sample on a grid of at most 20x20 points and count opaque pixels that are
/// not near-white. Three or fewer means the icon is effectively empty.
pub fn is_nearly_blank(img: &RgbaImage) -> bool {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return true;
    }
    let (step_x, step_y) = ((w / 20).max(1), (h / 20).max(1));
    let mut count = 0;
    for y in (0..h).step_by(step_y as usize) {
        for x in (0..w).step_by(step_x as usize) {
            let Rgba([r, g, b, a]) = *img.get_pixel(x, y);
            if a >= 128 && !(r > 250 && g > 250 && b > 250) {
                count += 1;
                if count > 3 {
                    return false;
                }
            }
        }
    }
    true
}

/// Stricter variant used as the selection filter: rejects icons that are
/// mostly transparent or carry only near-black / near-white samples.
pub fn is_nearly_blank_or_black(img: &RgbaImage) -> bool {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return true;
    }
    let (step_x, step_y) = ((w / 20).max(1), (h / 20).max(1));
    let mut opaque = 0;
    let mut colored = 0;
    for y in (0..h).step_by(step_y as usize) {
        for x in (0..w).step_by(step_x as usize) {
            let Rgba([r, g, b, a]) = *img.get_pixel(x, y);
            if a >= 128 {
                opaque += 1;
                let near_black = r < 15 && g < 15 && b < 15;
                let near_white = r > 240 && g > 240 && b > 240;
                if !near_black && !near_white {
                    colored += 1;
                }
            }
        }
    }
    opaque < 5 || colored < 3
}

/// Square output at the requested size, Catmull-Rom resampled. Alpha is
/// preserved; formats that cannot carry it are composited at encode time.
pub fn resize_square(img: &RgbaImage, size: u32) -> RgbaImage {
    if img.dimensions() == (size, size) {
        return img.clone();
    }
    DynamicImage::ImageRgba8(img.clone())
        .resize_exact(size, size, FilterType::CatmullRom)
        .to_rgba8()
}

fn composite_on_white(img: &RgbaImage) -> RgbaImage {
    let mut out = RgbaImage::from_pixel(img.width(), img.height(), Rgba([255, 255, 255, 255]));
    image::imageops::overlay(&mut out, img, 0, 0);
    out
}

pub fn encode(img: &RgbaImage, format: IconFormat) -> Result<Vec<u8>, FaviconError> {
    let (w, h) = img.dimensions();
    let mut out = Vec::new();
    match format {
        IconFormat::Png => {
            PngEncoder::new(&mut out)
                .write_image(img.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| FaviconError::Encode(e.to_string()))?;
        }
        IconFormat::Webp => {
            let encoder = webp::Encoder::from_rgba(img.as_raw(), w, h);
            out.extend_from_slice(&encoder.encode(WEBP_QUALITY));
        }
        IconFormat::Avif => {
            AvifEncoder::new_with_speed_quality(&mut out, AVIF_SPEED, AVIF_QUALITY)
                .write_image(img.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| FaviconError::Encode(e.to_string()))?;
        }
        IconFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(composite_on_white(img)).to_rgb8();
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| FaviconError::Encode(e.to_string()))?;
        }
    }
    Ok(out)
}

/// Synthetic globe served when every discovered candidate fails.
pub fn fallback_icon(
    size: u32,
    format: IconFormat,
    rasterizer: &Rasterizer,
) -> Result<Vec<u8>, FaviconError> {
    let svg = format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 100 100">
  <circle cx="50" cy="50" r="45" fill="#e3f2fd" stroke="#1976d2" stroke-width="2"/>
  <ellipse cx="50" cy="50" rx="45" ry="20" fill="none" stroke="#1976d2" stroke-width="1"/>
  <ellipse cx="50" cy="50" rx="20" ry="45" fill="none" stroke="#1976d2" stroke-width="1"/>
</svg>"##
    );
    let globe = rasterizer.render(svg.as_bytes(), size)?;
    encode(&globe, format)
}

/// SVG rasterization through resvg. Owns the parsing options (and the font
/// database they carry); rendering itself is pure Rust and reentrant.
pub struct Rasterizer {
    options: resvg::usvg::Options<'static>,
}

impl Default for Rasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer {
    pub fn new() -> Self {
        let mut options = resvg::usvg::Options::default();
        options.fontdb_mut().load_system_fonts();
        Self { options }
    }

    /// Render to an RGBA square of `size` pixels, stretching the SVG's
    /// viewport to fill it.
    pub fn render(&self, svg: &[u8], size: u32) -> Result<RgbaImage, FaviconError> {
        let svg = preprocess_svg(svg);
        let tree = resvg::usvg::Tree::from_data(&svg, &self.options)
            .map_err(|e| FaviconError::Decode(e.to_string()))?;
        let mut pixmap = resvg::tiny_skia::Pixmap::new(size, size)
            .ok_or_else(|| FaviconError::Decode("invalid raster size".into()))?;

        let view = tree.size();
        if view.width() <= 0.0 || view.height() <= 0.0 {
            return Err(FaviconError::Decode("SVG has no intrinsic size".into()));
        }
        let transform = resvg::tiny_skia::Transform::from_scale(
            size as f32 / view.width(),
            size as f32 / view.height(),
        );
        resvg::render(&tree, transform, &mut pixmap.as_mut());

        let mut img = RgbaImage::new(size, size);
        for (i, premul) in pixmap.pixels().iter().enumerate() {
            let px = premul.demultiply();
            let x = i as u32 % size;
            let y = i as u32 / size;
            img.put_pixel(x, y, Rgba([px.red(), px.green(), px.blue(), px.alpha()]));
        }
        Ok(img)
    }
}

/// Favicons in the wild omit the SVG namespace and lean on `currentColor`;
/// patch both so the rasterizer produces something visible.
fn preprocess_svg(data: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(data) else {
        return data.to_vec();
    };
    let mut text = text.to_string();
    if !text.contains("xmlns") && text.contains("<svg") {
        text = text.replacen("<svg", r#"<svg xmlns="http://www.w3.org/2000/svg""#, 1);
    }
    text = text.replace("currentColor", "#333333");
    text.into_bytes()
}
