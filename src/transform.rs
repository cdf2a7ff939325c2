//! Screenshot post-processing for e-ink panels.
//!
//! Turns raw browser screenshot bytes into the exact raster a panel expects.
//! The pipeline is a pure function of its inputs and runs the same fixed
//! stage order every time:
//!
//! 1. scale to the canvas with aspect-preserving letterboxing
//! 2. margin insets, background filled
//! 3. center offsets, clamped so content never leaves the canvas
//! 4. fine rotation (±15°), then the coarse orientation transpose
//! 5. quantization: 1-bit dithering for monochrome panels, fixed-palette
//!    reduction for color panels
//!
//! Every stage is integer or nearest-neighbour arithmetic, so identical
//! inputs produce byte-identical output. That property is what makes
//! golden-image tests of rendered dashboards possible.
//!
//! # Example
//!
//! ```rust,ignore
//! use inkboard::transform::{transform, TransformParams};
//!
//! let params = TransformParams::for_canvas(800, 480);
//! let rendered = transform(&screenshot_png, &params)?;
//! assert_eq!((rendered.width, rendered.height), (800, 480));
//! ```

use image::imageops::colorops::ColorMap;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbaImage, Rgba};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::device::DisplayClass;
use crate::error::TransformError;
use crate::{MAX_CENTER_OFFSET_PX, MAX_FINE_ROTATION_DEG};

/// Canvas fill behind letterboxes, margins and rotation-exposed corners.
const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Colors an indexed e-ink panel can be asked to show, strongest first.
///
/// The first `colors` entries of this table form the working palette for a
/// [`DisplayClass::Color`] target, so black and white come first and a
/// two-color panel degrades to plain monochrome.
const BASE_PALETTE: [Rgb<u8>; 8] = [
    Rgb([0, 0, 0]),
    Rgb([255, 255, 255]),
    Rgb([255, 0, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 255, 0]),
    Rgb([255, 128, 0]),
    Rgb([128, 128, 128]),
];

/// Bayer 4x4 threshold matrix for ordered dithering.
const BAYER_4X4: [[u8; 4]; 4] = [
    [0, 8, 2, 10],
    [12, 4, 14, 6],
    [3, 11, 1, 9],
    [15, 7, 13, 5],
];

/// Coarse panel orientation, applied as a lossless transpose after the fine
/// rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Native orientation
    #[default]
    Landscape,
    /// Rotated 90° clockwise
    Portrait,
    /// Rotated 180°
    LandscapeInverted,
    /// Rotated 270° clockwise
    PortraitInverted,
}

impl Orientation {
    /// Dimensions a `(w, h)` canvas will have after this orientation.
    pub fn oriented_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Orientation::Landscape | Orientation::LandscapeInverted => (width, height),
            Orientation::Portrait | Orientation::PortraitInverted => (height, width),
        }
    }

    /// Canvas dimensions to compose at so the oriented output lands exactly
    /// on a panel with the given native resolution.
    pub fn canvas_size(self, native_width: u32, native_height: u32) -> (u32, u32) {
        // oriented_size is its own inverse on dimensions.
        self.oriented_size(native_width, native_height)
    }

    pub(crate) fn apply(self, canvas: RgbaImage) -> RgbaImage {
        match self {
            Orientation::Landscape => canvas,
            Orientation::Portrait => imageops::rotate90(&canvas),
            Orientation::LandscapeInverted => imageops::rotate180(&canvas),
            Orientation::PortraitInverted => imageops::rotate270(&canvas),
        }
    }
}

/// Dithering algorithm for the quantization stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DitherKind {
    /// Error diffusion. Best detail preservation, the usual choice.
    #[default]
    FloydSteinberg,
    /// Bayer 4x4 threshold matrix. Coarser but pattern-stable frame to frame.
    Ordered,
}

/// Margin insets in pixels, background filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Margins {
    #[serde(default)]
    pub top: u32,
    #[serde(default)]
    pub right: u32,
    #[serde(default)]
    pub bottom: u32,
    #[serde(default)]
    pub left: u32,
}

impl Margins {
    /// Uniform margins on all four sides.
    pub fn uniform(px: u32) -> Self {
        Self {
            top: px,
            right: px,
            bottom: px,
            left: px,
        }
    }
}

/// Everything the pipeline needs to place and quantize one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformParams {
    /// Canvas width before orientation
    pub width: u32,
    /// Canvas height before orientation
    pub height: u32,
    /// Margin insets
    pub margins: Margins,
    /// Horizontal content offset in pixels
    pub offset_x: i32,
    /// Vertical content offset in pixels
    pub offset_y: i32,
    /// Fine rotation in degrees, bounded to ±15.0
    pub rotation_deg: f32,
    /// Coarse orientation transpose
    pub orientation: Orientation,
    /// Target panel class
    pub display: DisplayClass,
    /// Dithering algorithm
    pub dither: DitherKind,
}

impl TransformParams {
    /// Neutral parameters for a monochrome canvas of the given size.
    pub fn for_canvas(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            margins: Margins::default(),
            offset_x: 0,
            offset_y: 0,
            rotation_deg: 0.0,
            orientation: Orientation::Landscape,
            display: DisplayClass::Monochrome,
            dither: DitherKind::FloydSteinberg,
        }
    }

    /// Check every geometry parameter against its declared bound.
    ///
    /// `max_pixels` bounds the canvas area to keep a single request from
    /// exhausting memory.
    pub fn validate(&self, max_pixels: u64) -> Result<(), TransformError> {
        if self.width == 0 || self.height == 0 {
            return Err(TransformError::OutOfRange("zero canvas dimension".into()));
        }
        let area = u64::from(self.width) * u64::from(self.height);
        if area > max_pixels {
            return Err(TransformError::OutOfRange(format!(
                "canvas area {area} exceeds limit {max_pixels}"
            )));
        }
        if !self.rotation_deg.is_finite() || self.rotation_deg.abs() > MAX_FINE_ROTATION_DEG {
            return Err(TransformError::OutOfRange(format!(
                "rotation {} outside ±{MAX_FINE_ROTATION_DEG}",
                self.rotation_deg
            )));
        }
        if self.offset_x.abs() > MAX_CENTER_OFFSET_PX || self.offset_y.abs() > MAX_CENTER_OFFSET_PX
        {
            return Err(TransformError::OutOfRange(format!(
                "offset ({}, {}) outside ±{MAX_CENTER_OFFSET_PX}",
                self.offset_x, self.offset_y
            )));
        }
        if self.margins.left + self.margins.right >= self.width
            || self.margins.top + self.margins.bottom >= self.height
        {
            return Err(TransformError::OutOfRange(
                "margins leave no content area".into(),
            ));
        }
        if let DisplayClass::Color { colors } = self.display {
            palette_slice(colors)?;
        }
        Ok(())
    }
}

/// A finished, panel-ready raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Encoded image bytes
    pub bytes: Vec<u8>,
    /// Output width, equal to the panel's native width
    pub width: u32,
    /// Output height, equal to the panel's native height
    pub height: u32,
    /// MIME type of `bytes`
    pub content_type: &'static str,
}

/// Run the full pipeline on raw screenshot bytes.
///
/// Geometry bounds are re-checked here so the function stays total; the
/// canvas area limit is the caller's concern and is enforced at request
/// validation time.
pub fn transform(raw: &[u8], params: &TransformParams) -> Result<Rendered, TransformError> {
    params.validate(u64::MAX)?;
    let source = image::load_from_memory(raw)
        .map_err(|e| TransformError::Decode(e.to_string()))?
        .to_rgba8();

    let mut canvas = compose(&source, params)?;
    if params.rotation_deg != 0.0 {
        canvas = rotate_fine(&canvas, params.rotation_deg);
    }
    let oriented = params.orientation.apply(canvas);
    quantize(oriented, params.display, params.dither)
}

/// Synthesize the placeholder served when every capture attempt failed.
///
/// White canvas, a full-frame cross, and a fixed alternating marker in the
/// first pixel row so both firmware and tests can recognize the placeholder
/// without comparing whole images. Dimensions are the panel's native
/// resolution; the image goes through the same quantization stage as a real
/// capture so the output format matches the device class.
pub fn fallback(
    width: u32,
    height: u32,
    display: DisplayClass,
    dither: DitherKind,
) -> Result<Rendered, TransformError> {
    if width < FALLBACK_MARKER_PX || height < 2 {
        return Err(TransformError::OutOfRange(
            "canvas too small for placeholder".into(),
        ));
    }
    let black = Rgba([0, 0, 0, 255]);
    let mut canvas = RgbaImage::from_pixel(width, height, BACKGROUND);

    // Diagonal cross, drawn by walking the long axis.
    for step in 0..width.max(height) {
        let x = step.min(width - 1);
        let y = (u64::from(step) * u64::from(height - 1) / u64::from(width.max(height) - 1)) as u32;
        canvas.put_pixel(x, y, black);
        canvas.put_pixel(x, height - 1 - y, black);
    }
    // Single-pixel frame.
    for x in 0..width {
        canvas.put_pixel(x, 0, black);
        canvas.put_pixel(x, height - 1, black);
    }
    for y in 0..height {
        canvas.put_pixel(0, y, black);
        canvas.put_pixel(width - 1, y, black);
    }
    // Marker: alternate the second row, starting black.
    for x in 0..FALLBACK_MARKER_PX {
        let px = if x % 2 == 0 { black } else { BACKGROUND };
        canvas.put_pixel(x, 1, px);
    }

    quantize(canvas, display, dither)
}

/// Width in pixels of the placeholder marker pattern.
pub const FALLBACK_MARKER_PX: u32 = 16;

/// Whether encoded image bytes carry the placeholder marker.
pub fn has_fallback_marker(bytes: &[u8]) -> bool {
    let Ok(img) = image::load_from_memory(bytes) else {
        return false;
    };
    let img = img.to_rgba8();
    if img.width() < FALLBACK_MARKER_PX || img.height() < 2 {
        return false;
    }
    (0..FALLBACK_MARKER_PX).all(|x| {
        let Rgba([r, g, b, _]) = *img.get_pixel(x, 1);
        let dark = r < 128 && g < 128 && b < 128;
        dark == (x % 2 == 0)
    })
}

/// Stages 1-3: letterboxed scale, margins, clamped offset.
fn compose(source: &RgbaImage, params: &TransformParams) -> Result<RgbaImage, TransformError> {
    let (canvas_w, canvas_h) = (params.width, params.height);
    let mut canvas = RgbaImage::from_pixel(canvas_w, canvas_h, BACKGROUND);

    let box_w = canvas_w - params.margins.left - params.margins.right;
    let box_h = canvas_h - params.margins.top - params.margins.bottom;
    let (src_w, src_h) = source.dimensions();
    if src_w == 0 || src_h == 0 {
        return Err(TransformError::Decode("empty source image".into()));
    }

    let scale = f64::min(
        f64::from(box_w) / f64::from(src_w),
        f64::from(box_h) / f64::from(src_h),
    );
    let scaled_w = ((f64::from(src_w) * scale).round() as u32).clamp(1, box_w);
    let scaled_h = ((f64::from(src_h) * scale).round() as u32).clamp(1, box_h);
    let scaled = if (scaled_w, scaled_h) == (src_w, src_h) {
        source.clone()
    } else {
        imageops::resize(source, scaled_w, scaled_h, FilterType::Triangle)
    };

    // Center inside the content box, apply the offset, then clamp so the
    // content rectangle stays fully inside the canvas.
    let ideal_x =
        i64::from(params.margins.left) + i64::from((box_w - scaled_w) / 2) + i64::from(params.offset_x);
    let ideal_y =
        i64::from(params.margins.top) + i64::from((box_h - scaled_h) / 2) + i64::from(params.offset_y);
    let x = ideal_x.clamp(0, i64::from(canvas_w - scaled_w));
    let y = ideal_y.clamp(0, i64::from(canvas_h - scaled_h));

    imageops::overlay(&mut canvas, &scaled, x, y);
    Ok(canvas)
}

/// Stage 4a: fine rotation by inverse mapping with nearest-neighbour reads.
///
/// Nearest-neighbour keeps the stage bit-exact across runs, and at ±15° the
/// quality difference versus interpolation disappears under dithering anyway.
fn rotate_fine(canvas: &RgbaImage, degrees: f32) -> RgbaImage {
    let (w, h) = canvas.dimensions();
    let (sin, cos) = degrees.to_radians().sin_cos();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;

    let mut out = RgbaImage::from_pixel(w, h, BACKGROUND);
    for y in 0..h {
        for x in 0..w {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let sx = (cos * dx + sin * dy + cx).round();
            let sy = (-sin * dx + cos * dy + cy).round();
            if sx >= 0.0 && sy >= 0.0 && (sx as u32) < w && (sy as u32) < h {
                out.put_pixel(x, y, *canvas.get_pixel(sx as u32, sy as u32));
            }
        }
    }
    out
}

/// Stage 5: reduce to the panel's color space and encode.
fn quantize(
    canvas: RgbaImage,
    display: DisplayClass,
    dither: DitherKind,
) -> Result<Rendered, TransformError> {
    let (width, height) = canvas.dimensions();
    let bytes = match display {
        DisplayClass::Monochrome => {
            let mut gray = imageops::grayscale(&canvas);
            match dither {
                DitherKind::FloydSteinberg => {
                    imageops::dither(&mut gray, &imageops::BiLevel);
                }
                DitherKind::Ordered => {
                    for (x, y, pixel) in gray.enumerate_pixels_mut() {
                        let threshold =
                            BAYER_4X4[(y % 4) as usize][(x % 4) as usize] * 16 + 8;
                        pixel.0[0] = if pixel.0[0] >= threshold { 255 } else { 0 };
                    }
                }
            }
            encode_png(&gray)?
        }
        DisplayClass::Color { colors } => {
            let palette = DevicePalette::new(palette_slice(colors)?);
            let mut rgb = image::DynamicImage::ImageRgba8(canvas).to_rgb8();
            match dither {
                DitherKind::FloydSteinberg => imageops::dither(&mut rgb, &palette),
                DitherKind::Ordered => {
                    for pixel in rgb.pixels_mut() {
                        palette.map_color(pixel);
                    }
                }
            }
            encode_png(&rgb)?
        }
    };

    Ok(Rendered {
        bytes,
        width,
        height,
        content_type: "image/png",
    })
}

fn palette_slice(colors: u8) -> Result<&'static [Rgb<u8>], TransformError> {
    let colors = colors as usize;
    if !(2..=BASE_PALETTE.len()).contains(&colors) {
        return Err(TransformError::UnsupportedDepth(format!(
            "{colors} colors (supported: 2 to {})",
            BASE_PALETTE.len()
        )));
    }
    Ok(&BASE_PALETTE[..colors])
}

fn encode_png<P>(img: &image::ImageBuffer<P, Vec<u8>>) -> Result<Vec<u8>, TransformError>
where
    P: image::PixelWithColorType + image::Pixel<Subpixel = u8>,
{
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)
        .map_err(|e| TransformError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Nearest-color map over a prefix of [`BASE_PALETTE`].
struct DevicePalette {
    entries: &'static [Rgb<u8>],
}

impl DevicePalette {
    fn new(entries: &'static [Rgb<u8>]) -> Self {
        Self { entries }
    }
}

impl ColorMap for DevicePalette {
    type Color = Rgb<u8>;

    fn index_of(&self, color: &Rgb<u8>) -> usize {
        let mut best = 0;
        let mut best_dist = u32::MAX;
        for (i, entry) in self.entries.iter().enumerate() {
            let dist: u32 = entry
                .0
                .iter()
                .zip(color.0.iter())
                .map(|(a, b)| {
                    let d = i32::from(*a) - i32::from(*b);
                    (d * d) as u32
                })
                .sum();
            if dist < best_dist {
                best = i;
                best_dist = dist;
            }
        }
        best
    }

    fn map_color(&self, color: &mut Rgb<u8>) {
        *color = self.entries[self.index_of(color)];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_of(img: &RgbaImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn gradient_source(w: u32, h: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(w, h, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        png_of(&img)
    }

    #[test]
    fn test_output_matches_native_resolution() {
        let raw = gradient_source(1024, 768);
        let params = TransformParams::for_canvas(800, 480);
        let rendered = transform(&raw, &params).unwrap();

        assert_eq!((rendered.width, rendered.height), (800, 480));
        assert_eq!(rendered.content_type, "image/png");
        let decoded = image::load_from_memory(&rendered.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 480));
    }

    #[test]
    fn test_portrait_output_dimensions() {
        let raw = gradient_source(512, 512);
        let mut params = TransformParams::for_canvas(480, 800);
        params.orientation = Orientation::Portrait;
        let rendered = transform(&raw, &params).unwrap();

        // A 480x800 canvas rotated 90° lands on an 800x480 panel.
        assert_eq!((rendered.width, rendered.height), (800, 480));
    }

    #[test]
    fn test_deterministic_output() {
        let raw = gradient_source(640, 400);
        let mut params = TransformParams::for_canvas(800, 480);
        params.rotation_deg = 7.5;
        params.margins = Margins::uniform(10);
        params.offset_x = -30;

        let a = transform(&raw, &params).unwrap();
        let b = transform(&raw, &params).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_monochrome_output_is_bilevel() {
        let raw = gradient_source(800, 480);
        for dither in [DitherKind::FloydSteinberg, DitherKind::Ordered] {
            let mut params = TransformParams::for_canvas(800, 480);
            params.dither = dither;
            let rendered = transform(&raw, &params).unwrap();
            let decoded = image::load_from_memory(&rendered.bytes).unwrap().to_luma8();
            assert!(
                decoded.pixels().all(|p| p.0[0] == 0 || p.0[0] == 255),
                "{dither:?} produced gray levels"
            );
        }
    }

    #[test]
    fn test_color_output_stays_in_palette() {
        let raw = gradient_source(800, 480);
        let mut params = TransformParams::for_canvas(800, 480);
        params.display = DisplayClass::Color { colors: 7 };
        let rendered = transform(&raw, &params).unwrap();

        let decoded = image::load_from_memory(&rendered.bytes).unwrap().to_rgb8();
        let palette = &BASE_PALETTE[..7];
        assert!(decoded.pixels().all(|p| palette.contains(p)));
    }

    #[test]
    fn test_unsupported_depth() {
        let mut params = TransformParams::for_canvas(800, 480);
        params.display = DisplayClass::Color { colors: 42 };
        assert!(matches!(
            params.validate(4_000_000),
            Err(TransformError::UnsupportedDepth(_))
        ));

        params.display = DisplayClass::Color { colors: 1 };
        assert!(matches!(
            params.validate(4_000_000),
            Err(TransformError::UnsupportedDepth(_))
        ));
    }

    #[test]
    fn test_geometry_bounds() {
        let mut params = TransformParams::for_canvas(800, 480);
        params.rotation_deg = 20.0;
        assert!(matches!(
            params.validate(4_000_000),
            Err(TransformError::OutOfRange(_))
        ));

        let mut params = TransformParams::for_canvas(800, 480);
        params.offset_x = 201;
        assert!(params.validate(4_000_000).is_err());

        let mut params = TransformParams::for_canvas(800, 480);
        params.margins = Margins::uniform(400);
        assert!(params.validate(4_000_000).is_err());

        let params = TransformParams::for_canvas(4000, 3000);
        assert!(params.validate(4_000_000).is_err());

        assert!(TransformParams::for_canvas(800, 480).validate(4_000_000).is_ok());
    }

    #[test]
    fn test_offset_never_pushes_content_out() {
        // Solid red content with the most extreme legal offsets must survive
        // whole: every scaled pixel stays on the canvas.
        let red = RgbaImage::from_pixel(100, 100, Rgba([255, 0, 0, 255]));
        for (ox, oy) in [(200, 200), (-200, -200), (200, -200), (-200, 200)] {
            let mut params = TransformParams::for_canvas(800, 480);
            params.offset_x = ox;
            params.offset_y = oy;
            let canvas = compose(&red, &params).unwrap();

            // 100x100 fit into 800x480 scales by 4.8 to 480x480.
            let red_count = canvas
                .pixels()
                .filter(|p| p.0[0] > 200 && p.0[1] < 60 && p.0[2] < 60)
                .count();
            assert_eq!(red_count, 480 * 480, "offset ({ox}, {oy}) clipped content");
        }
    }

    #[test]
    fn test_margins_inset_content() {
        let red = RgbaImage::from_pixel(800, 480, Rgba([255, 0, 0, 255]));
        let mut params = TransformParams::for_canvas(800, 480);
        params.margins = Margins::uniform(40);
        let canvas = compose(&red, &params).unwrap();

        // Border ring stays background.
        for x in 0..800 {
            assert_eq!(*canvas.get_pixel(x, 10), BACKGROUND);
            assert_eq!(*canvas.get_pixel(x, 469), BACKGROUND);
        }
        // Content center is red.
        assert_eq!(canvas.get_pixel(400, 240).0[0], 255);
        assert!(canvas.get_pixel(400, 240).0[1] < 60);
    }

    #[test]
    fn test_orientation_round_trip() {
        let raw = RgbaImage::from_fn(64, 32, |x, y| {
            Rgba([(x * 4) as u8, (y * 8) as u8, 7, 255])
        });

        let once = Orientation::LandscapeInverted.apply(raw.clone());
        let twice = Orientation::LandscapeInverted.apply(once);
        assert_eq!(raw.as_raw(), twice.as_raw());

        // Portrait then its inverse transpose also restores the original.
        let there = Orientation::Portrait.apply(raw.clone());
        let back = Orientation::PortraitInverted.apply(there);
        assert_eq!(raw.as_raw(), back.as_raw());
    }

    #[test]
    fn test_rotation_fills_corners_with_background() {
        let black = RgbaImage::from_pixel(200, 100, Rgba([0, 0, 0, 255]));
        let rotated = rotate_fine(&black, 15.0);
        assert_eq!((rotated.width(), rotated.height()), (200, 100));
        // A 15° rotation exposes the corners.
        assert_eq!(*rotated.get_pixel(0, 0), BACKGROUND);
        assert_eq!(*rotated.get_pixel(199, 99), BACKGROUND);
        // The center is untouched.
        assert_eq!(rotated.get_pixel(100, 50).0[0], 0);
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let raw = gradient_source(800, 480);
        let params = TransformParams::for_canvas(800, 480);
        let plain = transform(&raw, &params).unwrap();

        let mut rotated = params.clone();
        rotated.rotation_deg = 0.0;
        assert_eq!(plain.bytes, transform(&raw, &rotated).unwrap().bytes);
    }

    #[test]
    fn test_fallback_carries_marker() {
        for display in [DisplayClass::Monochrome, DisplayClass::Color { colors: 7 }] {
            let rendered =
                fallback(800, 480, display, DitherKind::FloydSteinberg).unwrap();
            assert_eq!((rendered.width, rendered.height), (800, 480));
            assert!(has_fallback_marker(&rendered.bytes), "{display:?}");
        }

        // A real gradient render does not trip the marker check.
        let raw = gradient_source(800, 480);
        let real = transform(&raw, &TransformParams::for_canvas(800, 480)).unwrap();
        assert!(!has_fallback_marker(&real.bytes));
    }

    #[test]
    fn test_palette_nearest_mapping() {
        let palette = DevicePalette::new(&BASE_PALETTE[..7]);
        let mut nearly_red = Rgb([250, 10, 4]);
        palette.map_color(&mut nearly_red);
        assert_eq!(nearly_red, Rgb([255, 0, 0]));

        let mut nearly_white = Rgb([240, 250, 245]);
        palette.map_color(&mut nearly_white);
        assert_eq!(nearly_white, Rgb([255, 255, 255]));
    }
}
