//! Re-encoding of stored photos.
//!
//! A stored file is decoded, its EXIF orientation baked into the pixels,
//! its colour mode normalised, optionally downscaled, and written back in
//! the same format. JPEG output carries an explicit `Orientation = 1`; the
//! other encoders write no EXIF at all. The replacement goes through a
//! sibling temp file and a rename, so a failure never leaves a half-written
//! photo behind.

use crate::error::OptimizeError;
use crate::media::ImageKind;
use crate::orientation::{self, Orientation};
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_WIDTH: u32 = 1920;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    /// Wider images are scaled down to this width. `None` keeps the size.
    pub max_width: Option<u32>,
    pub jpeg_quality: u8,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            max_width: Some(DEFAULT_MAX_WIDTH),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Optimized {
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
    pub corrected: Orientation,
}

/// A stored file read into memory, with its format and orientation resolved.
pub struct StoredSource {
    pub path: PathBuf,
    pub kind: ImageKind,
    pub orientation: Orientation,
    bytes: Vec<u8>,
}

impl StoredSource {
    pub fn read(path: &Path) -> Result<Self, OptimizeError> {
        let bytes = std::fs::read(path).map_err(|source| OptimizeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        // Content wins over the extension so the file keeps matching the
        // MIME type recorded at upload.
        let kind = ImageKind::sniff(&bytes)
            .or_else(|| ImageKind::from_path(path))
            .ok_or_else(|| OptimizeError::Unsupported {
                path: path.to_path_buf(),
            })?;
        let orientation = orientation::read_orientation(&bytes);
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            orientation,
            bytes,
        })
    }

    pub fn decode(&self) -> Result<DynamicImage, OptimizeError> {
        image::load_from_memory_with_format(&self.bytes, self.kind.image_format()).map_err(
            |source| OptimizeError::Decode {
                path: self.path.clone(),
                source,
            },
        )
    }
}

/// Normalise a stored photo in place: orientation, colour, size, encoding.
pub fn optimize_file(path: &Path, opts: &EncodeOptions) -> Result<Optimized, OptimizeError> {
    let source = StoredSource::read(path)?;
    let img = source.decode()?;
    let img = prepare(img, source.orientation, opts.max_width);
    let (width, height) = img.dimensions();
    let bytes = rewrite(&source.path, source.kind, &img, opts.jpeg_quality)?;
    tracing::debug!(path = %path.display(), width, height, bytes, orientation = source.orientation.tag(), "optimized photo");
    Ok(Optimized {
        width,
        height,
        bytes,
        corrected: source.orientation,
    })
}

/// Orientation first, then colour, then size.
pub fn prepare(img: DynamicImage, orientation: Orientation, max_width: Option<u32>) -> DynamicImage {
    let img = orientation::apply(img, orientation);
    let img = normalize_color(img);
    match max_width {
        Some(mw) => downscale_to_width(img, mw),
        None => img,
    }
}

/// Drop alpha (and anything deeper than 8 bits). Grey stays grey.
pub fn normalize_color(img: DynamicImage) -> DynamicImage {
    match img.color() {
        ColorType::Rgb8 | ColorType::L8 => img,
        ColorType::L16 => DynamicImage::ImageLuma8(img.to_luma8()),
        _ => DynamicImage::ImageRgb8(img.to_rgb8()),
    }
}

/// Target size for a width cap, or `None` when the image already fits.
pub fn scaled_size(width: u32, height: u32, max_width: u32) -> Option<(u32, u32)> {
    if width <= max_width || width == 0 {
        return None;
    }
    let h = (height as f64 * max_width as f64 / width as f64).round() as u32;
    Some((max_width, h.max(1)))
}

pub fn downscale_to_width(img: DynamicImage, max_width: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    match scaled_size(w, h, max_width) {
        Some((nw, nh)) => img.resize_exact(nw, nh, FilterType::Lanczos3),
        None => img,
    }
}

/// Serialise `img` as `kind`.
pub fn encode(img: &DynamicImage, kind: ImageKind, jpeg_quality: u8) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    match kind {
        ImageKind::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality);
            img.write_with_encoder(encoder)
                .map_err(|e| format!("jpeg encode failed: {e}"))?;
            let block = orientation::exif_block(Orientation::Identity)
                .map_err(|e| format!("exif block failed: {e}"))?;
            return orientation::insert_jpeg_exif(&buf, &block)
                .ok_or_else(|| "jpeg encoder produced no SOI marker".to_string());
        }
        ImageKind::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut buf, CompressionType::Best, PngFilter::Adaptive);
            img.write_with_encoder(encoder)
                .map_err(|e| format!("png encode failed: {e}"))?;
        }
        ImageKind::Gif => {
            let mut encoder = GifEncoder::new(&mut buf);
            encoder
                .encode_frame(image::Frame::new(img.to_rgba8()))
                .map_err(|e| format!("gif encode failed: {e}"))?;
        }
        ImageKind::Webp => {
            let encoder = WebPEncoder::new_lossless(&mut buf);
            img.write_with_encoder(encoder)
                .map_err(|e| format!("webp encode failed: {e}"))?;
        }
    }
    Ok(buf)
}

/// Encode and atomically replace the file at `path`. Returns the new size.
pub fn rewrite(
    path: &Path,
    kind: ImageKind,
    img: &DynamicImage,
    jpeg_quality: u8,
) -> Result<u64, OptimizeError> {
    let bytes = encode(img, kind, jpeg_quality).map_err(|message| OptimizeError::Encode {
        path: path.to_path_buf(),
        message,
    })?;
    replace_file(path, &bytes).map_err(|source| OptimizeError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(bytes.len() as u64)
}

fn replace_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.{:08x}.tmp", rand::random::<u32>()));
    if let Err(e) = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}
