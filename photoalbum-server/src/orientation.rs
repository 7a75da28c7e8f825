//! EXIF orientation: reading the tag and baking it into the pixels.

use image::DynamicImage;
use std::io::Cursor;

/// The eight EXIF orientations, named by the transform that makes the
/// stored pixels display upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Identity,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Transpose,
    Rotate90Cw,
    Transverse,
    Rotate90Ccw,
}

impl Orientation {
    pub const ALL: [Orientation; 8] = [
        Orientation::Identity,
        Orientation::FlipHorizontal,
        Orientation::Rotate180,
        Orientation::FlipVertical,
        Orientation::Transpose,
        Orientation::Rotate90Cw,
        Orientation::Transverse,
        Orientation::Rotate90Ccw,
    ];

    /// Anything outside 1..=8 is treated as identity.
    pub fn from_tag(tag: u16) -> Self {
        match tag {
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Transpose,
            6 => Self::Rotate90Cw,
            7 => Self::Transverse,
            8 => Self::Rotate90Ccw,
            _ => Self::Identity,
        }
    }

    pub fn tag(self) -> u16 {
        match self {
            Self::Identity => 1,
            Self::FlipHorizontal => 2,
            Self::Rotate180 => 3,
            Self::FlipVertical => 4,
            Self::Transpose => 5,
            Self::Rotate90Cw => 6,
            Self::Transverse => 7,
            Self::Rotate90Ccw => 8,
        }
    }

    pub fn is_identity(self) -> bool {
        self == Self::Identity
    }

    /// The orientation that undoes this one. Only the two quarter turns
    /// differ from themselves.
    pub fn inverse(self) -> Self {
        match self {
            Self::Rotate90Cw => Self::Rotate90Ccw,
            Self::Rotate90Ccw => Self::Rotate90Cw,
            other => other,
        }
    }

    /// True when correcting swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Self::Transpose | Self::Rotate90Cw | Self::Transverse | Self::Rotate90Ccw
        )
    }
}

/// Read the primary-IFD orientation tag from encoded image bytes. Missing or
/// unreadable metadata is identity; this never fails.
pub fn read_orientation(bytes: &[u8]) -> Orientation {
    let mut cursor = Cursor::new(bytes);
    let reader = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(r) => r,
        Err(_) => return Orientation::Identity,
    };
    let Some(field) = reader.get_field(exif::Tag::Orientation, exif::In::PRIMARY) else {
        return Orientation::Identity;
    };
    // SHORT per the standard, but some writers store LONG or BYTE.
    if let Some(val) = field.value.get_uint(0) {
        return u16::try_from(val)
            .map(Orientation::from_tag)
            .unwrap_or_default();
    }
    // ASCII digits, as a last resort.
    match field.value {
        exif::Value::Ascii(ref parts) => parts
            .first()
            .and_then(|p| std::str::from_utf8(p).ok())
            .and_then(|s| s.trim().parse::<u16>().ok())
            .map(Orientation::from_tag)
            .unwrap_or_default(),
        _ => Orientation::Identity,
    }
}

/// Apply the pixel transform for `orientation`. Colour type is preserved.
pub fn apply(img: DynamicImage, orientation: Orientation) -> DynamicImage {
    match orientation {
        Orientation::Identity => img,
        Orientation::FlipHorizontal => img.fliph(),
        Orientation::Rotate180 => img.rotate180(),
        Orientation::FlipVertical => img.flipv(),
        Orientation::Transpose => img.rotate90().fliph(),
        Orientation::Rotate90Cw => img.rotate90(),
        Orientation::Transverse => img.rotate270().fliph(),
        Orientation::Rotate90Ccw => img.rotate270(),
    }
}

/// TIFF-encoded EXIF block holding a single `Orientation` field.
pub fn exif_block(orientation: Orientation) -> Result<Vec<u8>, exif::Error> {
    orientation_block(exif::Value::Short(vec![orientation.tag()]))
}

fn orientation_block(value: exif::Value) -> Result<Vec<u8>, exif::Error> {
    let field = exif::Field {
        tag: exif::Tag::Orientation,
        ifd_num: exif::In::PRIMARY,
        value,
    };
    let mut writer = exif::experimental::Writer::new();
    writer.push_field(&field);
    let mut buf = Cursor::new(Vec::new());
    writer.write(&mut buf, false)?;
    Ok(buf.into_inner())
}

/// Splice an EXIF APP1 segment into a JPEG: after the JFIF APP0 segment when
/// there is one, otherwise right after SOI.
pub fn insert_jpeg_exif(jpeg: &[u8], tiff: &[u8]) -> Option<Vec<u8>> {
    const SOI: [u8; 2] = [0xff, 0xd8];
    const APP0: [u8; 2] = [0xff, 0xe0];
    const EXIF_HEADER: &[u8] = b"Exif\0\0";
    if jpeg.len() < 2 || jpeg[..2] != SOI {
        return None;
    }
    let at = if jpeg.len() >= 6 && jpeg[2..4] == APP0 {
        let end = 4 + u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize;
        if end > jpeg.len() {
            return None;
        }
        end
    } else {
        2
    };
    let seg_len = u16::try_from(2 + EXIF_HEADER.len() + tiff.len()).ok()?;
    let mut out = Vec::with_capacity(jpeg.len() + seg_len as usize + 2);
    out.extend_from_slice(&jpeg[..at]);
    out.extend_from_slice(&[0xff, 0xe1]);
    out.extend_from_slice(&seg_len.to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(tiff);
    out.extend_from_slice(&jpeg[at..]);
    Some(out)
}
