use crate::error::ValidationError;
use crate::media::ImageKind;

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// What the upload handler knows about a file before it is stored.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub len: u64,
    pub declared_type: Option<&'a str>,
    /// The first bytes of the upload (the whole body is fine too).
    pub head: &'a [u8],
}

/// Check size, declared type and sniffed type, in that order. Returns the
/// sniffed kind, which is what gets recorded for the stored file.
pub fn validate(candidate: &Candidate<'_>, max_bytes: u64) -> Result<ImageKind, ValidationError> {
    if candidate.len > max_bytes {
        return Err(ValidationError::TooLarge {
            size: candidate.len,
            limit: max_bytes,
        });
    }
    let declared = candidate.declared_type.unwrap_or("");
    if ImageKind::from_mime(declared).is_none() {
        return Err(ValidationError::UnsupportedType(declared.to_string()));
    }
    ImageKind::sniff(candidate.head).ok_or_else(|| {
        tracing::debug!(declared = %declared, "declared image type does not match content");
        ValidationError::UnsupportedType(format!("{declared} (content not recognised)"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const JPEG_HEAD: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    const PNG_HEAD: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0x0d];
    const GIF_HEAD: &[u8] = b"GIF89a\x01\x00\x01\x00";
    const WEBP_HEAD: &[u8] = b"RIFF\x24\x00\x00\x00WEBPVP8 ";

    fn candidate<'a>(len: u64, declared: &'a str, head: &'a [u8]) -> Candidate<'a> {
        Candidate {
            len,
            declared_type: Some(declared),
            head,
        }
    }

    #[test]
    fn rejects_eleven_mib() {
        let c = candidate(11 * 1024 * 1024, "image/jpeg", JPEG_HEAD);
        assert!(matches!(
            validate(&c, DEFAULT_MAX_UPLOAD_BYTES),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn accepts_exactly_ten_mib() {
        let c = candidate(10 * 1024 * 1024, "image/jpeg", JPEG_HEAD);
        assert_eq!(
            validate(&c, DEFAULT_MAX_UPLOAD_BYTES).unwrap(),
            ImageKind::Jpeg
        );
    }

    #[test]
    fn rejects_pdf() {
        let c = candidate(1024, "application/pdf", b"%PDF-1.4");
        assert!(matches!(
            validate(&c, DEFAULT_MAX_UPLOAD_BYTES),
            Err(ValidationError::UnsupportedType(_))
        ));
    }

    #[test]
    fn accepts_each_allowed_type() {
        for (mime, head, kind) in [
            ("image/jpeg", JPEG_HEAD, ImageKind::Jpeg),
            ("image/png", PNG_HEAD, ImageKind::Png),
            ("image/gif", GIF_HEAD, ImageKind::Gif),
            ("image/webp", WEBP_HEAD, ImageKind::Webp),
        ] {
            let c = candidate(head.len() as u64, mime, head);
            assert_eq!(validate(&c, DEFAULT_MAX_UPLOAD_BYTES).unwrap(), kind, "{mime}");
        }
    }

    #[test]
    fn declared_image_with_foreign_content_is_rejected() {
        let c = candidate(8, "image/png", b"%PDF-1.4");
        assert!(matches!(
            validate(&c, DEFAULT_MAX_UPLOAD_BYTES),
            Err(ValidationError::UnsupportedType(_))
        ));
    }

    #[test]
    fn missing_declared_type_is_rejected() {
        let c = Candidate {
            len: 12,
            declared_type: None,
            head: PNG_HEAD,
        };
        assert!(validate(&c, DEFAULT_MAX_UPLOAD_BYTES).is_err());
    }
}
