//! Image loading for uploads
//!
//! Adapters never touch the filesystem directly; they ask an [`ImageSource`]
//! for the bytes and metadata of each [`ImageRef`].

use async_trait::async_trait;
use std::path::Path;

use crate::config::expand_path;
use crate::error::{PlatformError, Result};
use crate::types::{ImageMimeType, ImageRef};

/// An image ready for upload
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub bytes: Vec<u8>,
    pub mime: ImageMimeType,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub alt_text: Option<String>,
}

impl LoadedImage {
    /// Alt text or an empty string, for APIs that require the field
    pub fn alt(&self) -> &str {
        self.alt_text.as_deref().unwrap_or("")
    }

    /// File name to present in multipart uploads
    pub fn file_name(&self, index: usize) -> String {
        format!("image-{}.{}", index, self.mime.extension())
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn read_image(&self, image: &ImageRef) -> Result<LoadedImage>;
}

/// Reads images from local files, MIME type taken from the extension
///
/// Width and height are read from the file header when the format is
/// recognized; a header that cannot be parsed leaves them unset.
#[derive(Debug, Clone, Default)]
pub struct FsImageSource {
    max_bytes: Option<u64>,
}

impl FsImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject files larger than `max_bytes`
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

#[async_trait]
impl ImageSource for FsImageSource {
    async fn read_image(&self, image: &ImageRef) -> Result<LoadedImage> {
        let path = expand_path(&image.source)?;

        let mime = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ImageMimeType::from_extension)
            .ok_or_else(|| {
                PlatformError::Validation(format!(
                    "Unsupported image type: {} (expected jpg, png, gif or webp)",
                    path.display()
                ))
            })?;

        let bytes = read_file(&path).await?;

        if let Some(max) = self.max_bytes {
            if bytes.len() as u64 > max {
                return Err(PlatformError::Validation(format!(
                    "Image {} is {} bytes, larger than the {} byte limit",
                    path.display(),
                    bytes.len(),
                    max
                ))
                .into());
            }
        }

        let dimensions = header_dimensions(mime, &bytes);
        Ok(LoadedImage {
            bytes,
            mime,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            alt_text: image.alt_text.clone(),
        })
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        PlatformError::Validation(format!("Failed to read image {}: {}", path.display(), e)).into()
    })
}

fn be16(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 2)?;
    Some(u32::from(u16::from_be_bytes([b[0], b[1]])))
}

fn le16(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 2)?;
    Some(u32::from(u16::from_le_bytes([b[0], b[1]])))
}

fn le24(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 3)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

/// Pixel size from the image header, `None` when it cannot be read
pub fn header_dimensions(mime: ImageMimeType, bytes: &[u8]) -> Option<(u32, u32)> {
    let (width, height) = match mime {
        ImageMimeType::Png => {
            if !bytes.starts_with(b"\x89PNG\r\n\x1a\n") || bytes.get(12..16) != Some(&b"IHDR"[..]) {
                return None;
            }
            let w = bytes.get(16..20)?;
            let h = bytes.get(20..24)?;
            (
                u32::from_be_bytes([w[0], w[1], w[2], w[3]]),
                u32::from_be_bytes([h[0], h[1], h[2], h[3]]),
            )
        }
        ImageMimeType::Gif => {
            if !bytes.starts_with(b"GIF87a") && !bytes.starts_with(b"GIF89a") {
                return None;
            }
            (le16(bytes, 6)?, le16(bytes, 8)?)
        }
        ImageMimeType::Jpeg => jpeg_dimensions(bytes)?,
        ImageMimeType::WebP => {
            if !bytes.starts_with(b"RIFF") || bytes.get(8..12) != Some(&b"WEBP"[..]) {
                return None;
            }
            match bytes.get(12..16)? {
                b"VP8 " => (le16(bytes, 26)? & 0x3fff, le16(bytes, 28)? & 0x3fff),
                b"VP8L" => {
                    let b = bytes.get(21..25)?;
                    let bits = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                    ((bits & 0x3fff) + 1, ((bits >> 14) & 0x3fff) + 1)
                }
                b"VP8X" => (le24(bytes, 24)? + 1, le24(bytes, 27)? + 1),
                _ => return None,
            }
        }
    };
    (width > 0 && height > 0).then_some((width, height))
}

/// Walk the JPEG segments up to the first start-of-frame marker
fn jpeg_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if !bytes.starts_with(&[0xff, 0xd8]) {
        return None;
    }
    let mut at = 2;
    loop {
        if *bytes.get(at)? != 0xff {
            return None;
        }
        let marker = *bytes.get(at + 1)?;
        match marker {
            // fill byte
            0xff => at += 1,
            0x01 | 0xd0..=0xd7 => at += 2,
            0xc0..=0xcf if !matches!(marker, 0xc4 | 0xc8 | 0xcc) => {
                return Some((be16(bytes, at + 7)?, be16(bytes, at + 5)?));
            }
            0xd9 | 0xda => return None,
            _ => at += 2 + usize::try_from(be16(bytes, at + 2)?).ok()?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_file_and_detects_mime() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cat.PNG");
        std::fs::write(&path, b"\x89PNG fake").unwrap();

        let image = ImageRef::new(path.to_str().unwrap()).with_alt_text("A cat");
        let loaded = FsImageSource::new().read_image(&image).await.unwrap();

        assert_eq!(loaded.mime, ImageMimeType::Png);
        assert_eq!(loaded.bytes, b"\x89PNG fake");
        assert_eq!(loaded.alt(), "A cat");
        assert_eq!(loaded.file_name(0), "image-0.png");
        assert_eq!(loaded.width, None);
    }

    /// PNG signature plus an IHDR chunk header for a `width` x `height` image
    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDR".to_vec();
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    #[tokio::test]
    async fn test_reads_dimensions_from_png_header() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("wide.png");
        std::fs::write(&path, png_header(1200, 630)).unwrap();

        let loaded = FsImageSource::new()
            .read_image(&ImageRef::new(path.to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!((loaded.width, loaded.height), (Some(1200), Some(630)));
    }

    #[test]
    fn test_header_dimensions_for_each_format() {
        let gif = b"GIF89a\x40\x01\xf0\x00rest";
        assert_eq!(header_dimensions(ImageMimeType::Gif, gif), Some((320, 240)));

        // SOI, an APP0 segment of 4 bytes, then SOF0 with 480x640
        let jpeg = [
            0xff, 0xd8, 0xff, 0xe0, 0x00, 0x04, 0x00, 0x00, 0xff, 0xc0, 0x00, 0x11, 0x08, 0x01,
            0xe0, 0x02, 0x80, 0x03,
        ];
        assert_eq!(header_dimensions(ImageMimeType::Jpeg, &jpeg), Some((640, 480)));

        let mut webp = b"RIFF\x00\x00\x00\x00WEBPVP8X\x0a\x00\x00\x00\x00\x00\x00\x00".to_vec();
        webp.extend_from_slice(&[0x1f, 0x03, 0x00, 0x57, 0x02, 0x00]);
        assert_eq!(header_dimensions(ImageMimeType::WebP, &webp), Some((800, 600)));
    }

    #[test]
    fn test_header_dimensions_rejects_garbage() {
        assert_eq!(header_dimensions(ImageMimeType::Png, b"\x89PNG fake"), None);
        assert_eq!(header_dimensions(ImageMimeType::Jpeg, b"\xff\xd8\xff"), None);
        assert_eq!(header_dimensions(ImageMimeType::Png, &png_header(0, 10)), None);
        assert_eq!(header_dimensions(ImageMimeType::Gif, b"GIF89a"), None);
    }

    #[tokio::test]
    async fn test_rejects_unknown_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF").unwrap();

        let result = FsImageSource::new()
            .read_image(&ImageRef::new(path.to_str().unwrap()))
            .await;
        assert!(result.unwrap_err().to_string().contains("Unsupported image type"));
    }

    #[tokio::test]
    async fn test_rejects_missing_file() {
        let result = FsImageSource::new()
            .read_image(&ImageRef::new("/nonexistent/cat.jpg"))
            .await;
        assert!(result.unwrap_err().to_string().contains("Failed to read image"));
    }

    #[tokio::test]
    async fn test_rejects_oversized_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("big.jpg");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let result = FsImageSource::new()
            .with_max_bytes(10)
            .read_image(&ImageRef::new(path.to_str().unwrap()))
            .await;
        assert!(result.unwrap_err().to_string().contains("larger than"));
    }
}
