//! Loading an image file into an inline `data:` URL.

use std::io;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("unsupported image type: {}", .0.display())]
    UnsupportedType(PathBuf),
    #[error("failed to read image {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// MIME type for a file extension, case-insensitive.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        _ => return None,
    };
    Some(mime)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ImageError::NotFound(path.to_path_buf()));
        }
        let mime = mime_for_path(path).ok_or_else(|| ImageError::UnsupportedType(path.to_path_buf()))?;
        let bytes = tokio::fs::read(path).await.map_err(|source| ImageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { mime, bytes })
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, STANDARD.encode(&self.bytes))
    }
}
