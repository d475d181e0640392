//! Local attachment storage
//!
//! Attachments are written under the configured media directory and served
//! by the router at `/public/{key}`.

use std::path::{Path, PathBuf};

use crate::error::AppError;

/// Public path prefix for stored files
pub const PUBLIC_PREFIX: &str = "/public";

/// A file written to the media directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMedia {
    /// Key relative to the media directory
    pub key: String,
    /// Absolute URL the attachment is published under
    pub href: String,
    pub media_type: String,
    pub size: i64,
}

/// Media storage service
pub struct MediaStorage {
    root: PathBuf,
    /// e.g., "https://board.example.com"
    base_url: String,
}

impl MediaStorage {
    /// Create the media directory if needed
    pub async fn new(root: &Path, base_url: String) -> Result<Self, AppError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| AppError::Storage(format!("Cannot create {}: {}", root.display(), e)))?;

        Ok(Self {
            root: root.to_path_buf(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Write an attachment under a fresh key
    ///
    /// `media_type` must already have been checked against the allowed list.
    pub async fn store(&self, data: &[u8], media_type: &str) -> Result<StoredMedia, AppError> {
        let key = format!(
            "{}.{}",
            crate::data::EntityId::new().0.to_ascii_lowercase(),
            file_extension(media_type)
        );
        let path = self.root.join(&key);

        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AppError::Storage(format!("Write of {} failed: {}", path.display(), e)))?;
        tracing::debug!(%key, size = data.len(), "Stored attachment");

        Ok(StoredMedia {
            href: self.get_public_url(&key),
            key,
            media_type: media_type.to_string(),
            size: data.len() as i64,
        })
    }

    /// Delete a stored file; a missing file is not an error
    pub async fn delete(&self, key: &str) -> Result<(), AppError> {
        if key.contains('/') || key.contains("..") {
            return Err(AppError::Validation(format!("Invalid media key: {}", key)));
        }
        match tokio::fs::remove_file(self.root.join(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Delete of {} failed: {}", key, e))),
        }
    }

    /// Key of a locally stored attachment, from its public URL
    pub fn key_from_url<'a>(&self, href: &'a str) -> Option<&'a str> {
        href.strip_prefix(&self.base_url)?
            .strip_prefix(PUBLIC_PREFIX)?
            .strip_prefix('/')
    }

    pub fn get_public_url(&self, key: &str) -> String {
        format!("{}{}/{}", self.base_url, PUBLIC_PREFIX, key)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Content type from the leading bytes of a file
pub fn sniff_media_type(data: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xFF\xD8\xFF", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"\x1A\x45\xDF\xA3", "video/webm"),
        (b"%PDF-", "application/pdf"),
        (b"OggS", "audio/ogg"),
        (b"ID3", "audio/mpeg"),
    ];

    if let Some((_, media_type)) = SIGNATURES.iter().find(|(magic, _)| data.starts_with(magic)) {
        return Some(media_type);
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return Some("video/mp4");
    }
    None
}

fn file_extension(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
