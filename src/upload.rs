use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::blocking::multipart;
use serde::Deserialize;

use crate::api::{self, Backend};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    fn label(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_image_bytes: 10 * MIB,
            max_video_bytes: 50 * MIB,
        }
    }
}

impl UploadLimits {
    fn limit_for(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("{0}")]
    TooLarge(SizeViolation),
    #[error("cannot read {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeViolation {
    pub path: PathBuf,
    pub kind: MediaKind,
    pub size: u64,
    pub limit: u64,
}

impl fmt::Display for SizeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} is {:.1} MB, over the {:.1} MB {} limit",
            self.path.display(),
            self.size as f64 / MIB as f64,
            self.limit as f64 / MIB as f64,
            self.kind.label()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub path: PathBuf,
    pub mime: &'static str,
    pub kind: MediaKind,
    pub size: u64,
}

fn mime_for_extension(ext: &str) -> Option<(&'static str, MediaKind)> {
    let mapped = match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => ("image/jpeg", MediaKind::Image),
        "png" => ("image/png", MediaKind::Image),
        "gif" => ("image/gif", MediaKind::Image),
        "webp" => ("image/webp", MediaKind::Image),
        "mp4" | "m4v" => ("video/mp4", MediaKind::Video),
        "mov" => ("video/quicktime", MediaKind::Video),
        "webm" => ("video/webm", MediaKind::Video),
        _ => return None,
    };
    Some(mapped)
}

pub fn validate(path: &Path, limits: &UploadLimits) -> Result<ValidatedUpload, UploadError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let (mime, kind) = mime_for_extension(ext)
        .ok_or_else(|| UploadError::UnsupportedType(format!("'.{}' files", ext)))?;

    let unreadable = |source| UploadError::Unreadable {
        path: path.to_path_buf(),
        source,
    };
    let size = std::fs::metadata(path).map_err(unreadable)?.len();
    let limit = limits.limit_for(kind);
    if size > limit {
        return Err(UploadError::TooLarge(SizeViolation {
            path: path.to_path_buf(),
            kind,
            size,
            limit,
        }));
    }

    let mut head = [0u8; 512];
    let read = File::open(path)
        .and_then(|mut f| f.read(&mut head))
        .map_err(unreadable)?;
    let sniffed = tree_magic_mini::from_u8(&head[..read]);
    let sniffed_kind = if sniffed.starts_with("image/") {
        Some(MediaKind::Image)
    } else if sniffed.starts_with("video/") {
        Some(MediaKind::Video)
    } else {
        None
    };
    if let Some(actual) = sniffed_kind {
        if actual != kind {
            return Err(UploadError::UnsupportedType(format!(
                "{} content in a .{} file",
                sniffed, ext
            )));
        }
    }

    Ok(ValidatedUpload {
        path: path.to_path_buf(),
        mime,
        kind,
        size,
    })
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(alias = "media_url", alias = "file_url")]
    url: String,
}

pub struct MediaService {
    backend: Arc<dyn Backend>,
    limits: UploadLimits,
}

impl MediaService {
    pub fn new(backend: Arc<dyn Backend>, limits: UploadLimits) -> Self {
        Self { backend, limits }
    }

    pub fn upload(&self, path: &Path) -> Result<String> {
        let upload = validate(path, &self.limits)?;
        let part = multipart::Part::file(&upload.path)
            .with_context(|| format!("media: open {}", upload.path.display()))?
            .mime_str(upload.mime)
            .context("media: set content type")?;
        let form = multipart::Form::new().part("file", part);
        let value = self
            .backend
            .upload_file("/media/upload", form)
            .context("media: upload")?;
        let resp: UploadResponse = api::decode(value).context("media: decode upload response")?;
        tracing::info!(path = %upload.path.display(), size = upload.size, "media uploaded");
        Ok(resp.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::FakeBackend;
    use serde_json::json;
    use tempfile::tempdir;

    const PNG_HEADER: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];

    #[test]
    fn oversized_video_rejected_before_network() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("launch.mp4");
        let file = File::create(&path).unwrap();
        file.set_len(60 * MIB).unwrap();

        let backend = Arc::new(FakeBackend::new());
        backend.respond("POST /media/upload", json!({"url": "https://cdn/x"}));
        let media = MediaService::new(backend.clone(), UploadLimits::default());

        let err = media.upload(&path).unwrap_err();
        let upload_err = err.downcast_ref::<UploadError>().expect("upload error");
        assert!(matches!(upload_err, UploadError::TooLarge(v) if v.kind == MediaKind::Video));
        assert!(err.to_string().contains("60.0 MB, over the 50.0 MB video limit"));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn size_message_keeps_fraction_of_a_megabyte() {
        let violation = SizeViolation {
            path: PathBuf::from("clip.mp4"),
            kind: MediaKind::Video,
            size: 50 * MIB + MIB / 2,
            limit: 50 * MIB,
        };
        assert_eq!(
            violation.to_string(),
            "clip.mp4 is 50.5 MB, over the 50.0 MB video limit"
        );
    }

    #[test]
    fn unsupported_extension_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        let err = validate(&path, &UploadLimits::default()).unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedType(_)));
    }

    #[test]
    fn sniffed_content_must_match_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, PNG_HEADER).unwrap();
        let err = validate(&path, &UploadLimits::default()).unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedType(_)));
    }

    #[test]
    fn valid_image_uploads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("banner.PNG");
        std::fs::write(&path, PNG_HEADER).unwrap();

        let upload = validate(&path, &UploadLimits::default()).unwrap();
        assert_eq!(upload.mime, "image/png");
        assert_eq!(upload.kind, MediaKind::Image);

        let backend = Arc::new(FakeBackend::new());
        backend.respond("POST /media/upload", json!({"media_url": "https://cdn/banner.png"}));
        let media = MediaService::new(backend.clone(), UploadLimits::default());
        assert_eq!(media.upload(&path).unwrap(), "https://cdn/banner.png");
        assert_eq!(backend.count("POST /media/upload"), 1);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = validate(Path::new("/nonexistent/photo.jpg"), &UploadLimits::default()).unwrap_err();
        assert!(matches!(err, UploadError::Unreadable { .. }));
    }
}
