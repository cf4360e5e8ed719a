//! Access to the raw capture store.
//!
//! The capture store is append-only and owned by the scraper. Passes see it
//! only through [`RawCapture`]: restartable, lazily produced sequences of
//! handles plus a way to read the bytes behind one handle. Calling
//! `batches()` or `images()` again starts a fresh traversal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Errors that can occur while reading raw captures.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to walk capture directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Failed to read {id}: {source}")]
    Read {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image file name {id} does not carry a message id")]
    InvalidImageName { id: String },

    #[error("Capture entry not found: {0}")]
    NotFound(String),
}

/// One raw message batch file (one day's capture for one channel).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchHandle {
    /// Stable identifier, e.g. `2025-01-15/chan_a.json`
    pub id: String,
}

/// One captured image, identified by the message it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub message_id: i64,
    pub channel_name: String,
    /// Stable identifier, e.g. `chan_a/2.jpg`
    pub id: String,
}

pub type HandleIter<'a, T> = Box<dyn Iterator<Item = Result<T, CaptureError>> + Send + 'a>;

/// Read-only view of a raw capture store.
pub trait RawCapture: Send + Sync {
    /// Every message batch, in a stable order
    fn batches(&self) -> HandleIter<'_, BatchHandle>;

    /// Raw JSON bytes of one batch
    fn read_batch(&self, handle: &BatchHandle) -> Result<Vec<u8>, CaptureError>;

    /// Every captured image, in a stable order. Files whose name does not
    /// parse as a message id are yielded as `InvalidImageName` errors.
    fn images(&self) -> HandleIter<'_, ImageHandle>;

    /// Encoded bytes of one image
    fn read_image(&self, handle: &ImageHandle) -> Result<Vec<u8>, CaptureError>;
}

/// Build an image handle from its channel directory and file name.
pub fn parse_image_handle(channel_name: &str, file_name: &str) -> Result<ImageHandle, CaptureError> {
    let id = format!("{channel_name}/{file_name}");
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| CaptureError::InvalidImageName { id: id.clone() })?;

    let message_id = stem
        .parse::<i64>()
        .map_err(|_| CaptureError::InvalidImageName { id: id.clone() })?;

    Ok(ImageHandle {
        message_id,
        channel_name: channel_name.to_string(),
        id,
    })
}

/// Capture store laid out on the local filesystem:
///
/// ```text
/// <messages_dir>/<YYYY-MM-DD>/<anything>.json
/// <images_dir>/<channel_name>/<message_id>.<ext>
/// ```
#[derive(Debug, Clone)]
pub struct FsCapture {
    messages_dir: PathBuf,
    images_dir: PathBuf,
    image_extensions: Vec<String>,
}

impl FsCapture {
    pub fn new(
        messages_dir: impl Into<PathBuf>,
        images_dir: impl Into<PathBuf>,
        image_extensions: Vec<String>,
    ) -> Self {
        Self {
            messages_dir: messages_dir.into(),
            images_dir: images_dir.into(),
            image_extensions: image_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn has_image_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.image_extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn read(root: &Path, id: &str) -> Result<Vec<u8>, CaptureError> {
        std::fs::read(root.join(id)).map_err(|source| CaptureError::Read {
            id: id.to_string(),
            source,
        })
    }
}

/// Files exactly one directory below `root`, hidden entries skipped
fn second_level_files(root: &Path) -> impl Iterator<Item = Result<DirEntry, walkdir::Error>> + Send {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter(|entry| match entry {
            Ok(e) => e.file_type().is_file(),
            Err(_) => true,
        })
}

fn relative_id(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl RawCapture for FsCapture {
    fn batches(&self) -> HandleIter<'_, BatchHandle> {
        let root = self.messages_dir.as_path();
        Box::new(second_level_files(root).filter_map(move |entry| match entry {
            Ok(e) => {
                let is_json = e
                    .path()
                    .extension()
                    .map(|x| x.eq_ignore_ascii_case("json"))
                    .unwrap_or(false);
                is_json.then(|| {
                    Ok(BatchHandle {
                        id: relative_id(root, e.path()),
                    })
                })
            }
            Err(err) => Some(Err(CaptureError::Walk(err))),
        }))
    }

    fn read_batch(&self, handle: &BatchHandle) -> Result<Vec<u8>, CaptureError> {
        Self::read(&self.messages_dir, &handle.id)
    }

    fn images(&self) -> HandleIter<'_, ImageHandle> {
        let root = self.images_dir.as_path();
        Box::new(second_level_files(root).filter_map(move |entry| match entry {
            Ok(e) if self.has_image_extension(e.path()) => {
                let channel = e
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let file_name = e.file_name().to_string_lossy();
                Some(parse_image_handle(&channel, &file_name))
            }
            Ok(_) => None,
            Err(err) => Some(Err(CaptureError::Walk(err))),
        }))
    }

    fn read_image(&self, handle: &ImageHandle) -> Result<Vec<u8>, CaptureError> {
        Self::read(&self.images_dir, &handle.id)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Capture store held in memory, for tests and replaying captures from
/// other media.
#[derive(Debug, Clone, Default)]
pub struct MemoryCapture {
    batches: BTreeMap<String, Vec<u8>>,
    /// (channel, file name) -> bytes
    images: BTreeMap<(String, String), Vec<u8>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch(mut self, id: impl Into<String>, json: impl Into<Vec<u8>>) -> Self {
        self.batches.insert(id.into(), json.into());
        self
    }

    pub fn with_image(
        mut self,
        channel_name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        self.images
            .insert((channel_name.into(), file_name.into()), bytes.into());
        self
    }
}

impl RawCapture for MemoryCapture {
    fn batches(&self) -> HandleIter<'_, BatchHandle> {
        Box::new(
            self.batches
                .keys()
                .map(|id| Ok(BatchHandle { id: id.clone() })),
        )
    }

    fn read_batch(&self, handle: &BatchHandle) -> Result<Vec<u8>, CaptureError> {
        self.batches
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| CaptureError::NotFound(handle.id.clone()))
    }

    fn images(&self) -> HandleIter<'_, ImageHandle> {
        Box::new(
            self.images
                .keys()
                .map(|(channel, file_name)| parse_image_handle(channel, file_name)),
        )
    }

    fn read_image(&self, handle: &ImageHandle) -> Result<Vec<u8>, CaptureError> {
        handle
            .id
            .split_once('/')
            .and_then(|(channel, file_name)| {
                self.images
                    .get(&(channel.to_string(), file_name.to_string()))
            })
            .cloned()
            .ok_or_else(|| CaptureError::NotFound(handle.id.clone()))
    }
}
