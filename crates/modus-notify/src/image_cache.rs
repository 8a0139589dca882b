use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
};

use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage, imageops::FilterType};
use modus_types::{ImagePixmap, NotificationId, NotificationImage};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default edge length of cached thumbnails, in pixels.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 48;

const FILE_PREFIX: &str = "notification_";
const FILE_SUFFIX: &str = ".png";

/// Errors produced while caching an image.
#[derive(Debug, Error)]
pub enum ImageCacheError {
    /// The id contains characters that are not safe in a file name.
    #[error("notification id {0:?} cannot be used as a file name")]
    UnsafeId(String),
    /// Decoding or encoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    /// A raw pixmap did not describe a usable buffer.
    #[error("invalid pixmap: {0}")]
    InvalidPixmap(&'static str),
    /// The cache directory could not be prepared.
    #[error("cache directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Thumbnail cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
    thumbnail_size: u32,
}

impl ImageCache {
    /// Creates a cache writing `thumbnail_size` square thumbnails into `dir`.
    pub fn new(dir: impl Into<PathBuf>, thumbnail_size: u32) -> Self {
        Self {
            dir: dir.into(),
            thumbnail_size: thumbnail_size.max(1),
        }
    }

    /// Directory the thumbnails are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Edge length of the thumbnails.
    pub fn thumbnail_size(&self) -> u32 {
        self.thumbnail_size
    }

    /// Returns the thumbnail path for `id`, or `None` if the id is not a safe file name.
    pub fn path_for(&self, id: &NotificationId) -> Option<PathBuf> {
        is_safe_id(id.as_str()).then(|| {
            self.dir
                .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", id.as_str()))
        })
    }

    /// Stores a thumbnail for `id` and returns its path.
    ///
    /// Any failure is logged and reported as `None`; the notification then
    /// simply has no image.
    pub fn store(&self, id: &NotificationId, image: &NotificationImage) -> Option<PathBuf> {
        match self.try_store(id, image) {
            Ok(path) => {
                debug!(%id, path = %path.display(), "cached notification image");
                Some(path)
            }
            Err(err) => {
                warn!(%id, %err, "failed to cache notification image");
                None
            }
        }
    }

    /// Fallible variant of [`store`](Self::store).
    pub fn try_store(
        &self,
        id: &NotificationId,
        image: &NotificationImage,
    ) -> Result<PathBuf, ImageCacheError> {
        let path = self
            .path_for(id)
            .ok_or_else(|| ImageCacheError::UnsafeId(id.to_string()))?;

        let decoded = match image {
            NotificationImage::Encoded(bytes) => image::load_from_memory(bytes)?,
            NotificationImage::File(file) => image::open(strip_file_scheme(file))?,
            NotificationImage::Pixmap(pixmap) => pixmap_to_image(pixmap)?,
        };
        let thumbnail =
            decoded.resize_exact(self.thumbnail_size, self.thumbnail_size, FilterType::Triangle);

        fs::create_dir_all(&self.dir).map_err(|source| ImageCacheError::Io {
            path: self.dir.clone(),
            source,
        })?;
        thumbnail.save_with_format(&path, ImageFormat::Png)?;

        Ok(path)
    }

    /// Removes the thumbnail of `id`. Returns whether a file was removed.
    pub fn delete(&self, id: &NotificationId) -> bool {
        let Some(path) = self.path_for(id) else {
            return false;
        };

        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%id, path = %path.display(), "deleted cached image");
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(%id, path = %path.display(), %err, "failed to delete cached image");
                false
            }
        }
    }

    /// Deletes every thumbnail whose id is not in `valid_ids`.
    ///
    /// Files that do not follow the thumbnail naming scheme are left alone.
    /// Returns the number of files removed.
    pub fn sweep(&self, valid_ids: &HashSet<NotificationId>) -> usize {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return 0,
            Err(err) => {
                warn!(dir = %self.dir.display(), %err, "failed to scan image cache");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(id) = file_name.to_str().and_then(id_from_file_name) else {
                continue;
            };
            if valid_ids.contains(&NotificationId::from(id)) {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(file = ?file_name, %err, "failed to remove orphaned image"),
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "swept orphaned notification images");
        }
        removed
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn id_from_file_name(name: &str) -> Option<&str> {
    let id = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    is_safe_id(id).then_some(id)
}

fn strip_file_scheme(path: &Path) -> &Path {
    path.to_str()
        .and_then(|raw| raw.strip_prefix("file://"))
        .map_or(path, Path::new)
}

fn pixmap_to_image(pixmap: &ImagePixmap) -> Result<DynamicImage, ImageCacheError> {
    if pixmap.bits_per_sample != 8 {
        return Err(ImageCacheError::InvalidPixmap(
            "only 8 bits per sample are supported",
        ));
    }
    let channels = usize::from(pixmap.channels);
    if channels != if pixmap.has_alpha { 4 } else { 3 } {
        return Err(ImageCacheError::InvalidPixmap(
            "channel count does not match alpha flag",
        ));
    }

    let width = pixmap.width as usize;
    let height = pixmap.height as usize;
    let rowstride = pixmap.rowstride as usize;
    if width == 0 || height == 0 {
        return Err(ImageCacheError::InvalidPixmap("empty pixmap"));
    }

    let row_len = width * channels;
    if rowstride < row_len {
        return Err(ImageCacheError::InvalidPixmap("rowstride shorter than a row"));
    }
    // The last row does not have to carry padding.
    let needed = rowstride
        .checked_mul(height - 1)
        .and_then(|n| n.checked_add(row_len))
        .ok_or(ImageCacheError::InvalidPixmap("pixmap too large"))?;
    if pixmap.data.len() < needed {
        return Err(ImageCacheError::InvalidPixmap("pixel data is truncated"));
    }

    let mut packed = Vec::with_capacity(row_len * height);
    for row in pixmap.data.chunks(rowstride).take(height) {
        packed.extend_from_slice(&row[..row_len]);
    }

    let image = if pixmap.has_alpha {
        RgbaImage::from_raw(pixmap.width, pixmap.height, packed).map(DynamicImage::ImageRgba8)
    } else {
        RgbImage::from_raw(pixmap.width, pixmap.height, packed).map(DynamicImage::ImageRgb8)
    };
    image.ok_or(ImageCacheError::InvalidPixmap(
        "pixel data does not match dimensions",
    ))
}
