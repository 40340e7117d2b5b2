//! # Location Store
//!
//! The location label lives in a small non-volatile image, laid out the way
//! an EEPROM emulation would be:
//!
//! ```text
//! offset 0        32                                   512
//!        ┌────────┬─────────────────────────────────────┐
//!        │location│ reserved                            │
//!        └────────┴─────────────────────────────────────┘
//! ```
//!
//! The slot holds at most 31 bytes of UTF-8 followed by a NUL. Longer
//! labels are truncated on a character boundary. A slot without a NUL or
//! with invalid UTF-8 (an erased or never-written image) reads as empty.
//!
//! Writes are committed immediately: the label is only ever changed from
//! the configuration portal and a power cut right after must not lose it.

use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Size of the non-volatile image.
pub const IMAGE_SIZE: usize = 512;

/// Offset and size of the location slot.
pub const LOCATION_OFFSET: usize = 0;
pub const LOCATION_SLOT: usize = 32;

/// Longest label that fits the slot with its terminator.
pub const MAX_LOCATION_LEN: usize = LOCATION_SLOT - 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage I/O: {0}")]
    Io(#[from] io::Error),

    /// Access past the end of the image
    #[error("range {offset}..{end} outside {size}-byte image")]
    OutOfRange {
        offset: usize,
        end: usize,
        size: usize,
    },
}

/// Byte-addressed non-volatile storage.
pub trait Storage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Stage `data` at `offset`. Not durable until [`Storage::commit`].
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;
}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), StoreError> {
    let end = offset.saturating_add(len);
    if end > size {
        return Err(StoreError::OutOfRange { offset, end, size });
    }
    Ok(())
}

/// In-memory image. Commits are counted, not persisted.
pub struct MemoryStorage {
    image: [u8; IMAGE_SIZE],
    commits: u32,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            image: [0; IMAGE_SIZE],
            commits: 0,
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commits(&self) -> u32 {
        self.commits
    }
}

impl Storage for MemoryStorage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_range(offset, buf.len(), IMAGE_SIZE)?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        check_range(offset, data.len(), IMAGE_SIZE)?;
        self.image[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.commits += 1;
        Ok(())
    }
}

/// Image backed by a file on disk. The whole image is rewritten on commit.
pub struct FileStorage {
    path: PathBuf,
    image: Vec<u8>,
}

impl FileStorage {
    /// Open `path`, creating a zeroed image if it does not exist. A file of
    /// the wrong size is padded or cut to the image size.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut image = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "creating storage image");
                let image = vec![0; IMAGE_SIZE];
                fs::write(&path, &image)?;
                image
            }
            Err(e) => return Err(e.into()),
        };
        if image.len() != IMAGE_SIZE {
            warn!(
                path = %path.display(),
                len = image.len(),
                "storage image has unexpected size, resizing"
            );
            image.resize(IMAGE_SIZE, 0);
        }
        Ok(Self { path, image })
    }
}

impl Storage for FileStorage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        check_range(offset, buf.len(), IMAGE_SIZE)?;
        buf.copy_from_slice(&self.image[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        check_range(offset, data.len(), IMAGE_SIZE)?;
        self.image[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &self.image)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "storage committed");
        Ok(())
    }
}

/// Longest prefix of `label` that fits `max` bytes without splitting a
/// character.
pub fn truncate_label(label: &str, max: usize) -> &str {
    if label.len() <= max {
        return label;
    }
    let mut end = max;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

/// Owner of the persisted location label.
pub struct ConfigStore {
    storage: Box<dyn Storage>,
    location: String,
}

impl ConfigStore {
    /// Load the label from `storage`.
    pub fn open(storage: Box<dyn Storage>) -> Result<Self, StoreError> {
        let mut slot = [0u8; LOCATION_SLOT];
        storage.read(LOCATION_OFFSET, &mut slot)?;
        let location = match slot.iter().position(|&b| b == 0) {
            Some(end) => match std::str::from_utf8(&slot[..end]) {
                Ok(text) => text.to_string(),
                Err(_) => {
                    warn!("stored location is not valid UTF-8, ignoring");
                    String::new()
                }
            },
            None => {
                debug!("location slot not initialized");
                String::new()
            }
        };
        info!(location = %location, "location loaded");
        Ok(Self { storage, location })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Store a new label, truncated to [`MAX_LOCATION_LEN`] bytes, and
    /// commit it. Control characters are dropped: a NUL would end the slot
    /// early. Returns the label as stored.
    pub fn set_location(&mut self, label: &str) -> Result<&str, StoreError> {
        let cleaned: String = label.chars().filter(|c| !c.is_control()).collect();
        let label = truncate_label(cleaned.trim(), MAX_LOCATION_LEN);
        let mut slot = [0u8; LOCATION_SLOT];
        slot[..label.len()].copy_from_slice(label.as_bytes());
        self.storage.write(LOCATION_OFFSET, &slot)?;
        self.storage.commit()?;
        self.location = label.to_string();
        info!(location = %self.location, "location updated");
        Ok(&self.location)
    }
}
