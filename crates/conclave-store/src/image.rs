//! Node-level disk image storage.
//!
//! The store remembers two fingerprints: the image it actually holds
//! (`stored`, persisted next to the archive) and the image the dispatcher
//! last announced (`expected`). A VM slot whose unpacked copy differs from
//! the target fingerprint must be refreshed before its VM is launched.

use std::fs;
use std::path::{Path, PathBuf};

use conclave_types::{ImageInfo, OSImage};
use tracing::info;

use crate::error::{Result, StoreError};

const ARCHIVE_FILE: &str = "image.tar.gz";
const INFO_FILE: &str = "image.json";

#[derive(Debug)]
pub struct ImageStore {
    dir: PathBuf,
    stored: Option<ImageInfo>,
    expected: Option<ImageInfo>,
}

impl ImageStore {
    /// Open (or create) an image store rooted at `dir`, picking up any image
    /// persisted by a previous run.
    pub fn open(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let stored = if dir.join(ARCHIVE_FILE).exists() {
            read_info(&dir.join(INFO_FILE))?
        } else {
            None
        };
        Ok(Self { dir, stored, expected: None })
    }

    pub fn stored_info(&self) -> Option<&ImageInfo> {
        self.stored.as_ref()
    }

    /// The image slots should be running: the announced one if any,
    /// otherwise whatever is stored.
    pub fn target_info(&self) -> Option<&ImageInfo> {
        self.expected.as_ref().or(self.stored.as_ref())
    }

    /// Record the dispatcher's current image fingerprint.
    pub fn set_expected(&mut self, info: ImageInfo) {
        if self.expected.as_ref() != Some(&info) {
            info!(image = %info, "dispatcher announced image");
        }
        self.expected = Some(info);
    }

    /// The dispatcher announced an image this store does not hold.
    pub fn is_outdated(&self) -> bool {
        match (&self.expected, &self.stored) {
            (Some(expected), Some(stored)) => expected != stored,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// The archive for the target image is on disk and can be unpacked.
    pub fn is_ready(&self) -> bool {
        self.stored.is_some() && !self.is_outdated()
    }

    /// Persist a pushed image. Running slots are not touched; they pick the
    /// new image up at their next image check.
    pub fn install(&mut self, image: OSImage) -> Result<()> {
        let staged = StagedImage::write(&self.dir, image)?;
        self.commit(staged)
    }

    /// Swap a staged archive in and record its fingerprint.
    pub fn commit(&mut self, staged: StagedImage) -> Result<()> {
        fs::rename(&staged.path, self.archive_path())?;
        write_info(&self.dir.join(INFO_FILE), &staged.info)?;

        info!(image = %staged.info, bytes = staged.bytes, "image installed");
        self.expected = Some(staged.info.clone());
        self.stored = Some(staged.info);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_path(&self) -> PathBuf {
        self.dir.join(ARCHIVE_FILE)
    }
}

// ── Staging ───────────────────────────────────────────────────────────────────

/// A pushed image archive written next to the store but not yet installed.
/// Writing needs no access to the store itself, so callers can stage a large
/// archive without holding whatever guards the [`ImageStore`].
#[derive(Debug)]
pub struct StagedImage {
    path: PathBuf,
    info: ImageInfo,
    bytes: usize,
}

impl StagedImage {
    pub fn write(dir: &Path, image: OSImage) -> Result<Self> {
        let path = dir.join(format!("{ARCHIVE_FILE}.tmp"));
        fs::write(&path, &image.data)?;
        Ok(Self {
            path,
            info: image.info,
            bytes: image.data.len(),
        })
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }
}

// ── Fingerprint files ─────────────────────────────────────────────────────────

/// Read a persisted fingerprint. A missing file means "no image".
pub fn read_info(path: &Path) -> Result<Option<ImageInfo>> {
    match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn write_info(path: &Path, info: &ImageInfo) -> Result<()> {
    let text =
        serde_json::to_string_pretty(info).map_err(|e| StoreError::Serialization(e.to_string()))?;
    fs::write(path, text)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
