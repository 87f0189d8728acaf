//! Base virtual-machine disk images and their validity fingerprint.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fingerprint of a disk image. Two images are the same image iff their
/// `ImageInfo`s are equal; no content hashing is involved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageInfo {
    pub file_name: String,
    pub last_write_time: DateTime<Utc>,
}

impl ImageInfo {
    pub fn new(file_name: impl Into<String>, last_write_time: DateTime<Utc>) -> Self {
        Self {
            file_name: file_name.into(),
            last_write_time,
        }
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_name, self.last_write_time.to_rfc3339())
    }
}

/// A disk image snapshot in transit: its fingerprint plus the `.tar.gz`
/// archive of the image directory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OSImage {
    pub info: ImageInfo,
    pub data: Vec<u8>,
}

impl fmt::Debug for OSImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OSImage")
            .field("info", &self.info)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn equality_is_name_and_mtime() {
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(ImageInfo::new("vm.img", t1), ImageInfo::new("vm.img", t1));
        assert_ne!(ImageInfo::new("vm.img", t1), ImageInfo::new("vm.img", t2));
        assert_ne!(ImageInfo::new("vm.img", t1), ImageInfo::new("other.img", t1));
    }
}
