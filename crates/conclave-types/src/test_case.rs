//! Concrete inputs for one target execution.
//!
//! Besides the serde representation used on the wire, a test case has a flat
//! file format shared with the external worker processes (the VM reads it
//! from its hostfile directory, the symbolic engine writes one per generated
//! input):
//!
//! ```text
//! "CTST" | u32 count | count × ( u32 name_len | name | u32 data_len | data )
//! ```
//!
//! All integers are big-endian.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};

/// File magic for the on-disk test case format.
pub const TEST_CASE_MAGIC: &[u8; 4] = b"CTST";

/// One named input value: an argument, a file's contents, or stdin bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseElement {
    pub name: String,
    pub data: Vec<u8>,
}

impl TestCaseElement {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self { name: name.into(), data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// A named set of concrete input values fed to one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub elements: Vec<TestCaseElement>,
}

impl TestCase {
    pub fn new(elements: Vec<TestCaseElement>) -> Self {
        Self { elements }
    }

    /// Look up an element by name.
    pub fn element(&self, name: &str) -> Option<&TestCaseElement> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Approximate payload size in bytes, used for bandwidth accounting.
    pub fn size(&self) -> usize {
        self.elements
            .iter()
            .map(|e| e.name.len() + e.data.len())
            .sum()
    }

    // ── File format ──────────────────────────────────────────────────────

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.size() + self.elements.len() * 8);
        out.extend_from_slice(TEST_CASE_MAGIC);
        out.extend_from_slice(&(self.elements.len() as u32).to_be_bytes());
        for e in &self.elements {
            out.extend_from_slice(&(e.name.len() as u32).to_be_bytes());
            out.extend_from_slice(e.name.as_bytes());
            out.extend_from_slice(&(e.data.len() as u32).to_be_bytes());
            out.extend_from_slice(&e.data);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Reader { buf: bytes, pos: 0 };

        let magic = cursor.take(4)?;
        if magic != TEST_CASE_MAGIC {
            return Err(TypesError::MalformedTestCase("bad magic".into()));
        }

        let count = cursor.read_u32()? as usize;
        let mut elements = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let name_len = cursor.read_u32()? as usize;
            let name = std::str::from_utf8(cursor.take(name_len)?)
                .map_err(|e| TypesError::MalformedTestCase(format!("element name: {e}")))?
                .to_string();
            let data_len = cursor.read_u32()? as usize;
            let data = cursor.take(data_len)?.to_vec();
            elements.push(TestCaseElement { name, data });
        }

        if cursor.pos != bytes.len() {
            return Err(TypesError::MalformedTestCase(format!(
                "{} trailing bytes",
                bytes.len() - cursor.pos
            )));
        }

        Ok(Self { elements })
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                TypesError::MalformedTestCase(format!(
                    "truncated at offset {} (wanted {n} bytes)",
                    self.pos
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TestCase {
        TestCase::new(vec![
            TestCaseElement::new("argv_1", b"--verbose".to_vec()),
            TestCaseElement::new("stdin", vec![0u8; 16]),
        ])
    }

    #[test]
    fn file_format_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[..4], b"CTST");
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 2);
        assert_eq!(TestCase::from_bytes(&bytes).unwrap(), sample());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        let err = TestCase::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = sample().to_bytes();
        let err = TestCase::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, TypesError::MalformedTestCase(_)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(TestCase::from_bytes(&bytes).is_err());
    }

    #[test]
    fn element_lookup_and_size() {
        let tc = sample();
        assert_eq!(tc.element("stdin").map(|e| e.size()), Some(16));
        assert!(tc.element("argv_9").is_none());
        assert_eq!(tc.size(), "argv_1".len() + 9 + "stdin".len() + 16);
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case.test");
        sample().write_to_file(&path).unwrap();
        assert_eq!(TestCase::read_from_file(&path).unwrap(), sample());
    }
}
