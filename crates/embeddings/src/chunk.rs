use std::path::PathBuf;

use {
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

/// SHA-256 hex digest of `text`. Used for chunk hashes and batch custom IDs.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A unit of source text with a stable content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub hash: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl Chunk {
    pub fn new(text: impl Into<String>, start_line: usize, end_line: usize) -> Self {
        let text = text.into();
        let hash = hash_text(&text);
        Self {
            text,
            hash,
            start_line,
            end_line,
        }
    }
}

/// The indexed file a set of chunks came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the memory root.
    pub path: String,
    pub abs_path: PathBuf,
    pub mtime_ms: u64,
    pub size: u64,
    pub hash: String,
}

/// Where an indexed file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemorySource {
    Memory,
    Sessions,
}

impl MemorySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sessions => "sessions",
        }
    }
}
