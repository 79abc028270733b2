//! Chunk file naming and versioning.
//!
//! Chunk files are named `{prefix}-{number:06}.{version:06}`. The scavenger
//! rewrites a chunk under the next version, so two versions of one chunk
//! number may coexist across a crash; the highest version is authoritative.
//! Scavenge output in progress is written under a `.tmp` name that the
//! versioned enumerators never match.

use crate::error::LogError;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Width of the zero-padded chunk number and version fields.
const FIELD_WIDTH: usize = 6;

/// Extension used for scratch files.
const TEMP_EXTENSION: &str = "tmp";

/// Maps chunk numbers and versions to file names within one directory.
#[derive(Debug, Clone)]
pub struct ChunkNaming {
    dir: PathBuf,
    prefix: String,
}

impl ChunkNaming {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Returns the directory this naming scheme operates in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path for a chunk number at a specific version.
    pub fn filename(&self, chunk_number: u32, version: u32) -> PathBuf {
        self.dir.join(format!(
            "{}-{:0width$}.{:0width$}",
            self.prefix,
            chunk_number,
            version,
            width = FIELD_WIDTH
        ))
    }

    /// Parses `(chunk_number, version)` out of a well-formed chunk file name.
    pub fn parse(&self, file_name: &str) -> Option<(u32, u32)> {
        let rest = file_name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let (number, version) = rest.split_once('.')?;
        if number.len() != FIELD_WIDTH || version.len() != FIELD_WIDTH {
            return None;
        }
        if !number.bytes().all(|b| b.is_ascii_digit())
            || !version.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some((number.parse().ok()?, version.parse().ok()?))
    }

    /// Returns existing versions of a chunk number, latest first.
    pub fn versions_for(&self, chunk_number: u32) -> Result<Vec<(u32, PathBuf)>, LogError> {
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((number, version)) = self.parse(&name.to_string_lossy()) {
                if number == chunk_number {
                    versions.push((version, entry.path()));
                }
            }
        }
        versions.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(versions)
    }

    /// Returns all chunk files present, sorted by chunk number then version.
    ///
    /// Files that do not match the exact naming pattern, including temp
    /// files, are ignored.
    pub fn present_files(&self) -> Result<Vec<PathBuf>, LogError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((number, version)) = self.parse(&name.to_string_lossy()) {
                files.push((number, version, entry.path()));
            }
        }
        files.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(files.into_iter().map(|(_, _, path)| path).collect())
    }

    /// Returns a fresh scratch file path for scavenge output.
    pub fn temp_filename(&self) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.{}",
            self.prefix,
            Uuid::new_v4(),
            TEMP_EXTENSION
        ))
    }

    /// Returns all scratch files present in the directory.
    pub fn temp_files(&self) -> Result<Vec<PathBuf>, LogError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_temp = path
                .extension()
                .map(|e| e == TEMP_EXTENSION)
                .unwrap_or(false);
            let is_ours = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(&self.prefix))
                .unwrap_or(false);
            if is_temp && is_ours {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
