// rust/cleaner-core/src/storage/archive.rs

//! Archive files standing in for run directories.
//!
//! A run may be stored as a single tarball (optionally gzip or zstd
//! compressed) whose members live under one implicit root directory, e.g.
//! `run/step0/...`. The immediate children of that root are treated as the
//! entries of the run.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use crate::error::{CleanerError, Result};

/// Supported archive extensions, matched case-insensitively.
pub const ARCHIVE_EXTENSIONS: &[&str] = &[".tar", ".tar.gz", ".tgz", ".tar.zst", ".tzst"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Gzip,
    Zstd,
}

fn compression_for(path: &str) -> Option<Compression> {
    let lower = path.to_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(Compression::Gzip)
    } else if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
        Some(Compression::Zstd)
    } else if lower.ends_with(".tar") {
        Some(Compression::None)
    } else {
        None
    }
}

/// Returns whether the path ends in a supported archive extension.
pub fn has_supported_archive_extension(path: &str) -> bool {
    compression_for(path).is_some()
}

/// Strips a supported archive extension from a file name, if present.
pub fn strip_archive_extension(name: &str) -> &str {
    let lower = name.to_lowercase();
    ARCHIVE_EXTENSIONS
        .iter()
        .filter(|ext| lower.ends_with(*ext))
        .map(|ext| &name[..name.len() - ext.len()])
        .min_by_key(|stem| stem.len())
        .unwrap_or(name)
}

fn open_archive(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let compression = compression_for(&path.to_string_lossy())
        .ok_or_else(|| CleanerError::storage(path, "not a supported archive file"))?;

    let file = File::open(path)
        .map_err(|e| CleanerError::storage_with_source(path, "failed to open archive", e))?;
    let reader = BufReader::new(file);

    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(reader),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(reader).map_err(
            |e| CleanerError::storage_with_source(path, "failed to open zstd stream", e),
        )?),
    };

    Ok(tar::Archive::new(reader))
}

/// Normalizes a member path into its components, dropping `.` and
/// resolving `..`.
fn normalize(member: &Path) -> Vec<String> {
    let mut components = Vec::new();
    for component in member.components() {
        match component {
            Component::Normal(part) => components.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    components
}

/// Lists the immediate children of the archive's implicit root.
///
/// Only members whose normalized path has exactly one separator are
/// reported. With `dirs_only`, a member counts as a directory when its
/// header says so or when other members live beneath it.
pub fn list_top_level_entries(archive_path: &Path, dirs_only: bool) -> Result<Vec<String>> {
    let mut archive = open_archive(archive_path)?;

    let mut entries = BTreeSet::new();
    let mut dirs = BTreeSet::new();
    let mut parents = BTreeSet::new();

    let members = archive.entries().map_err(|e| {
        CleanerError::storage_with_source(archive_path, "failed to read archive", e)
    })?;
    for member in members {
        let member = member.map_err(|e| {
            CleanerError::storage_with_source(archive_path, "failed to read archive member", e)
        })?;
        let member_path = member.path().map_err(|e| {
            CleanerError::storage_with_source(archive_path, "invalid archive member path", e)
        })?;
        let components = normalize(&member_path);

        match components.len() {
            2 => {
                if member.header().entry_type().is_dir() {
                    dirs.insert(components[1].clone());
                }
                entries.insert(components[1].clone());
            }
            n if n > 2 => {
                parents.insert(components[1].clone());
            }
            _ => {}
        }
    }

    if !dirs_only {
        return Ok(entries.into_iter().collect());
    }

    Ok(entries
        .into_iter()
        .filter(|entry| dirs.contains(entry) || parents.contains(entry))
        .collect())
}

/// Unpacks the archive into `dest` and returns its implicit root: the single
/// top-level directory when every member shares one, `dest` otherwise.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<PathBuf> {
    let mut archive = open_archive(archive_path)?;
    archive.unpack(dest).map_err(|e| {
        CleanerError::storage_with_source(archive_path, "failed to unpack archive", e)
    })?;

    let top_level: Vec<PathBuf> = fs::read_dir(dest)
        .map_err(|e| CleanerError::storage_with_source(dest, "failed to read unpacked archive", e))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();

    match top_level.as_slice() {
        [only] if only.is_dir() => Ok(only.clone()),
        _ => Ok(dest.to_path_buf()),
    }
}
