//! Archive building for completed searches.

use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

const ARCHIVE_EXTENSION: &str = "zip";
const PARTIAL_SUFFIX: &str = "partial";
const SHARD_DEPTH: usize = 3;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Invalid submission timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// `<prefix>_<YYYYmmdd_HHMMSS>.zip`, from the local submission time.
pub fn archive_name(prefix: &str, submitted_at: i64) -> Result<String, ArchiveError> {
    let submitted = DateTime::from_timestamp(submitted_at, 0)
        .ok_or(ArchiveError::InvalidTimestamp(submitted_at))?
        .with_timezone(&Local);
    let prefix: String = prefix.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(format!(
        "{}_{}.{}",
        prefix,
        submitted.format("%Y%m%d_%H%M%S"),
        ARCHIVE_EXTENSION
    ))
}

fn is_archive(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION)
}

/// Archives directly inside the job root.
pub fn find_archives(job_root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    if !job_root.is_dir() {
        return Ok(archives);
    }
    for entry in fs::read_dir(job_root)? {
        let path = entry?.path();
        if path.is_file() && is_archive(&path) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Result files of a job, skipping archives and unfinished archive files.
pub fn loose_files(job_root: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(job_root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let at_root = entry.depth() == 1;
        let partial = path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_SUFFIX);
        if at_root && (is_archive(path) || partial) {
            continue;
        }
        files.push(path.to_path_buf());
    }
    Ok(files)
}

/// Name of a file inside the archive: the shard directories are dropped so
/// entries read `<format>/<file>`. Falls back to the full relative path when
/// that name is already used.
fn entry_name(job_root: &Path, file: &Path, used: &HashSet<String>) -> String {
    let relative: Vec<String> = file
        .strip_prefix(job_root)
        .unwrap_or(file)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let short = if relative.len() > SHARD_DEPTH {
        relative[SHARD_DEPTH..].join("/")
    } else {
        relative.join("/")
    };
    if used.contains(&short) {
        relative.join("/")
    } else {
        short
    }
}

/// Writes all loose files of the job into `archive_path`. The archive is
/// built under a temporary name and renamed into place once complete.
/// Returns the number of entries.
pub fn build_archive(job_root: &Path, archive_path: &Path) -> Result<usize, ArchiveError> {
    let files = loose_files(job_root)?;
    let partial_path = archive_path.with_extension(format!("{}.{}", ARCHIVE_EXTENSION, PARTIAL_SUFFIX));

    let mut zip = ZipWriter::new(BufWriter::new(File::create(&partial_path)?));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    let mut used = HashSet::new();
    for file in &files {
        let name = entry_name(job_root, file, &used);
        zip.start_file(name.as_str(), options)?;
        io::copy(&mut File::open(file)?, &mut zip)?;
        used.insert(name);
    }
    zip.finish()?;

    fs::rename(&partial_path, archive_path)?;
    Ok(files.len())
}

/// Removes everything in the job root except archives.
pub fn remove_loose_files(job_root: &Path) -> io::Result<()> {
    for entry in fs::read_dir(job_root)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if !is_archive(&path) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
