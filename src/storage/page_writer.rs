//! Writes the documents of one result page into the job's shard tree.
//!
//! Every file written is remembered until the page is committed, so a page
//! whose progress could not be saved can be removed again and fetched anew.

use super::shard::ShardAllocator;
use crate::searches::OutputFormat;
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct PageWriter<'a> {
    allocator: &'a ShardAllocator,
    job_root: PathBuf,
    current_dir: PathBuf,
    written: Vec<PathBuf>,
}

impl<'a> PageWriter<'a> {
    /// `last_save_dir` is the shard the previous page ended in, relative to
    /// the job root.
    pub fn new(allocator: &'a ShardAllocator, job_root: &Path, last_save_dir: Option<&str>) -> Self {
        let current_dir = match last_save_dir {
            Some(dir) => job_root.join(dir),
            None => job_root.to_path_buf(),
        };
        Self {
            allocator,
            job_root: job_root.to_path_buf(),
            current_dir,
            written: Vec::new(),
        }
    }

    /// Writes every rendition of one document into a freshly allocated shard.
    pub fn write_document(
        &mut self,
        result_id: &str,
        renditions: &[(OutputFormat, String)],
    ) -> io::Result<()> {
        self.current_dir = self.allocator.next_path(&self.job_root, &self.current_dir)?;
        let stem = sanitize_stem(result_id);

        for (format, content) in renditions {
            let format_dir = self.current_dir.join(format.dir_name());
            fs::create_dir_all(&format_dir)?;
            let path = unique_path(&format_dir, &stem, format.extension());
            fs::write(&path, content)?;
            self.written.push(path);
        }
        Ok(())
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Shard the writer ended in, relative to the job root.
    pub fn last_save_dir(&self) -> Option<String> {
        self.current_dir
            .strip_prefix(&self.job_root)
            .ok()
            .filter(|relative| !relative.as_os_str().is_empty())
            .map(|relative| relative.to_string_lossy().into_owned())
    }

    /// Deletes every file written since the writer was created, then the
    /// directories that were left empty by it.
    pub fn rollback(&mut self) {
        let mut dirs = Vec::new();
        for path in self.written.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Rolled back {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to roll back {:?}: {}", path, e),
            }
            if let Some(dir) = path.parent() {
                dirs.extend(dirs_below(&self.job_root, dir));
            }
        }
        dirs.extend(dirs_below(&self.job_root, &self.current_dir));

        // deepest first, a parent can only be empty once its children are gone
        dirs.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        dirs.dedup();
        for dir in dirs {
            // fails on anything still holding files of earlier pages
            if fs::remove_dir(&dir).is_ok() {
                debug!("Removed empty directory {:?}", dir);
            }
        }
    }

    /// Forgets the written files once their progress has been saved.
    pub fn commit(mut self) -> usize {
        let count = self.written.len();
        self.written.clear();
        count
    }
}

/// `dir` and its ancestors up to, not including, the job root.
fn dirs_below(job_root: &Path, dir: &Path) -> Vec<PathBuf> {
    dir.ancestors()
        .take_while(|dir| *dir != job_root && dir.starts_with(job_root))
        .map(Path::to_path_buf)
        .collect()
}

fn sanitize_stem(result_id: &str) -> String {
    result_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

/// `<stem>.<ext>`, or `<stem>_<timestamp>.<ext>` when that name is taken.
fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let path = dir.join(format!("{}.{}", stem, extension));
    if !path.exists() {
        return path;
    }
    loop {
        let suffix = Local::now().format("%d%H%M%S%f");
        let candidate = dir.join(format!("{}_{}.{}", stem, suffix, extension));
        if !candidate.exists() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn renditions() -> Vec<(OutputFormat, String)> {
        vec![
            (OutputFormat::Html, "<p>hello</p>".to_string()),
            (OutputFormat::TxtOnly, "hello".to_string()),
        ]
    }

    #[test]
    fn test_writes_one_file_per_format() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(10, 10);
        let mut writer = PageWriter::new(&allocator, temp.path(), None);

        writer.write_document("doc-1", &renditions()).unwrap();

        let leaf = temp.path().join("1/1/1");
        assert_eq!(
            fs::read_to_string(leaf.join("HTML/doc-1.html")).unwrap(),
            "<p>hello</p>"
        );
        assert_eq!(fs::read_to_string(leaf.join("TXT_Only/doc-1.txt")).unwrap(), "hello");
        assert_eq!(writer.last_save_dir().as_deref(), Some("1/1/1"));
        assert_eq!(writer.commit(), 2);
    }

    #[test]
    fn test_collision_gets_timestamp_suffix() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(10, 10);
        let mut writer = PageWriter::new(&allocator, temp.path(), None);

        writer
            .write_document("dup", &[(OutputFormat::Txt, "first".to_string())])
            .unwrap();
        writer
            .write_document("dup", &[(OutputFormat::Txt, "second".to_string())])
            .unwrap();

        let written = writer.written().to_vec();
        assert_eq!(written.len(), 2);
        assert_ne!(written[0], written[1]);
        assert_eq!(fs::read_to_string(&written[0]).unwrap(), "first");
        assert_eq!(fs::read_to_string(&written[1]).unwrap(), "second");
        let name = written[1].file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("dup_") && name.ends_with(".txt"), "{}", name);
    }

    #[test]
    fn test_rollback_removes_page_files_only() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(10, 10);

        let mut previous = PageWriter::new(&allocator, temp.path(), None);
        previous.write_document("kept", &renditions()).unwrap();
        let last = previous.last_save_dir();
        previous.commit();

        let mut writer = PageWriter::new(&allocator, temp.path(), last.as_deref());
        writer.write_document("a", &renditions()).unwrap();
        writer.write_document("b", &renditions()).unwrap();
        let written = writer.written().to_vec();
        writer.rollback();

        assert!(written.iter().all(|p| !p.exists()));
        assert!(writer.written().is_empty());
        assert!(temp.path().join("1/1/1/HTML/kept.html").exists());
    }

    #[test]
    fn test_rollback_removes_emptied_shards() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(1, 10);

        let mut previous = PageWriter::new(&allocator, temp.path(), None);
        previous.write_document("kept", &renditions()).unwrap();
        let last = previous.last_save_dir();
        previous.commit();

        let mut writer = PageWriter::new(&allocator, temp.path(), last.as_deref());
        writer.write_document("a", &renditions()).unwrap();
        writer.write_document("b", &renditions()).unwrap();
        assert!(temp.path().join("1/1/3/HTML/b.html").exists());
        writer.rollback();

        assert!(!temp.path().join("1/1/2").exists());
        assert!(!temp.path().join("1/1/3").exists());
        assert!(temp.path().join("1/1/1/HTML/kept.html").exists());
        assert!(temp.path().join("1/1/1/TXT_Only/kept.txt").exists());
        assert!(temp.path().exists());
    }

    #[test]
    fn test_first_page_rollback_leaves_job_root() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(10, 10);
        let mut writer = PageWriter::new(&allocator, temp.path(), None);
        writer.write_document("a", &renditions()).unwrap();
        writer.rollback();

        assert!(!temp.path().join("1").exists());
        assert!(temp.path().is_dir());
    }

    #[test]
    fn test_result_id_cannot_escape_shard() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(10, 10);
        let mut writer = PageWriter::new(&allocator, temp.path(), None);

        writer
            .write_document("../../etc/passwd", &[(OutputFormat::Txt, "x".to_string())])
            .unwrap();
        assert!(writer.written()[0].starts_with(temp.path().join("1/1/1/TXT")));
    }
}
