//! File-sharding allocator.
//!
//! Result files live under `job_root/d1/d2/d3/<format>/`. The allocator keeps
//! each leaf below `max_files_per_dir` files and each of the two inner levels
//! below `max_sub_dirs_per_dir` children. The top level is only grown when
//! both inner levels are full.
//!
//! Capacity is read from directory listings at allocation time, so it is
//! advisory: a concurrent writer can still push a directory over the limit.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

const SHARD_DEPTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAllocator {
    pub max_files_per_dir: usize,
    pub max_sub_dirs_per_dir: usize,
}

impl ShardAllocator {
    pub fn new(max_files_per_dir: usize, max_sub_dirs_per_dir: usize) -> Self {
        Self {
            max_files_per_dir,
            max_sub_dirs_per_dir,
        }
    }

    /// Directory the next result of the job should be written to.
    ///
    /// `current_dir` is the directory the previous result went to, or the job
    /// root itself before anything was written.
    pub fn next_path(&self, job_root: &Path, current_dir: &Path) -> io::Result<PathBuf> {
        let current = if is_leaf_of(job_root, current_dir) {
            current_dir.to_path_buf()
        } else {
            job_root.join("1").join("1").join("1")
        };
        fs::create_dir_all(&current)?;

        if first_format_dir_len(&current)? < self.max_files_per_dir {
            return Ok(current);
        }

        // is_leaf_of guarantees both ancestors exist below the job root
        let parent = current.parent().unwrap_or(job_root);
        let siblings = count_sub_dirs(parent)?;
        if siblings < self.max_sub_dirs_per_dir {
            return create(parent.join((siblings + 1).to_string()));
        }

        let grandparent = parent.parent().unwrap_or(job_root);
        let uncles = count_sub_dirs(grandparent)?;
        if uncles < self.max_sub_dirs_per_dir {
            return create(grandparent.join((uncles + 1).to_string()).join("1"));
        }

        let branches = count_sub_dirs(job_root)?;
        create(
            job_root
                .join((branches + 1).to_string())
                .join("1")
                .join("1"),
        )
    }
}

fn create(path: PathBuf) -> io::Result<PathBuf> {
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// True when `dir` is exactly three plain components below `root`.
fn is_leaf_of(root: &Path, dir: &Path) -> bool {
    match dir.strip_prefix(root) {
        Ok(relative) => {
            let components: Vec<_> = relative.components().collect();
            components.len() == SHARD_DEPTH
                && components.iter().all(|c| matches!(c, Component::Normal(_)))
        }
        Err(_) => false,
    }
}

fn count_sub_dirs(dir: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        if entry?.file_type()?.is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

/// Number of entries in the first (by name) format directory of a leaf.
fn first_format_dir_len(leaf: &Path) -> io::Result<usize> {
    let mut format_dirs = Vec::new();
    for entry in fs::read_dir(leaf)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            format_dirs.push(entry.path());
        }
    }
    format_dirs.sort();
    match format_dirs.first() {
        Some(dir) => Ok(fs::read_dir(dir)?.count()),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Writes `count` files, one per allocation, into the `HTML` format dir.
    fn write_files(allocator: &ShardAllocator, root: &Path, count: usize) -> Vec<PathBuf> {
        let mut current = root.to_path_buf();
        let mut leaves = Vec::new();
        for i in 0..count {
            current = allocator.next_path(root, &current).unwrap();
            let format_dir = current.join("HTML");
            fs::create_dir_all(&format_dir).unwrap();
            fs::write(format_dir.join(format!("{}.html", i)), "x").unwrap();
            leaves.push(current.clone());
        }
        leaves
    }

    fn relative(root: &Path, path: &Path) -> String {
        path.strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .replace('\\', "/")
    }

    #[test]
    fn test_first_allocation_is_1_1_1() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(10, 10);

        let path = allocator.next_path(temp.path(), temp.path()).unwrap();
        assert_eq!(relative(temp.path(), &path), "1/1/1");
        assert!(path.is_dir());
    }

    #[test]
    fn test_reuses_until_full_then_adds_sibling() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(3, 10);

        let leaves = write_files(&allocator, temp.path(), 4);
        let names: Vec<String> = leaves.iter().map(|l| relative(temp.path(), l)).collect();
        assert_eq!(names, vec!["1/1/1", "1/1/1", "1/1/1", "1/1/2"]);
    }

    #[test]
    fn test_climbs_levels_when_full() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(1, 2);

        let leaves = write_files(&allocator, temp.path(), 6);
        let names: Vec<String> = leaves.iter().map(|l| relative(temp.path(), l)).collect();
        assert_eq!(
            names,
            vec!["1/1/1", "1/1/2", "1/2/1", "1/2/2", "2/1/1", "2/1/2"]
        );
    }

    #[test]
    fn test_leaf_never_exceeds_max_files() {
        let temp = TempDir::new().unwrap();
        let max_files = 5;
        let allocator = ShardAllocator::new(max_files, 3);

        let leaves = write_files(&allocator, temp.path(), max_files + 1);
        for leaf in leaves.iter().collect::<HashSet<_>>() {
            let count = fs::read_dir(leaf.join("HTML")).unwrap().count();
            assert!(count <= max_files, "{:?} holds {} files", leaf, count);
        }
        assert_eq!(leaves.iter().collect::<HashSet<_>>().len(), 2);
    }

    #[test]
    fn test_inner_levels_never_exceed_fan_out() {
        let temp = TempDir::new().unwrap();
        let max_sub_dirs = 3;
        let allocator = ShardAllocator::new(1, max_sub_dirs);

        // one more leaf than a full second level can hold
        write_files(&allocator, temp.path(), max_sub_dirs * max_sub_dirs + 1);

        for d1 in fs::read_dir(temp.path()).unwrap() {
            let d1 = d1.unwrap().path();
            assert!(count_sub_dirs(&d1).unwrap() <= max_sub_dirs);
            for d2 in fs::read_dir(&d1).unwrap() {
                let d2 = d2.unwrap().path();
                assert!(count_sub_dirs(&d2).unwrap() <= max_sub_dirs);
            }
        }
        assert_eq!(count_sub_dirs(temp.path()).unwrap(), 2);
    }

    #[test]
    fn test_resumes_from_saved_leaf() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(2, 2);
        let leaf = temp.path().join("1").join("2").join("1");

        let path = allocator.next_path(temp.path(), &leaf).unwrap();
        assert_eq!(path, leaf);
        assert!(leaf.is_dir());
    }

    #[test]
    fn test_unexpected_current_dir_restarts_at_first_leaf() {
        let temp = TempDir::new().unwrap();
        let allocator = ShardAllocator::new(2, 2);

        let path = allocator
            .next_path(temp.path(), &temp.path().join("1"))
            .unwrap();
        assert_eq!(relative(temp.path(), &path), "1/1/1");
    }
}
