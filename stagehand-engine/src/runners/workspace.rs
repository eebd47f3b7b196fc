// Job Workspace
// Fresh temporary directory per job instance, seeded with the project and dependency artifacts

use crate::rules::glob::glob_match;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

/// Isolated working directory, removed when dropped
#[derive(Debug)]
pub struct JobWorkspace {
    dir: TempDir,
}

impl JobWorkspace {
    /// Create a workspace under `builds_dir`, or the system temp dir
    pub fn create(builds_dir: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("stagehand-job-");
        let dir = match builds_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy a source tree into the workspace, skipping `.git`
    pub fn seed_from(&self, source: &Path) -> io::Result<usize> {
        copy_tree(source, self.path())
    }

    /// Write dependency artifacts, keyed by workspace-relative path
    pub fn write_files(&self, files: &BTreeMap<String, Vec<u8>>) -> io::Result<()> {
        for (relative, contents) in files {
            let target = self.resolve(relative)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        Ok(())
    }

    /// Files matching any of `patterns`, as sorted workspace-relative paths
    ///
    /// A pattern naming a directory (`dist/` or `dist`) matches every file below it.
    pub fn collect(&self, patterns: &[String]) -> io::Result<Vec<String>> {
        Self::collect_in(self.path(), patterns)
    }

    /// `collect` for any directory, used by runners that only see the path
    pub fn collect_in(root: &Path, patterns: &[String]) -> io::Result<Vec<String>> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        list_files(root, root, &mut files)?;

        let mut matched: Vec<String> = files
            .into_iter()
            .filter(|file| patterns.iter().any(|pattern| path_matches(pattern, file)))
            .collect();
        matched.sort();
        Ok(matched)
    }

    /// Read collected files back
    pub fn read_files(&self, paths: &[String]) -> io::Result<BTreeMap<String, Vec<u8>>> {
        paths
            .iter()
            .map(|relative| Ok((relative.clone(), fs::read(self.resolve(relative)?)?)))
            .collect()
    }

    /// Join a relative path, refusing anything that escapes the workspace
    fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        let path = Path::new(relative);
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path '{}' is outside the workspace", relative),
            ));
        }
        Ok(self.path().join(path))
    }
}

fn path_matches(pattern: &str, file: &str) -> bool {
    let pattern = pattern.trim_start_matches("./");
    let dir_pattern = pattern.trim_end_matches('/');
    if glob_match(pattern, file) {
        return true;
    }
    // Any ancestor directory matching the pattern selects the file
    file.match_indices('/')
        .any(|(index, _)| glob_match(dir_pattern, &file[..index]))
}

fn list_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            list_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(parts.join("/"));
            }
        }
    }
    Ok(())
}

/// Recursively copy `source` into `target`, returning the number of files copied
pub fn copy_tree(source: &Path, target: &Path) -> io::Result<usize> {
    let mut copied = 0;
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let destination = target.join(entry.file_name());
        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            copied += copy_tree(&entry.path(), &destination)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &destination)?;
            copied += 1;
        }
    }
    Ok(copied)
}
