//! Directory walker implementation using walkdir.
//!
//! # Overview
//!
//! The [`Walker`] traverses a directory tree depth-first on the calling
//! thread and yields one [`FileEntry`] per regular file. Children are sorted
//! by file name so two walks of an unchanged tree yield the same order.
//!
//! # Features
//!
//! - Optional symlink following (walkdir detects cycles); each physical
//!   file is yielded once, under the first path that reaches it
//! - Gitignore-style pattern matching via the `ignore` crate
//! - Size filtering (min/max) and empty-file skipping
//! - Hidden file filtering
//! - Exact-path exclusion for the tool's own artifacts
//! - Graceful shutdown via atomic flag
//!
//! Unreadable entries are yielded as [`ScanError`] values and the walk
//! continues with the next sibling.

use std::collections::HashSet;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use walkdir::{DirEntry, WalkDir};

use super::{FileEntry, ScanError, WalkerConfig};

/// Sequential directory walker.
#[derive(Debug)]
pub struct Walker {
    /// Root path to walk
    root: PathBuf,
    /// Walker configuration
    config: WalkerConfig,
    /// Optional shutdown flag for graceful termination
    shutdown_flag: Option<Arc<AtomicBool>>,
}

impl Walker {
    /// Create a new walker for the given path.
    #[must_use]
    pub fn new(path: &Path, config: WalkerConfig) -> Self {
        Self {
            root: path.to_path_buf(),
            config,
            shutdown_flag: None,
        }
    }

    /// Set the shutdown flag for graceful termination.
    ///
    /// Once the flag is `true` the iterator returned by [`Walker::walk`]
    /// ends at the next entry.
    #[must_use]
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown_flag = Some(flag);
        self
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::SeqCst))
    }

    /// Build gitignore matcher from config patterns and the root `.gitignore`.
    fn build_gitignore(&self) -> Option<Gitignore> {
        let mut builder = GitignoreBuilder::new(&self.root);

        let gitignore_path = self.root.join(".gitignore");
        if gitignore_path.exists() {
            if let Some(e) = builder.add(&gitignore_path) {
                log::warn!(
                    "Failed to load .gitignore from {}: {}",
                    gitignore_path.display(),
                    e
                );
            } else {
                log::debug!("Loaded .gitignore from {}", gitignore_path.display());
            }
        }

        for pattern in &self.config.ignore_patterns {
            if let Err(e) = builder.add_line(None, pattern) {
                log::warn!("Invalid ignore pattern '{}': {}", pattern, e);
            }
        }

        match builder.build() {
            Ok(gitignore) if gitignore.is_empty() => None,
            Ok(gitignore) => Some(gitignore),
            Err(e) => {
                log::warn!("Failed to build ignore patterns: {}", e);
                None
            }
        }
    }

    fn should_ignore(&self, path: &Path, is_dir: bool, gitignore: Option<&Gitignore>) -> bool {
        let Some(gi) = gitignore else {
            return false;
        };
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        gi.matched(relative, is_dir).is_ignore()
    }

    fn is_hidden(entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with('.'))
    }

    /// Whether the walk should descend into / look at this entry at all.
    fn keep_entry(&self, entry: &DirEntry, gitignore: Option<&Gitignore>) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if self.config.skip_hidden && Self::is_hidden(entry) {
            log::trace!("Skipping hidden entry: {}", entry.path().display());
            return false;
        }
        if self.should_ignore(entry.path(), entry.file_type().is_dir(), gitignore) {
            log::trace!("Ignoring: {}", entry.path().display());
            return false;
        }
        true
    }

    fn passes_size_filter(&self, size: u64) -> bool {
        if self.config.skip_empty && size == 0 {
            return false;
        }
        if self.config.min_size.is_some_and(|min| size < min) {
            return false;
        }
        if self.config.max_size.is_some_and(|max| size > max) {
            return false;
        }
        true
    }

    /// Walk the directory tree, yielding file entries.
    ///
    /// Errors are yielded as [`ScanError`] values rather than stopping
    /// iteration.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use dupesweep::scanner::{Walker, WalkerConfig};
    /// use std::path::Path;
    ///
    /// let walker = Walker::new(Path::new("."), WalkerConfig::default());
    /// let files: Vec<_> = walker.walk().filter_map(Result::ok).collect();
    /// println!("Found {} files", files.len());
    /// ```
    pub fn walk(&self) -> impl Iterator<Item = Result<FileEntry, ScanError>> + '_ {
        let gitignore = self.build_gitignore();
        let mut seen = HashSet::new();

        WalkDir::new(&self.root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| self.keep_entry(entry, gitignore.as_ref()))
            .take_while(move |_| {
                if self.is_shutdown_requested() {
                    log::debug!("Walker: Shutdown requested, stopping iteration");
                    return false;
                }
                true
            })
            .filter_map(move |entry_result| match entry_result {
                Ok(entry) => self.process_entry(&entry, &mut seen),
                Err(e) => Some(Err(self.handle_walk_error(e))),
            })
    }

    fn process_entry(
        &self,
        entry: &DirEntry,
        seen: &mut HashSet<FileIdentity>,
    ) -> Option<Result<FileEntry, ScanError>> {
        let file_type = entry.file_type();
        if file_type.is_dir() {
            return None;
        }
        if file_type.is_symlink() {
            // only reachable when links are not followed
            log::trace!("Skipping symlink: {}", entry.path().display());
            return None;
        }

        let path = entry.path();
        if self.config.exclude_paths.iter().any(|p| p == path) {
            log::debug!("Skipping excluded path: {}", path.display());
            return None;
        }

        let metadata: Metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => return Some(Err(self.handle_walk_error(e))),
        };
        if !metadata.is_file() {
            return None;
        }

        let size = metadata.len();
        if !self.passes_size_filter(size) {
            log::trace!(
                "Skipping file due to size filter ({}): {}",
                size,
                path.display()
            );
            return None;
        }

        // a followed link and its target are the same file
        if self.config.follow_symlinks && !seen.insert(FileIdentity::of(path, &metadata)) {
            log::debug!("Skipping second path to the same file: {}", path.display());
            return None;
        }

        Some(Ok(FileEntry::new(path.to_path_buf(), size)))
    }

    fn handle_walk_error(&self, error: walkdir::Error) -> ScanError {
        let path = error
            .path()
            .map_or_else(|| self.root.clone(), Path::to_path_buf);
        let err = match error.into_io_error() {
            Some(io_error) => ScanError::from_io(&path, io_error),
            None => ScanError::Io {
                path,
                source: io::Error::other("filesystem loop detected"),
            },
        };
        log::warn!("{err}");
        err
    }
}

/// Physical identity of a file, independent of the path that reached it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum FileIdentity {
    #[cfg(unix)]
    Inode { dev: u64, ino: u64 },
    #[cfg_attr(unix, allow(dead_code))]
    Canonical(PathBuf),
}

impl FileIdentity {
    /// `metadata` must come from following links, as `DirEntry::metadata`
    /// does when the walk follows them.
    #[cfg(unix)]
    fn of(_path: &Path, metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self::Inode {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(path: &Path, _metadata: &Metadata) -> Self {
        Self::Canonical(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
    }
}
