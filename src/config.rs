//! Application configuration management.
//!
//! Settings are layered with `figment`, lowest priority first:
//!
//! 1. built-in defaults
//! 2. a TOML file (`--config FILE`, else `<config dir>/config.toml`)
//! 3. `DUPESWEEP_*` environment variables
//! 4. command-line flags, applied with [`Config::merge_scan_args`]
//!
//! ```toml
//! index_path = "/var/tmp/photos.db"
//! output_path = "photos-duplicates.txt"
//! trash = true
//! ignore_patterns = ["*.tmp", "node_modules"]
//! ```

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cli::ScanArgs;
use crate::index::{DEFAULT_PAGE_SIZE, DEFAULT_WRITE_BATCH};
use crate::scanner::WalkerConfig;
use crate::store::DeleteMode;

/// Prefix of the environment variables read into [`Config`].
pub const ENV_PREFIX: &str = "DUPESWEEP_";

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("Failed to determine project directories")]
    NoConfigDir,
    #[error(transparent)]
    Extract(#[from] Box<figment::Error>),
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file holding the index.
    pub index_path: PathBuf,
    /// Report file, one duplicate path per line.
    pub output_path: PathBuf,
    /// Rows fetched per index page.
    pub page_size: usize,
    /// Index writes per transaction.
    pub write_batch: usize,
    /// Move duplicates to the system trash instead of deleting them.
    pub trash: bool,
    /// Skip hidden files and directories.
    pub skip_hidden: bool,
    /// Skip zero-length files.
    pub skip_empty: bool,
    /// Follow symbolic links during the walk.
    pub follow_symlinks: bool,
    /// Minimum file size to index.
    pub min_size: Option<u64>,
    /// Maximum file size to index.
    pub max_size: Option<u64>,
    /// Gitignore-style patterns to skip.
    pub ignore_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("index.db"),
            output_path: PathBuf::from("duplicates.txt"),
            page_size: DEFAULT_PAGE_SIZE,
            write_batch: DEFAULT_WRITE_BATCH,
            trash: false,
            skip_hidden: false,
            skip_empty: false,
            follow_symlinks: false,
            min_size: None,
            max_size: None,
            ignore_patterns: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `path`, or from the platform config file when `None`.
    ///
    /// Never fails; see [`Config::load_from_path`].
    #[must_use]
    pub fn load(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::load_from_path(path),
            None => match Self::default_config_path() {
                Ok(path) => Self::load_from_path(path),
                Err(e) => {
                    log::debug!("{}, using defaults and environment", e);
                    Self::extract(Self::figment(None)).unwrap_or_else(|e| {
                        log::debug!("Failed to load config, using defaults: {}", e);
                        Self::default()
                    })
                }
            },
        }
    }

    /// Load defaults, then the TOML file at `path` (if it exists), then the
    /// environment.
    ///
    /// A malformed file or variable is logged and the defaults are returned.
    #[must_use]
    pub fn load_from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::extract(Self::figment(Some(path))) {
            Ok(config) => {
                log::debug!("Configuration loaded (file: {})", path.display());
                config
            }
            Err(e) => {
                log::warn!(
                    "Ignoring invalid configuration from {}: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract().map_err(Box::new)?)
    }

    fn default_config_path() -> Result<PathBuf, ConfigError> {
        let project_dirs =
            ProjectDirs::from("com", "dupesweep", "dupesweep").ok_or(ConfigError::NoConfigDir)?;
        Ok(project_dirs.config_dir().join("config.toml"))
    }

    /// Apply the flags given on the `scan` command line.
    ///
    /// Boolean flags can only switch a setting on; ignore patterns are
    /// appended to the configured ones.
    pub fn merge_scan_args(&mut self, args: &ScanArgs) {
        if let Some(index) = &args.index {
            self.index_path = index.clone();
        }
        if let Some(output) = &args.output {
            self.output_path = output.clone();
        }
        if let Some(page_size) = args.page_size {
            self.page_size = page_size;
        }
        if args.min_size.is_some() {
            self.min_size = args.min_size;
        }
        if args.max_size.is_some() {
            self.max_size = args.max_size;
        }
        self.trash |= args.trash;
        self.skip_hidden |= args.skip_hidden;
        self.skip_empty |= args.skip_empty;
        self.follow_symlinks |= args.follow_symlinks;
        self.ignore_patterns
            .extend(args.ignore_patterns.iter().cloned());
    }

    /// Walker settings derived from this configuration.
    #[must_use]
    pub fn walker_config(&self) -> WalkerConfig {
        WalkerConfig {
            follow_symlinks: self.follow_symlinks,
            skip_hidden: self.skip_hidden,
            skip_empty: self.skip_empty,
            min_size: self.min_size,
            max_size: self.max_size,
            ignore_patterns: self.ignore_patterns.clone(),
            exclude_paths: Vec::new(),
        }
    }

    /// How duplicates are removed.
    #[must_use]
    pub fn delete_mode(&self) -> DeleteMode {
        if self.trash {
            DeleteMode::Trash
        } else {
            DeleteMode::Permanent
        }
    }
}
