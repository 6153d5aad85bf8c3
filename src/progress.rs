//! Progress reporting utilities using indicatif.
//!
//! The pipeline reports through the [`ProgressCallback`] trait; [`Progress`]
//! renders it as a spinner while indexing and as bars while comparing and
//! de-duping. Progress output is informational only.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Phase name used while walking the tree.
pub const PHASE_INDEXING: &str = "indexing";
/// Phase name used by the size comparator.
pub const PHASE_COMPARING: &str = "comparing";
/// Phase name used by the dedup resolver.
pub const PHASE_DEDUPING: &str = "deduping";

/// Progress callback for pipeline phases.
pub trait ProgressCallback: Send + Sync {
    /// Called when a phase starts. `total` is 0 when unknown.
    fn on_phase_start(&self, phase: &str, total: u64);

    /// Called for each record processed.
    ///
    /// # Arguments
    ///
    /// * `current` - Records processed so far in this phase
    /// * `path` - Path being processed
    fn on_progress(&self, current: u64, path: &str);

    /// Called when a phase completes.
    fn on_phase_end(&self, phase: &str);

    /// Called to update the progress message.
    fn on_message(&self, _message: &str) {}
}

/// Progress reporter using indicatif.
pub struct Progress {
    multi: MultiProgress,
    active: Mutex<Option<ProgressBar>>,
    quiet: bool,
}

impl Progress {
    /// Create a new progress reporter.
    ///
    /// # Arguments
    ///
    /// * `quiet` - If true, no progress bars will be displayed.
    ///
    /// # Examples
    ///
    /// ```
    /// use dupesweep::progress::Progress;
    ///
    /// let progress = Progress::new(false);
    /// ```
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        let multi = if quiet {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self {
            multi,
            active: Mutex::new(None),
            quiet,
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed_precise}] {pos} files")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg} (ETA: {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█>-")
    }
}

impl ProgressCallback for Progress {
    fn on_phase_start(&self, phase: &str, total: u64) {
        if self.quiet {
            return;
        }

        let pb = if phase == PHASE_INDEXING {
            let pb = self.multi.add(ProgressBar::new_spinner());
            pb.set_style(Self::spinner_style());
            pb.set_message("Indexing files");
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            let pb = self.multi.add(ProgressBar::new(total));
            pb.set_style(Self::bar_style());
            pb.set_message(match phase {
                PHASE_COMPARING => "Comparing".to_string(),
                PHASE_DEDUPING => "De-duping".to_string(),
                other => other.to_string(),
            });
            pb
        };

        if let Some(previous) = self.active().replace(pb) {
            previous.finish_and_clear();
        }
    }

    fn on_progress(&self, current: u64, path: &str) {
        if self.quiet {
            return;
        }
        if let Some(ref pb) = *self.active() {
            pb.set_position(current);
            pb.set_message(truncate_path(path, 30));
        }
    }

    fn on_phase_end(&self, phase: &str) {
        if self.quiet {
            return;
        }
        if let Some(pb) = self.active().take() {
            let message = match phase {
                PHASE_INDEXING => "Indexing complete".to_string(),
                PHASE_COMPARING => "Comparing complete".to_string(),
                PHASE_DEDUPING => "De-duping complete".to_string(),
                other => format!("{other} complete"),
            };
            pb.finish_with_message(message);
        }
    }

    fn on_message(&self, message: &str) {
        if self.quiet {
            return;
        }
        if let Some(ref pb) = *self.active() {
            pb.set_message(message.to_string());
        }
    }
}

/// Truncate a path for display in the progress bar.
fn truncate_path(path: &str, max_len: usize) -> String {
    if path.chars().count() <= max_len {
        return path.to_string();
    }

    let file_name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let name_len = file_name.chars().count();
    if name_len + 4 > max_len {
        let tail: String = file_name
            .chars()
            .skip(name_len.saturating_sub(max_len.saturating_sub(3)))
            .collect();
        return format!("...{tail}");
    }

    format!(".../{file_name}")
}
