//! Terminal output helpers.

use std::io::Write;
use std::path::Path;

use a3s_relay_runtime::BackupObserver;

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Prints backup progress, one line per milestone.
pub struct BackupPrinter<W: Write + Send> {
    out: parking_lot::Mutex<W>,
}

impl<W: Write + Send> BackupPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: parking_lot::Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn line(&self, text: String) {
        // A closed pipe must not fail the backup.
        let _ = writeln!(self.out.lock(), "{}", text);
    }
}

impl<W: Write + Send> BackupObserver for BackupPrinter<W> {
    fn on_tags_found(&self, repository: &str, tags: &[String]) {
        self.line(format!(
            "Found {} tag(s) in {}: {}",
            tags.len(),
            repository,
            tags.join(", ")
        ));
    }

    fn on_artifact_pulled(&self, tag: &str, referrers: usize) {
        if referrers > 0 {
            self.line(format!("Pulled tag {} with {} referrer(s)", tag, referrers));
        } else {
            self.line(format!("Pulled tag {}", tag));
        }
    }

    fn on_tar_exporting(&self, path: &Path) {
        self.line(format!("Exporting to {}", path.display()));
    }

    fn on_tar_exported(&self, path: &Path, size: u64) {
        self.line(format!("Exported to {} ({})", path.display(), format_bytes(size)));
    }

    fn on_backup_completed(&self, count: usize, output: &Path) {
        self.line(format!(
            "Successfully backed up {} artifact(s) to {}",
            count,
            output.display()
        ));
    }
}
