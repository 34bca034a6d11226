//! Crash-safe file writes.
//!
//! Persisted gateway state (credentials, gateway config) is written with
//! the temp→fsync→rename pattern so a crash leaves either the old file or
//! the new one, never a torn write. Cross-process readers rely on the
//! rename being atomic.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// Write `content` atomically. `secure` narrows permissions to 0o600 for
/// credential-bearing files.
pub fn write_atomic(path: &Path, content: &[u8], secure: bool) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;

    // The temp file must live in the same directory for rename to be atomic.
    let temp_path = path.with_file_name(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    ));

    {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(if secure { 0o600 } else { 0o644 });

        let mut file = opts.open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;

    #[cfg(unix)]
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}
