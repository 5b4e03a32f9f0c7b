//! # Small OS helpers shared across the core.
//!
//! - [`atomic_write`] durable file replacement (write temp, fsync, rename).
//! - [`AtomicFile`] incremental variant for streamed payloads.
//! - [`boot_clock`] monotonic time elapsed since the kernel booted.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Writes `data` to `path` atomically: the bytes land in a same-directory
/// temporary file which is fsynced and renamed over the target.
///
/// Readers observe either the previous content or the new content, never a
/// partial write. File ownership and permissions are the caller's concern.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut aw = AtomicFile::create(path)?;
    aw.write_all(data)?;
    aw.commit()
}

/// Incremental atomic writer.
///
/// Bytes are streamed into a `.planvisor-new~` sibling of the target path;
/// [`AtomicFile::commit`] fsyncs and renames it into place. Dropping the
/// writer without committing removes the temporary file.
pub struct AtomicFile {
    target: PathBuf,
    tmp: PathBuf,
    file: Option<File>,
}

impl AtomicFile {
    /// Opens a new temporary sibling of `path` for writing.
    pub fn create(path: &Path) -> io::Result<AtomicFile> {
        let mut name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_os_string();
        name.push(".planvisor-new~");
        let tmp = path.with_file_name(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        Ok(AtomicFile {
            target: path.to_path_buf(),
            tmp,
            file: Some(file),
        })
    }

    /// Flushes, fsyncs, and renames the temporary file over the target.
    pub fn commit(mut self) -> io::Result<()> {
        let file = self.file.take().expect("atomic file already committed");
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp, &self.target)?;
        // Persist the rename itself.
        if let Some(dir) = self.target.parent() {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .as_mut()
            .expect("atomic file already committed")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .as_mut()
            .expect("atomic file already committed")
            .flush()
    }
}

impl Drop for AtomicFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Returns the time elapsed since the kernel booted.
///
/// This is not a replacement for `Instant`, which is already monotonic; it
/// is exclusively for cases where elapsed time since *boot* is required
/// (e.g. the power-on pairing controller deciding whether the process start
/// coincides with a host power-on).
///
/// Returns `None` when the clock cannot be read (non-Linux hosts, sandboxes
/// without /proc).
pub fn boot_clock() -> Option<Duration> {
    let mut buf = String::new();
    File::open("/proc/uptime")
        .and_then(|mut f| f.read_to_string(&mut buf))
        .ok()?;
    let secs: f64 = buf.split_whitespace().next()?.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
