//! Crash-durable reference counting
//!
//! Two independent integers per (namespace, object):
//! - a normal counter, one unit per logical acquirer (e.g. each attach)
//! - a binary counter clamped to {0,1}: is the object activated at all,
//!   irrespective of how many acquirers there are
//!
//! Persisted as one small plain-text file per object,
//! `<base>/<namespace>/<object>` containing `"<count> <binaryCount>\n"`;
//! the format is shared with other pool members and must not change.
//!
//! No operation here takes a lock; callers are responsible for serializing
//! compound read-modify-write sequences (typically under the SR-wide lock).
//! [`RefCounter::check_locked`] is the one exception, wrapping a read in a
//! per-object file lock for callers outside such a sequence.

use lvhd_common::{Result, StorageError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A (count, binaryCount) pair as stored on disk
pub type Counts = (u32, u32);

/// File-backed refcount store rooted at one base directory
pub struct RefCounter {
    base: PathBuf,
}

impl RefCounter {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Increment; `binary` selects which of the two counters.
    /// Returns the new counts.
    pub fn get(&self, namespace: &str, object: &str, binary: bool) -> Result<Counts> {
        let (mut count, mut bin) = self.check(namespace, object)?;
        if binary {
            // clamped to {0,1}
            bin = 1;
        } else {
            count = count.saturating_add(1);
        }
        self.write(namespace, object, count, bin)?;
        Ok((count, bin))
    }

    /// Decrement; decrementing a zero counter is clamped to 0 with a
    /// warning, never an error. Returns the new counts.
    pub fn put(&self, namespace: &str, object: &str, binary: bool) -> Result<Counts> {
        let (mut count, mut bin) = self.check(namespace, object)?;
        let counter = if binary { &mut bin } else { &mut count };
        if *counter == 0 {
            warn!(namespace, object, binary, "refcount put on zero counter");
        } else {
            *counter -= 1;
        }
        self.write(namespace, object, count, bin)?;
        Ok((count, bin))
    }

    /// Set both counters to absolute values
    pub fn set(&self, namespace: &str, object: &str, count: u32, binary_count: u32) -> Result<()> {
        if binary_count > 1 {
            return Err(StorageError::Refcount(format!(
                "binary count must be 0 or 1, got {binary_count}"
            )));
        }
        self.write(namespace, object, count, binary_count)
    }

    /// Read-only view; a missing file reads as (0, 0)
    pub fn check(&self, namespace: &str, object: &str) -> Result<Counts> {
        let path = self.object_path(namespace, object);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };
        parse_counts(&text).ok_or_else(|| {
            StorageError::Refcount(format!("corrupt refcount file {}", path.display()))
        })
    }

    /// `check` under a per-object file lock, for readers that are not
    /// already serialized by the SR lock
    pub fn check_locked(&self, namespace: &str, object: &str) -> Result<Counts> {
        let dir = self.namespace_path(namespace);
        fs::create_dir_all(&dir)?;
        let lock_file = fs::File::create(dir.join(format!(".lock-{}", sanitize(object))))?;
        lock_file.lock()?;
        let counts = self.check(namespace, object);
        lock_file.unlock()?;
        counts
    }

    /// Zero one object (removes its file)
    pub fn reset(&self, namespace: &str, object: &str) -> Result<()> {
        self.write(namespace, object, 0, 0)
    }

    /// Zero every object in a namespace
    pub fn reset_all(&self, namespace: &str) -> Result<()> {
        let dir = self.namespace_path(namespace);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Zero every namespace
    pub fn reset_everything(&self) -> Result<()> {
        match fs::remove_dir_all(&self.base) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.base.join(sanitize(namespace))
    }

    fn object_path(&self, namespace: &str, object: &str) -> PathBuf {
        self.namespace_path(namespace).join(sanitize(object))
    }

    fn write(&self, namespace: &str, object: &str, count: u32, bin: u32) -> Result<()> {
        let path = self.object_path(namespace, object);
        if count == 0 && bin == 0 {
            // dropping to zero removes the file, and the namespace dir once
            // its last object is gone
            match fs::remove_file(&path) {
                Ok(()) => {
                    let _ = fs::remove_dir(self.namespace_path(namespace));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        fs::create_dir_all(self.namespace_path(namespace))?;
        fs::write(&path, format!("{count} {bin}\n"))?;
        debug!(namespace, object, count, bin, "refcount updated");
        Ok(())
    }
}

fn parse_counts(text: &str) -> Option<Counts> {
    let mut fields = text.split_whitespace();
    let count = fields.next()?.parse().ok()?;
    let bin: u32 = fields.next()?.parse().ok()?;
    if bin > 1 {
        return None;
    }
    Some((count, bin))
}

/// Object and namespace names become file names; path separators and glob
/// characters are replaced before use
fn sanitize(name: &str) -> String {
    name.replace(['/', '\\', '*', '?', '[', ']'], "_")
}
