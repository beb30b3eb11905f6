//! Shared memory transport for task payloads and results.
//!
//! Payloads can be arbitrarily large, so they never travel through the worker pipes. The sender
//! encodes them into a file on a memory-backed file system and only sends a [`ShmPointer`] naming
//! it. The receiver maps the file, decodes it, and unlinks it.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use bincode::Options;
use memmap2::{MmapMut, MmapOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::caching::TaskError;
use crate::utils::defer::defer;

/// Names a shared memory segment holding an encoded value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmPointer {
    pub name: String,
    pub size: u64,
}

/// Writes and reads shared memory segments in one directory.
#[derive(Clone, Debug)]
pub struct SharedMemory {
    dir: PathBuf,
    max_size: u64,
}

impl SharedMemory {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            dir: dir.into(),
            max_size,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.max_size)
    }

    fn path(&self, pointer: &ShmPointer) -> Result<PathBuf, TaskError> {
        let valid = pointer.name.starts_with("dara-")
            && !pointer.name.contains(std::path::is_separator);
        if !valid {
            return Err(TaskError::Pickling(format!(
                "invalid shared memory segment `{}`",
                pointer.name
            )));
        }
        Ok(self.dir.join(&pointer.name))
    }

    /// Encodes `value` into a new segment.
    ///
    /// Fails with [`TaskError::Pickling`] if the value cannot be encoded or exceeds the size
    /// limit. No segment is left behind on failure.
    pub fn write<T: Serialize>(&self, value: &T) -> Result<ShmPointer, TaskError> {
        let size = self
            .options()
            .serialized_size(value)
            .map_err(TaskError::pickling)?;

        let pointer = ShmPointer {
            name: format!("dara-{}", Uuid::new_v4().simple()),
            size,
        };
        let path = self.dir.join(&pointer.name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(TaskError::pickling)?;
        let cleanup = defer(|| {
            let _ = fs::remove_file(&path);
        });

        file.set_len(size).map_err(TaskError::pickling)?;
        if size > 0 {
            // SAFETY: the file was just created with a unique name, nobody else maps it until
            // the pointer is handed out.
            let mut mmap: MmapMut = unsafe { MmapOptions::new().map_mut(&file) }
                .map_err(TaskError::pickling)?;
            self.options()
                .serialize_into(&mut mmap[..], value)
                .map_err(TaskError::pickling)?;
            mmap.flush().map_err(TaskError::pickling)?;
        }

        cleanup.disarm();
        tracing::trace!(segment = %pointer.name, size, "wrote shared memory segment");
        Ok(pointer)
    }

    /// Decodes the segment and removes it.
    ///
    /// The segment is removed even if decoding fails.
    pub fn read<T: DeserializeOwned>(&self, pointer: &ShmPointer) -> Result<T, TaskError> {
        if pointer.size > self.max_size {
            self.release(pointer);
            return Err(TaskError::Pickling(format!(
                "payload of {} bytes exceeds the limit of {} bytes",
                pointer.size, self.max_size
            )));
        }

        let path = self.path(pointer)?;
        let _cleanup = defer(|| {
            let _ = fs::remove_file(&path);
        });

        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(TaskError::pickling)?;
        let actual = file.metadata().map_err(TaskError::pickling)?.len();
        if actual != pointer.size {
            return Err(TaskError::Pickling(format!(
                "shared memory segment has {actual} bytes, expected {}",
                pointer.size
            )));
        }

        if pointer.size == 0 {
            return self.options().deserialize(&[]).map_err(TaskError::pickling);
        }

        // SAFETY: the writer is done with the segment once the pointer was sent, and the file is
        // unlinked right after decoding.
        let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(TaskError::pickling)?;
        self.options()
            .deserialize(&mmap[..])
            .map_err(TaskError::pickling)
    }

    /// Removes a segment without reading it.
    pub fn release(&self, pointer: &ShmPointer) {
        let Ok(path) = self.path(pointer) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => tracing::trace!(segment = %pointer.name, "released shared memory segment"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                error = &err as &dyn std::error::Error,
                segment = %pointer.name,
                "failed to release shared memory segment"
            ),
        }
    }
}
