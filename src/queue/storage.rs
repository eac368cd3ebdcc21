//! Byte storages backing serializing queues.

use std::io;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tempfile;

/// Growable byte region.
pub trait Storage: Send {
    /// Returns the number of allocated bytes.
    fn len(&self) -> usize;

    /// Grows the region to `len` bytes preserving its content.
    fn grow(&mut self, len: usize) -> io::Result<()>;

    fn bytes(&self) -> &[u8];

    fn bytes_mut(&mut self) -> &mut [u8];

    /// Releases the region. The storage is empty afterwards.
    fn release(&mut self) -> io::Result<()>;
}

/// Heap allocated storage.
#[derive(Default)]
pub struct HeapStorage {
    data: Vec<u8>,
}

impl HeapStorage {
    pub fn new() -> Self {
        HeapStorage { data: Vec::new() }
    }
}

impl Storage for HeapStorage {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn grow(&mut self, len: usize) -> io::Result<()> {
        if len > self.data.len() {
            self.data.resize(len, 0);
        }
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn release(&mut self) -> io::Result<()> {
        self.data = Vec::new();
        Ok(())
    }
}

/// Storage mapped onto a scratch file.
///
/// The file is created in the provided directory with a unique name and removed when the storage is released
/// or dropped. Growing the storage unmaps the current mapping, extends the file and maps it again, so there is
/// never more than one live mapping of the file.
pub struct MappedStorage {
    file: Option<tempfile::NamedTempFile>,
    map: Option<MmapMut>,
}

impl MappedStorage {
    /// Creates a new scratch file in the `dir` directory.
    pub fn new(dir: &Path) -> io::Result<Self> {
        let file = tempfile::Builder::new().prefix("funnelsort-").tempfile_in(dir)?;
        log::trace!("created scratch file {}", file.path().display());

        return Ok(MappedStorage {
            file: Some(file),
            map: None,
        });
    }

    /// Returns the scratch file path if the storage is not released yet.
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|file| file.path())
    }
}

fn map_file(file: &tempfile::NamedTempFile, len: usize) -> io::Result<MmapMut> {
    // SAFETY: the scratch file is private to its storage and nothing else resizes it while it is mapped.
    unsafe { MmapOptions::new().len(len).map_mut(file.as_file()) }
}

impl Storage for MappedStorage {
    fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |map| map.len())
    }

    fn grow(&mut self, len: usize) -> io::Result<()> {
        if len <= self.len() {
            return Ok(());
        }
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "scratch file already released"))?;

        let old_len = self.len();
        self.map = None;
        let grown = file.as_file().set_len(len as u64).and_then(|_| map_file(file, len));
        match grown {
            Ok(map) => {
                self.map = Some(map);
                Ok(())
            }
            Err(err) => {
                // the file keeps its content, map back what was mapped before
                if old_len > 0 {
                    self.map = map_file(file, old_len).ok();
                }
                Err(err)
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self.map.as_mut() {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    fn release(&mut self) -> io::Result<()> {
        self.map = None;
        if let Some(file) = self.file.take() {
            file.close()?;
        }
        Ok(())
    }
}
