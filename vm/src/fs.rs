use crate::sync::SpinLock;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// An open file, reference-counted by the filesystem layer underneath.
///
/// Closing a handle is dropping it. `reopen` yields an independent handle to
/// the same underlying file, so two mappings of one file never share seek or
/// lifetime state.
pub trait File {
    fn reopen(&self) -> Box<dyn File>;
    /// Read into `buf` at `offset`, returning the number of bytes read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;
    /// Write `buf` at `offset`, returning the number of bytes written.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> usize;
    /// Current length of the file in bytes.
    fn len(&self) -> u64;
}

// The storage layer underneath is not reentrant, so every access to a file
// handle goes through this one lock. Only the leaf helpers below acquire it,
// which keeps it impossible to re-acquire on a single path.
static FILESYS_LOCK: SpinLock<()> = SpinLock::new(());

pub fn read_at(file: &dyn File, buf: &mut [u8], offset: u64) -> usize {
    let _guard = FILESYS_LOCK.lock();
    file.read_at(buf, offset)
}

pub fn write_at(file: &mut dyn File, buf: &[u8], offset: u64) -> usize {
    let _guard = FILESYS_LOCK.lock();
    file.write_at(buf, offset)
}

pub fn length(file: &dyn File) -> u64 {
    let _guard = FILESYS_LOCK.lock();
    file.len()
}

pub fn reopen(file: &dyn File) -> Box<dyn File> {
    let _guard = FILESYS_LOCK.lock();
    file.reopen()
}

/// In-memory file for the host test harness.
///
/// All handles produced by [`File::reopen`] view the same byte vector, the
/// way reopened handles of one inode share its data. The write counter is
/// shared too, so tests can assert on write-back traffic.
#[derive(Clone)]
pub struct MemFile {
    data: Arc<SpinLock<Vec<u8>>>,
    write_count: Arc<AtomicUsize>,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Self {
        MemFile {
            data: Arc::new(SpinLock::new(contents.to_vec())),
            write_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of `write_at` calls across every handle to this file.
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl File for MemFile {
    fn reopen(&self) -> Box<dyn File> {
        Box::new(self.clone())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        buf.len()
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_write_at_offset() {
        let mut file = MemFile::new(b"hello world");
        let mut buf = [0u8; 5];
        assert_eq!(file.read_at(&mut buf, 6), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(file.write_at(b"WORLD", 6), 5);
        assert_eq!(file.contents(), b"hello WORLD");
        assert_eq!(file.write_count(), 1);
    }

    #[test]
    fn read_past_end() {
        let file = MemFile::new(b"abc");
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(&mut buf, 1), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(file.read_at(&mut buf, 3), 0);
    }

    #[test]
    fn write_extends_file() {
        let mut file = MemFile::new(b"ab");
        file.write_at(b"xy", 4);
        assert_eq!(file.contents(), b"ab\0\0xy");
        assert_eq!(file.len(), 6);
    }

    #[test]
    fn reopened_handle_shares_bytes() {
        let file = MemFile::new(b"shared");
        let mut other = reopen(&file);
        other.write_at(b"SH", 0);
        assert_eq!(file.contents(), b"SHared");
        assert_eq!(file.write_count(), 1);
        assert_eq!(length(&file), 6);
    }
}
