//! Page stores backing the X-tree.
//!
//! A [`PageFile`] hands out fixed-size pages keyed by integer id. The
//! persistent variant keeps the tree header in bytes `[0, page_size)` of a
//! file and page `p` at `(1 + p) * page_size`; the region behind the last
//! allocated page holds the supernodes written at commit. Every page access
//! is a single seek plus read or write; nothing is preloaded.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::header::TreeHeader;
use super::xtree_constants::HEADER_BYTES;
use super::xtree_types::{PageId, XTreeError, XTreeResult};

/// Storage for node pages.
///
/// Methods take `&self`; implementations synchronise internally.
pub trait PageFile: Send {
    fn page_size(&self) -> usize;

    /// Raw bytes of a page, `page_size` long.
    fn read_page(&self, page_id: PageId) -> XTreeResult<Vec<u8>>;

    /// Writes a page; shorter buffers are zero padded.
    fn write_page(&self, page_id: PageId, bytes: &[u8]) -> XTreeResult<()>;

    /// Id the next allocation will return.
    fn next_page_id(&self) -> PageId;

    fn set_next_page_id(&self, next: PageId);

    fn allocate_page(&self) -> PageId;

    /// `true` if the store survives the process and supports commit.
    fn is_persistent(&self) -> bool;

    fn read_header(&self) -> XTreeResult<TreeHeader>;

    fn write_header(&self, header: &TreeHeader) -> XTreeResult<()>;

    /// Reads `len` bytes at `offset` relative to the start of the page region.
    fn read_region(&self, offset: u64, len: usize) -> XTreeResult<Vec<u8>>;

    /// Writes raw bytes at `offset` relative to the start of the page region.
    fn write_region(&self, offset: u64, bytes: &[u8]) -> XTreeResult<()>;

    /// Cuts the page region off at `offset`.
    fn truncate_region(&self, offset: u64) -> XTreeResult<()>;

    /// Length of the page region in bytes.
    fn region_len(&self) -> XTreeResult<u64>;

    fn sync(&self) -> XTreeResult<()>;

    fn reads(&self) -> u64;

    fn writes(&self) -> u64;
}

#[derive(Default)]
struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
}

impl IoCounters {
    fn read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

fn padded(bytes: &[u8], page_size: usize) -> XTreeResult<Vec<u8>> {
    if bytes.len() > page_size {
        return Err(XTreeError::Serialization(format!(
            "page too large: {} bytes (max {})",
            bytes.len(),
            page_size
        )));
    }
    let mut page = bytes.to_vec();
    page.resize(page_size, 0);
    Ok(page)
}

// ============================================================================
// File-backed store
// ============================================================================

struct FileState {
    file: File,
    next_page_id: PageId,
}

/// Page store backed by a single file.
pub struct PersistentPageFile {
    state: Mutex<FileState>,
    path: PathBuf,
    page_size: usize,
    counters: IoCounters,
}

impl PersistentPageFile {
    /// Create a new, empty index file (truncating an existing one)
    pub fn create(path: &Path, page_size: usize) -> XTreeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            state: Mutex::new(FileState {
                file,
                next_page_id: 0,
            }),
            path: path.to_path_buf(),
            page_size,
            counters: IoCounters::default(),
        })
    }

    /// Open an existing index file.
    ///
    /// Only the header is read, to learn the page size.
    pub fn open(path: &Path) -> XTreeResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buffer = vec![0u8; HEADER_BYTES];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buffer).map_err(|e| {
            XTreeError::Corrupted(format!("cannot read tree header: {}", e))
        })?;
        let header = TreeHeader::decode(&buffer)?;
        header.validate()?;

        Ok(Self {
            state: Mutex::new(FileState {
                file,
                next_page_id: 0,
            }),
            path: path.to_path_buf(),
            page_size: header.page_size as usize,
            counters: IoCounters::default(),
        })
    }

    fn page_offset(&self, page_id: PageId) -> u64 {
        (1 + page_id as u64) * self.page_size as u64
    }
}

impl PageFile for PersistentPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> XTreeResult<Vec<u8>> {
        let mut state = self.state.lock();
        if page_id >= state.next_page_id {
            return Err(XTreeError::InvalidOperation(format!(
                "page {} of {} has not been allocated",
                page_id,
                self.path.display()
            )));
        }
        state.file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
        let mut buffer = vec![0u8; self.page_size];
        state.file.read_exact(&mut buffer)?;
        self.counters.read();
        Ok(buffer)
    }

    fn write_page(&self, page_id: PageId, bytes: &[u8]) -> XTreeResult<()> {
        let page = padded(bytes, self.page_size)?;
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(self.page_offset(page_id)))?;
        state.file.write_all(&page)?;
        if page_id >= state.next_page_id {
            state.next_page_id = page_id + 1;
        }
        self.counters.write();
        Ok(())
    }

    fn next_page_id(&self) -> PageId {
        self.state.lock().next_page_id
    }

    fn set_next_page_id(&self, next: PageId) {
        self.state.lock().next_page_id = next;
    }

    fn allocate_page(&self) -> PageId {
        let mut state = self.state.lock();
        let id = state.next_page_id;
        state.next_page_id += 1;
        id
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn read_header(&self) -> XTreeResult<TreeHeader> {
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(0))?;
        let mut buffer = vec![0u8; HEADER_BYTES];
        state.file.read_exact(&mut buffer)?;
        TreeHeader::decode(&buffer)
    }

    fn write_header(&self, header: &TreeHeader) -> XTreeResult<()> {
        let page = padded(&header.encode()?, self.page_size)?;
        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&page)?;
        Ok(())
    }

    fn read_region(&self, offset: u64, len: usize) -> XTreeResult<Vec<u8>> {
        let mut state = self.state.lock();
        state
            .file
            .seek(SeekFrom::Start(self.page_size as u64 + offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        self.counters.read();
        Ok(buffer)
    }

    fn write_region(&self, offset: u64, bytes: &[u8]) -> XTreeResult<()> {
        let mut state = self.state.lock();
        state
            .file
            .seek(SeekFrom::Start(self.page_size as u64 + offset))?;
        state.file.write_all(bytes)?;
        self.counters.write();
        Ok(())
    }

    fn truncate_region(&self, offset: u64) -> XTreeResult<()> {
        let state = self.state.lock();
        state.file.set_len(self.page_size as u64 + offset)?;
        Ok(())
    }

    fn region_len(&self) -> XTreeResult<u64> {
        let state = self.state.lock();
        let len = state.file.metadata()?.len();
        Ok(len.saturating_sub(self.page_size as u64))
    }

    fn sync(&self) -> XTreeResult<()> {
        self.state.lock().file.sync_all()?;
        Ok(())
    }

    fn reads(&self) -> u64 {
        self.counters.reads.load(Ordering::Relaxed)
    }

    fn writes(&self) -> u64 {
        self.counters.writes.load(Ordering::Relaxed)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    pages: HashMap<PageId, Vec<u8>>,
    next_page_id: PageId,
}

/// Page store that keeps pages in memory; it cannot be committed.
pub struct MemoryPageFile {
    state: Mutex<MemoryState>,
    page_size: usize,
    counters: IoCounters,
}

impl MemoryPageFile {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            page_size,
            counters: IoCounters::default(),
        }
    }
}

impl PageFile for MemoryPageFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId) -> XTreeResult<Vec<u8>> {
        let state = self.state.lock();
        let page = state.pages.get(&page_id).cloned().ok_or_else(|| {
            XTreeError::InvalidOperation(format!("page {} has never been written", page_id))
        })?;
        self.counters.read();
        Ok(page)
    }

    fn write_page(&self, page_id: PageId, bytes: &[u8]) -> XTreeResult<()> {
        let page = padded(bytes, self.page_size)?;
        let mut state = self.state.lock();
        state.pages.insert(page_id, page);
        if page_id >= state.next_page_id {
            state.next_page_id = page_id + 1;
        }
        self.counters.write();
        Ok(())
    }

    fn next_page_id(&self) -> PageId {
        self.state.lock().next_page_id
    }

    fn set_next_page_id(&self, next: PageId) {
        self.state.lock().next_page_id = next;
    }

    fn allocate_page(&self) -> PageId {
        let mut state = self.state.lock();
        let id = state.next_page_id;
        state.next_page_id += 1;
        id
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn read_header(&self) -> XTreeResult<TreeHeader> {
        Err(XTreeError::NotPersistent)
    }

    fn write_header(&self, _header: &TreeHeader) -> XTreeResult<()> {
        Err(XTreeError::NotPersistent)
    }

    fn read_region(&self, _offset: u64, _len: usize) -> XTreeResult<Vec<u8>> {
        Err(XTreeError::NotPersistent)
    }

    fn write_region(&self, _offset: u64, _bytes: &[u8]) -> XTreeResult<()> {
        Err(XTreeError::NotPersistent)
    }

    fn truncate_region(&self, _offset: u64) -> XTreeResult<()> {
        Err(XTreeError::NotPersistent)
    }

    fn region_len(&self) -> XTreeResult<u64> {
        let state = self.state.lock();
        Ok(state.next_page_id as u64 * self.page_size as u64)
    }

    fn sync(&self) -> XTreeResult<()> {
        Ok(())
    }

    fn reads(&self) -> u64 {
        self.counters.reads.load(Ordering::Relaxed)
    }

    fn writes(&self) -> u64 {
        self.counters.writes.load(Ordering::Relaxed)
    }
}
