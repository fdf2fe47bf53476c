//! Purpose: Flat-file record store: build by append, query by linear scan.
//! Exports: `RecordStore`, `StoreBuilder`, `StoreWriter`, `WriteSummary`, `Ids`.
//! Role: Owns the encoded byte buffer; every lookup re-scans it using codec markers.
//! Invariants: `RecordStore` never mutates its buffer except through `reload`/`replace_buffer`,
//!   both of which bump the version and clear the lookup cache.
//! Invariants: Duplicate identifiers are tolerated; lookups resolve to the first in byte order.
//! Invariants: A `RecordStore` is `!Sync`; give each reader thread its own handle.
use std::cell::{Ref, RefCell};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use bstr::{BString, ByteSlice, Finder};
use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::Mmap;

use crate::core::cache::LookupCache;
use crate::core::codec::{self, END_MARK, Record, SEP, START_MARK};
use crate::core::error::{Error, ErrorKind};

enum Buffer {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Buffer::Owned(bytes) => bytes,
            Buffer::Mapped(mmap) => mmap,
        }
    }
}

/// Freshly mapped file contents waiting to replace a store's buffer.
pub(crate) struct StagedBuffer(Buffer);

struct FoldedShadow {
    version: u64,
    bytes: Vec<u8>,
}

/// Read-only view over an encoded buffer, with a per-store lookup cache.
pub struct RecordStore {
    path: Option<PathBuf>,
    buf: Buffer,
    version: u64,
    folded: RefCell<Option<FoldedShadow>>,
    cache: LookupCache,
}

impl RecordStore {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::with_buffer(None, Buffer::Owned(bytes))
    }

    /// Maps a store file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let buf = map_file(&path)?;
        tracing::debug!(path = %path.display(), bytes = buf.len(), "opened record store");
        Ok(Self::with_buffer(Some(path), buf))
    }

    fn with_buffer(path: Option<PathBuf>, buf: Buffer) -> Self {
        Self {
            path,
            buf,
            version: 0,
            folded: RefCell::new(None),
            cache: LookupCache::new(),
        }
    }

    /// Re-reads the backing file and drops every cached record.
    pub fn reload(&mut self) -> Result<(), Error> {
        let staged = self.stage_reload()?;
        self.apply_reload(staged);
        Ok(())
    }

    /// Maps the backing file again without touching the live buffer.
    pub(crate) fn stage_reload(&self) -> Result<StagedBuffer, Error> {
        let path = self.path.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message("store was not opened from a file")
        })?;
        Ok(StagedBuffer(map_file(path)?))
    }

    pub(crate) fn apply_reload(&mut self, staged: StagedBuffer) {
        self.swap_buffer(staged.0);
        if let Some(path) = &self.path {
            tracing::info!(path = %path.display(), version = self.version, "reloaded record store");
        }
    }

    pub fn replace_buffer(&mut self, bytes: Vec<u8>) {
        self.swap_buffer(Buffer::Owned(bytes));
    }

    fn swap_buffer(&mut self, buf: Buffer) {
        self.buf = buf;
        self.version += 1;
        self.cache.clear();
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bumped on every buffer replacement.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cached_records(&self) -> usize {
        self.cache.len()
    }

    /// Body span `(start, end)` of the record enclosing `offset`, markers excluded.
    ///
    /// Offsets on the record's own markers (including the newline of the end
    /// marker) resolve to that record. Anything else is a `BoundaryScan` error.
    pub fn find_entry_boundary(&self, offset: usize) -> Result<(usize, usize), Error> {
        find_entry_boundary(&self.buf, offset)
    }

    /// Fields of the first record whose identifier is exactly `id`.
    pub fn get(&self, id: impl AsRef<[u8]>) -> Result<Record, Error> {
        let id = id.as_ref();
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }
        codec::validate_field(id)?;

        let pos = find_record_start(&self.buf, id).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("no record with id {:?}", id.as_bstr()))
        })?;
        let (start, end) = self.find_entry_boundary(pos)?;
        let record = codec::decode(&self.buf[start..end]);
        self.cache.insert(&record);
        Ok(record)
    }

    /// Identifiers of records containing `text`, ASCII case-insensitively.
    ///
    /// Each record is reported once, in byte order. A matched record is cached
    /// only when it is the first record carrying its id.
    pub fn search(&self, text: &str) -> Result<Vec<BString>, Error> {
        if text.is_empty() || self.buf.is_empty() {
            return Ok(Vec::new());
        }
        let needle = text.as_bytes().to_ascii_lowercase();
        let finder = Finder::new(&needle);
        let folded = self.folded();

        let mut ids = Vec::new();
        let mut from = 0usize;
        while let Some(hit) = finder.find(&folded[from..]) {
            let idx = from + hit;
            let (start, end) = self.find_entry_boundary(idx)?;
            let record = codec::decode(&self.buf[start..end]);
            // Only the first record for an id may back later `get` calls.
            if find_record_start(&self.buf, record.id()) == Some(start - 1) {
                self.cache.insert_if_absent(&record);
            }
            ids.push(BString::from(record.id().as_bytes()));

            match self.buf[end..].find_byte(START_MARK) {
                Some(next) => from = end + next,
                None => break,
            }
        }
        Ok(ids)
    }

    /// Lazy scan over record identifiers in buffer order; empty records are skipped.
    pub fn ids(&self) -> Ids<'_> {
        Ids {
            buf: &self.buf,
            next: 0,
        }
    }

    fn folded(&self) -> Ref<'_, [u8]> {
        {
            let mut slot = self.folded.borrow_mut();
            let stale = slot
                .as_ref()
                .is_none_or(|shadow| shadow.version != self.version);
            if stale {
                *slot = Some(FoldedShadow {
                    version: self.version,
                    bytes: self.buf.to_ascii_lowercase(),
                });
            }
        }
        Ref::map(self.folded.borrow(), |slot| match slot {
            Some(shadow) => shadow.bytes.as_slice(),
            None => &[],
        })
    }
}

impl<'a> IntoIterator for &'a RecordStore {
    type Item = Result<BString, Error>;
    type IntoIter = Ids<'a>;

    fn into_iter(self) -> Ids<'a> {
        self.ids()
    }
}

pub struct Ids<'a> {
    buf: &'a [u8],
    next: usize,
}

impl Iterator for Ids<'_> {
    type Item = Result<BString, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let pos = self.next + self.buf.get(self.next..)?.find_byte(START_MARK)?;
            match find_entry_boundary(self.buf, pos) {
                Ok((start, end)) => {
                    self.next = end + END_MARK.len();
                    if start == end {
                        continue;
                    }
                    let id = codec::decode_id(&self.buf[start..end]);
                    return Some(Ok(BString::from(id)));
                }
                Err(err) => {
                    self.next = self.buf.len();
                    return Some(Err(err));
                }
            }
        }
    }
}

/// Mutable append-only buffer used to assemble a store in memory.
#[derive(Debug, Default)]
pub struct StoreBuilder {
    buf: Vec<u8>,
    records: u64,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one record. No uniqueness check is made on the identifier.
    pub fn insert<F: AsRef<[u8]>>(&mut self, fields: &[F]) -> Result<(), Error> {
        codec::encode_into(&mut self.buf, fields)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn build(self) -> RecordStore {
        RecordStore::from_bytes(self.buf)
    }

    /// Writes the current buffer to `path` and returns a writer that streams
    /// further records straight to the file.
    pub fn create(&self, path: impl AsRef<Path>) -> Result<StoreWriter, Error> {
        let mut writer = StoreWriter::open_locked(path.as_ref())?;
        writer.write_raw(&self.buf)?;
        writer.records = self.records;
        Ok(writer)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WriteSummary {
    pub records: u64,
    pub bytes: u64,
}

/// Streaming store writer. Records go to a `.partial` sibling that holds an
/// exclusive lock and is renamed over the target by `finish`, so readers
/// mapping the previous file keep seeing the previous bytes.
pub struct StoreWriter {
    path: PathBuf,
    partial: PathBuf,
    out: BufWriter<File>,
    scratch: Vec<u8>,
    records: u64,
    bytes: u64,
    committed: bool,
}

impl StoreWriter {
    fn open_locked(path: &Path) -> Result<Self, Error> {
        let partial = partial_path(path)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&partial)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&partial).with_source(err))?;
        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_message("store file is locked by another build")
                .with_path(&partial)
                .with_source(err)
        })?;
        file.set_len(0)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&partial).with_source(err))?;
        Ok(Self {
            path: path.to_path_buf(),
            partial,
            out: BufWriter::new(file),
            scratch: Vec::new(),
            records: 0,
            bytes: 0,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write<F: AsRef<[u8]>>(&mut self, fields: &[F]) -> Result<(), Error> {
        self.scratch.clear();
        codec::encode_into(&mut self.scratch, fields)?;
        let scratch = std::mem::take(&mut self.scratch);
        let result = self.write_raw(&scratch);
        self.scratch = scratch;
        result?;
        self.records += 1;
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.out
            .write_all(bytes)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.partial).with_source(err))?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }

    /// Flushes buffered records and syncs the `.partial` file to disk.
    ///
    /// Call on every writer of a snapshot before finishing any of them, so a
    /// late I/O failure cannot leave a half-replaced snapshot.
    pub fn sync(&mut self) -> Result<(), Error> {
        self.out
            .flush()
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.partial).with_source(err))?;
        self.out
            .get_ref()
            .sync_all()
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.partial).with_source(err))
    }

    /// Syncs, moves the file into place, and releases the lock.
    pub fn finish(mut self) -> Result<WriteSummary, Error> {
        self.sync()?;
        std::fs::rename(&self.partial, &self.path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))?;
        self.committed = true;
        let _ = FileExt::unlock(self.out.get_ref());
        Ok(WriteSummary {
            records: self.records,
            bytes: self.bytes,
        })
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.partial) {
            tracing::debug!(path = %self.partial.display(), error = %err, "could not remove partial store");
        }
    }
}

fn partial_path(path: &Path) -> Result<PathBuf, Error> {
    let name = path.file_name().ok_or_else(|| {
        Error::new(ErrorKind::Usage)
            .with_message("store path has no file name")
            .with_path(path)
    })?;
    let mut partial = name.to_os_string();
    partial.push(".partial");
    Ok(path.with_file_name(partial))
}

fn map_file(path: &Path) -> Result<Buffer, Error> {
    let file = File::open(path).map_err(|err| {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::Permission,
            _ => ErrorKind::Io,
        };
        Error::new(kind).with_path(path).with_source(err)
    })?;
    let len = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
    // Zero-length mappings are rejected on some platforms.
    if len == 0 {
        return Ok(Buffer::Owned(Vec::new()));
    }
    // SAFETY: store files are never written in place; builds write a
    // `.partial` sibling and rename it over the target, so this inode stays
    // unchanged for the life of the mapping.
    let mmap = unsafe {
        Mmap::map(&file).map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
    };
    Ok(Buffer::Mapped(mmap))
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

/// Offset of the START_MARK of the first record whose id is exactly `id`.
fn find_record_start(buf: &[u8], id: &[u8]) -> Option<usize> {
    let mut needle = Vec::with_capacity(id.len() + 1);
    needle.push(START_MARK);
    needle.extend_from_slice(id);
    let finder = Finder::new(&needle);

    let mut from = 0usize;
    while let Some(hit) = finder.find(&buf[from..]) {
        let pos = from + hit;
        let after = &buf[pos + needle.len()..];
        if after.first() == Some(&SEP) || after.starts_with(&END_MARK) {
            return Some(pos);
        }
        from = pos + 1;
    }
    None
}

fn find_entry_boundary(buf: &[u8], offset: usize) -> Result<(usize, usize), Error> {
    let fail = |message: &str| {
        Error::new(ErrorKind::BoundaryScan)
            .with_message(message.to_string())
            .with_offset(offset as u64)
    };
    if offset >= buf.len() {
        return Err(fail("offset is past the end of the buffer"));
    }
    let mark = buf[..=offset]
        .rfind_byte(START_MARK)
        .ok_or_else(|| fail("no record start before offset"))?;
    let start = mark + 1;

    // Step back one byte so an offset on the end marker's newline still
    // finds its own marker.
    let from = offset.saturating_sub(1).max(mark);
    let end = buf[from..]
        .find(END_MARK)
        .map(|pos| from + pos)
        .ok_or_else(|| fail("no record end after offset"))?;
    if end < start {
        return Err(fail("record end precedes record start"));
    }
    if buf[start..end].contains(&START_MARK) {
        return Err(fail("offset is not inside a well-formed record"));
    }
    Ok((start, end))
}
