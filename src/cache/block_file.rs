// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! One cached upstream file on disk: a sparse data file plus a sidecar
//! holding the header and the block presence bitmap.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use sha2::Digest;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::new_std_io_error;
use crate::Error;
use crate::ErrorKind;
use crate::Result;

const META_MAGIC: [u8; 4] = *b"HMBF";
const META_VERSION: u8 = 1;
const HEADER_LEN: usize = 64;
const DIGEST_OFFSET: u64 = 24;

/// Identity of the upstream file a BlockFile caches. An on-disk sidecar that
/// disagrees with this identity is deleted and recreated.
#[derive(Debug, Clone)]
pub struct OpenArgs {
    pub total_size: u64,
    pub block_size: u64,
    pub digest: Option<[u8; 32]>,
    pub etag: String,
}

/// Presence of a byte range in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePresence {
    /// Every block intersecting the range is complete.
    Complete,
    /// No block intersecting the range is complete.
    Empty,
    /// Some blocks are missing; inclusive block-index intervals, clipped to
    /// the requested range.
    Partial(Vec<(u64, u64)>),
}

struct Bitmap {
    bits: Vec<u8>,
    complete: u64,
}

impl Bitmap {
    fn empty(blocks: u64) -> Self {
        Bitmap {
            bits: vec![0u8; blocks.div_ceil(8) as usize],
            complete: 0,
        }
    }

    fn from_bytes(bits: Vec<u8>, blocks: u64) -> Self {
        let complete = (0..blocks).filter(|b| bit_is_set(&bits, *b)).count() as u64;
        Bitmap { bits, complete }
    }
}

fn bit_is_set(bits: &[u8], index: u64) -> bool {
    bits[(index / 8) as usize] & (1 << (index % 8)) != 0
}

/// A sparse data file (`.bin`) and its sidecar (`.meta`).
///
/// Safe for concurrent readers and writers against distinct blocks: byte I/O
/// uses positioned reads and writes, only the bitmap and header writeback go
/// through the per-file lock. A reader observes a block as complete only
/// after its bytes are durable, because `write_block` orders write → flush →
/// set bit → persist bitmap.
pub struct BlockFile {
    data_path: PathBuf,
    meta_path: PathBuf,
    data: File,
    meta: File,

    total_size: u64,
    block_size: u64,
    digest: Option<[u8; 32]>,
    etag: String,

    state: Mutex<Bitmap>,
}

impl BlockFile {
    /// Open the pair at `data_path`/`meta_path`, or create it when absent.
    ///
    /// A sidecar whose size, block size, or digest disagrees with `args` is
    /// deleted and recreated, as is one that fails to decode. Creation goes
    /// through `tmp_dir` and promotes both files by rename, so a crash never
    /// leaves a half-written sidecar at the final path.
    pub fn open_or_create(
        data_path: &Path,
        meta_path: &Path,
        tmp_dir: &Path,
        args: &OpenArgs,
    ) -> Result<Self> {
        debug_assert!(args.block_size.is_power_of_two());

        if meta_path.exists() {
            match Self::open(data_path, meta_path, args) {
                Ok(file) => return Ok(file),
                Err(err) => {
                    log::warn!(
                        "block file {} rejected ({}), recreating",
                        data_path.display(),
                        err.kind()
                    );
                    remove_pair(data_path, meta_path)?;
                }
            }
        }

        Self::create(data_path, meta_path, tmp_dir, args)
    }

    fn open(data_path: &Path, meta_path: &Path, args: &OpenArgs) -> Result<Self> {
        let mut meta = OpenOptions::new()
            .read(true)
            .write(true)
            .open(meta_path)
            .map_err(new_std_io_error)?;

        let (total_size, block_size, stored_digest, etag, bits) = decode_meta(&mut meta)?;

        if total_size != args.total_size {
            return Err(Error::new(
                ErrorKind::SizeMismatch,
                format!(
                    "cached size {} disagrees with upstream size {}",
                    total_size, args.total_size
                ),
            ));
        }
        if block_size != args.block_size {
            return Err(Error::new(
                ErrorKind::SizeMismatch,
                "cached block size disagrees with configuration",
            ));
        }
        if let (Some(stored), Some(expected)) = (stored_digest, args.digest) {
            if stored != expected {
                return Err(Error::new(
                    ErrorKind::DigestMismatch,
                    "cached digest disagrees with upstream digest",
                ));
            }
        }

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_path)
            .map_err(new_std_io_error)?;

        let file = BlockFile {
            data_path: data_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
            data,
            meta,
            total_size,
            block_size,
            digest: stored_digest.or(args.digest),
            etag,
            state: Mutex::new(Bitmap::from_bytes(bits, total_size.div_ceil(block_size))),
        };

        // Adopt a digest the upstream started reporting after creation.
        if stored_digest.is_none() {
            if let Some(digest) = args.digest {
                write_at(&file.meta, DIGEST_OFFSET, &digest)?;
            }
        }

        Ok(file)
    }

    fn create(data_path: &Path, meta_path: &Path, tmp_dir: &Path, args: &OpenArgs) -> Result<Self> {
        fs::create_dir_all(tmp_dir).map_err(new_std_io_error)?;
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent).map_err(new_std_io_error)?;
        }

        let blocks = args.total_size.div_ceil(args.block_size);
        let bitmap = Bitmap::empty(blocks);

        let stem = Uuid::new_v4().to_string();
        let tmp_data = tmp_dir.join(format!("{stem}.bin"));
        let tmp_meta = tmp_dir.join(format!("{stem}.meta"));

        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_data)
            .map_err(new_std_io_error)?;
        data.set_len(args.total_size).map_err(new_std_io_error)?;

        let meta = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_meta)
            .map_err(new_std_io_error)?;
        write_at(&meta, 0, &encode_meta(args, &bitmap.bits))?;
        meta.sync_data().map_err(new_std_io_error)?;

        // Data first; the sidecar rename is the commit point.
        fs::rename(&tmp_data, data_path).map_err(new_std_io_error)?;
        fs::rename(&tmp_meta, meta_path).map_err(new_std_io_error)?;

        Ok(BlockFile {
            data_path: data_path.to_path_buf(),
            meta_path: meta_path.to_path_buf(),
            data,
            meta,
            total_size: args.total_size,
            block_size: args.block_size,
            digest: args.digest,
            etag: args.etag.clone(),
            state: Mutex::new(bitmap),
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn digest(&self) -> Option<[u8; 32]> {
        self.digest
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Number of blocks, `ceil(total_size / block_size)`.
    pub fn block_count(&self) -> u64 {
        self.total_size.div_ceil(self.block_size)
    }

    /// Byte offset where a block starts.
    pub fn block_offset(&self, index: u64) -> u64 {
        index * self.block_size
    }

    /// Length of a block; the last block is clipped to the file end.
    pub fn block_len(&self, index: u64) -> u64 {
        debug_assert!(index < self.block_count());
        (self.total_size - index * self.block_size).min(self.block_size)
    }

    /// The inclusive block index range covering `[offset, offset + len)`.
    pub fn block_span(&self, offset: u64, len: u64) -> Option<(u64, u64)> {
        if len == 0 || offset >= self.total_size {
            return None;
        }
        let end = (offset + len).min(self.total_size);
        Some((offset / self.block_size, (end - 1) / self.block_size))
    }

    /// Whether one block's bytes are fully present.
    pub fn is_block_complete(&self, index: u64) -> bool {
        let state = self.state.lock().expect("bitmap lock poisoned");
        bit_is_set(&state.bits, index)
    }

    /// Whether every block is present.
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().expect("bitmap lock poisoned");
        state.complete == self.block_count()
    }

    /// Presence of `[offset, offset + len)`, with missing blocks reported as
    /// inclusive block-index intervals clipped to the range.
    pub fn has_range(&self, offset: u64, len: u64) -> RangePresence {
        let Some((first, last)) = self.block_span(offset, len) else {
            return RangePresence::Complete;
        };

        let state = self.state.lock().expect("bitmap lock poisoned");

        let mut missing: Vec<(u64, u64)> = Vec::new();
        let mut present = 0u64;
        for block in first..=last {
            if bit_is_set(&state.bits, block) {
                present += 1;
            } else {
                match missing.last_mut() {
                    Some((_, end)) if *end + 1 == block => *end = block,
                    _ => missing.push((block, block)),
                }
            }
        }

        if missing.is_empty() {
            RangePresence::Complete
        } else if present == 0 {
            RangePresence::Empty
        } else {
            RangePresence::Partial(missing)
        }
    }

    /// Read exactly `len` bytes at `offset`. The caller must have checked the
    /// range is complete; reading through an unwritten block is a bug.
    pub fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if offset + len > self.total_size {
            return Err(Error::new(
                ErrorKind::Unexpected,
                "read beyond end of cached file",
            )
            .with_operation("BlockFile::read_range"));
        }
        if let Some((first, last)) = self.block_span(offset, len) {
            let state = self.state.lock().expect("bitmap lock poisoned");
            for block in first..=last {
                if !bit_is_set(&state.bits, block) {
                    return Err(Error::new(
                        ErrorKind::Unexpected,
                        format!("read of incomplete block {block}"),
                    )
                    .with_operation("BlockFile::read_range"));
                }
            }
        }

        let mut buf = vec![0u8; len as usize];
        read_exact_at(&self.data, offset, &mut buf)?;
        Ok(buf)
    }

    /// Write one full block and mark it complete.
    ///
    /// `bytes` must be exactly the block's length. Writes to an
    /// already-complete block are a no-op: content is immutable for a given
    /// commit and path. The bitmap bit is set only after the data flush
    /// returns.
    pub fn write_block(&self, index: u64, bytes: &[u8]) -> Result<()> {
        if index >= self.block_count() {
            return Err(Error::new(
                ErrorKind::Unexpected,
                format!("block {index} out of range"),
            )
            .with_operation("BlockFile::write_block"));
        }
        if bytes.len() as u64 != self.block_len(index) {
            return Err(Error::new(
                ErrorKind::Unexpected,
                format!(
                    "block {index} write of {} bytes, expected {}",
                    bytes.len(),
                    self.block_len(index)
                ),
            )
            .with_operation("BlockFile::write_block"));
        }

        if self.is_block_complete(index) {
            return Ok(());
        }

        write_at(&self.data, self.block_offset(index), bytes)?;
        self.data.sync_data().map_err(new_std_io_error)?;

        let mut state = self.state.lock().expect("bitmap lock poisoned");
        if bit_is_set(&state.bits, index) {
            return Ok(());
        }
        let byte = (index / 8) as usize;
        state.bits[byte] |= 1 << (index % 8);
        state.complete += 1;

        let bitmap_offset = (HEADER_LEN + self.etag.len()) as u64 + byte as u64;
        write_at(&self.meta, bitmap_offset, &[state.bits[byte]])?;
        self.meta.sync_data().map_err(new_std_io_error)?;

        Ok(())
    }

    /// Flush both files; when the file is complete and a digest is known,
    /// verify the content hashes to it.
    pub fn finalize(&self) -> Result<()> {
        self.data.sync_all().map_err(new_std_io_error)?;
        self.meta.sync_all().map_err(new_std_io_error)?;

        let (Some(expected), true) = (self.digest, self.is_complete()) else {
            return Ok(());
        };

        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        while offset < self.total_size {
            let take = (self.total_size - offset).min(buf.len() as u64) as usize;
            read_exact_at(&self.data, offset, &mut buf[..take])?;
            hasher.update(&buf[..take]);
            offset += take as u64;
        }
        let actual: [u8; 32] = hasher.finalize().into();

        if actual != expected {
            return Err(Error::new(
                ErrorKind::DigestMismatch,
                "finalized content disagrees with upstream digest",
            )
            .with_operation("BlockFile::finalize")
            .with_context("expected", hex::encode(expected))
            .with_context("actual", hex::encode(actual)));
        }

        Ok(())
    }
}

/// Delete a data/sidecar pair, tolerating half-removed state.
pub fn remove_pair(data_path: &Path, meta_path: &Path) -> Result<()> {
    for path in [meta_path, data_path] {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(new_std_io_error(err));
            }
        }
    }
    Ok(())
}

fn encode_meta(args: &OpenArgs, bits: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + args.etag.len() + bits.len());
    buf.extend_from_slice(&META_MAGIC);
    buf.push(META_VERSION);
    buf.extend_from_slice(&[0u8; 3]);
    buf.extend_from_slice(&args.block_size.to_le_bytes());
    buf.extend_from_slice(&args.total_size.to_le_bytes());
    buf.extend_from_slice(&args.digest.unwrap_or([0u8; 32]));
    buf.extend_from_slice(&(args.etag.len() as u64).to_le_bytes());
    buf.extend_from_slice(args.etag.as_bytes());
    buf.extend_from_slice(bits);
    buf
}

type DecodedMeta = (u64, u64, Option<[u8; 32]>, String, Vec<u8>);

fn decode_meta(meta: &mut File) -> Result<DecodedMeta> {
    let corrupt = |msg: &str| Error::new(ErrorKind::BitmapCorrupt, msg.to_string());

    let mut header = [0u8; HEADER_LEN];
    read_exact_at(meta, 0, &mut header).map_err(|_| corrupt("sidecar header is short"))?;

    if header[0..4] != META_MAGIC {
        return Err(corrupt("bad sidecar magic"));
    }
    if header[4] != META_VERSION {
        return Err(corrupt("unsupported sidecar version"));
    }

    let block_size = u64::from_le_bytes(header[8..16].try_into().expect("slice len is 8"));
    let total_size = u64::from_le_bytes(header[16..24].try_into().expect("slice len is 8"));
    if block_size == 0 || !block_size.is_power_of_two() {
        return Err(corrupt("sidecar block size is not a power of two"));
    }

    let digest: [u8; 32] = header[24..56].try_into().expect("slice len is 32");
    let digest = if digest == [0u8; 32] {
        None
    } else {
        Some(digest)
    };

    let etag_len = u64::from_le_bytes(header[56..64].try_into().expect("slice len is 8"));
    if etag_len > 4096 {
        return Err(corrupt("sidecar etag length is implausible"));
    }

    let mut etag = vec![0u8; etag_len as usize];
    read_exact_at(meta, HEADER_LEN as u64, &mut etag)
        .map_err(|_| corrupt("sidecar etag is short"))?;
    let etag = String::from_utf8(etag).map_err(|_| corrupt("sidecar etag is not utf-8"))?;

    let blocks = total_size.div_ceil(block_size.max(1));
    let mut bits = vec![0u8; blocks.div_ceil(8) as usize];
    read_exact_at(meta, (HEADER_LEN as u64) + etag_len, &mut bits)
        .map_err(|_| corrupt("sidecar bitmap is short"))?;

    Ok((total_size, block_size, digest, etag, bits))
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset).map_err(new_std_io_error)
}

#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset).map_err(new_std_io_error)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset).map_err(new_std_io_error)?;
        if n == 0 {
            return Err(Error::new(ErrorKind::Unexpected, "unexpected eof"));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut offset: u64, mut buf: &[u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset).map_err(new_std_io_error)?;
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}
