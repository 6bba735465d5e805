//! Chunked file reader/writer (component H): streams large files one chunk
//! at a time instead of buffering them whole, with a per-chunk checksum and
//! an atomic, collision-safe rename on completion.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, instrument};

/// One chunk's worth of plaintext plus its position and checksum.
pub struct Chunk {
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub chunk_checksum: String,
}

/// Reads a file chunk by chunk without ever holding more than one chunk in
/// memory. Supports rewinding to resend a chunk after a dropped connection.
pub struct ChunkedReader {
    file: File,
    chunk_size: usize,
    file_len: u64,
    next_offset: u64,
}

impl ChunkedReader {
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).await?;
        let file_len = file.seek(SeekFrom::End(0)).await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Self { file, chunk_size, file_len, next_offset: 0 })
    }

    pub fn total_chunks(&self) -> u64 {
        if self.file_len == 0 {
            return 1;
        }
        self.file_len.div_ceil(self.chunk_size as u64)
    }

    /// Seeks back to `offset` so a chunk can be resent; the caller supplies
    /// an offset previously returned by `next_chunk`.
    pub async fn rewind_to(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.next_offset = offset;
        Ok(())
    }

    /// Returns the next chunk, or `None` once the file is exhausted. A
    /// zero-byte file yields exactly one empty chunk so callers still get a
    /// `FILE_CHUNK`/`FILE_COMPLETE` pair.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.next_offset > self.file_len {
            return Ok(None);
        }
        if self.next_offset == self.file_len && self.file_len != 0 {
            return Ok(None);
        }
        let remaining = self.file_len.saturating_sub(self.next_offset);
        let take = remaining.min(self.chunk_size as u64) as usize;
        let mut buf = vec![0u8; take];
        if take > 0 {
            self.file.read_exact(&mut buf).await?;
        }
        let offset = self.next_offset;
        let chunk_checksum = hex::encode(Sha256::digest(&buf));
        self.next_offset += take as u64;
        if self.file_len == 0 {
            // Mark exhausted after the single empty chunk.
            self.next_offset = 1;
        }
        Ok(Some(Chunk { offset, bytes: buf, chunk_checksum }))
    }
}

/// Accumulates chunks into a sibling `<dest>.part` file, verifies the whole
/// file's checksum on completion, then atomically renames into place.
pub struct ChunkedWriter {
    part_path: PathBuf,
    final_path: PathBuf,
    file: File,
    hasher: Sha256,
    bytes_written: u64,
}

impl ChunkedWriter {
    /// `part_discriminant` must be unique among files written concurrently
    /// into the same directory under the same `dest` name (e.g. a
    /// transfer/file-index pair), so two same-named files in one transfer
    /// accumulate into distinct `.part` files instead of one clobbering the
    /// other; `dest` itself is only the *final* name, reconciled against
    /// what's already on disk at `finalize`.
    #[instrument(skip(dest), fields(dest = %dest.as_ref().display()))]
    pub async fn create(dest: impl AsRef<Path>, part_discriminant: &str) -> Result<Self> {
        let final_path = dest.as_ref().to_path_buf();
        let part_path = final_path.with_extension(append_part_extension(&final_path, part_discriminant));
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&part_path).await?;
        Ok(Self { part_path, final_path, file, hasher: Sha256::new(), bytes_written: 0 })
    }

    /// Writes one chunk, verifying its own checksum before accepting it.
    pub async fn write_chunk(&mut self, offset: u64, bytes: &[u8], chunk_checksum: &str) -> Result<()> {
        let actual = hex::encode(Sha256::digest(bytes));
        if actual != chunk_checksum {
            return Err(Error::ChecksumMismatch { file: self.final_path.to_string_lossy().into_owned() });
        }
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        self.hasher.update(bytes);
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Verifies the whole-file checksum and renames `.part` into place,
    /// suffixing `(2)`, `(3)`, ... on a name collision.
    pub async fn finalize(mut self, expected_checksum: &str) -> Result<PathBuf> {
        self.file.flush().await?;
        let actual = hex::encode(self.hasher.finalize());
        if actual != expected_checksum {
            let _ = tokio::fs::remove_file(&self.part_path).await;
            return Err(Error::ChecksumMismatch { file: self.final_path.to_string_lossy().into_owned() });
        }

        let target = unique_destination(&self.final_path).await;
        tokio::fs::rename(&self.part_path, &target).await?;
        debug!(path = %target.display(), bytes = self.bytes_written, "transfer written");
        Ok(target)
    }

    pub async fn abort(self) {
        let _ = tokio::fs::remove_file(&self.part_path).await;
    }
}

fn append_part_extension(path: &Path, discriminant: &str) -> std::ffi::OsString {
    let mut ext = path.extension().map(|e| e.to_os_string()).unwrap_or_default();
    if !ext.is_empty() {
        ext.push(".");
    }
    ext.push(discriminant);
    ext.push(".part");
    ext
}

/// Appends ` (2)`, ` (3)`, ... to the file stem until no file exists at that
/// path, matching the teacher's and pack's "never clobber" download naming.
async fn unique_destination(path: &Path) -> PathBuf {
    if tokio::fs::metadata(path).await.is_err() {
        return path.to_path_buf();
    }
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    for n in 2.. {
        let name = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = parent.join(name);
        if tokio::fs::metadata(&candidate).await.is_err() {
            return candidate;
        }
    }
    unreachable!("collision loop is unbounded")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    async fn write_temp(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).await.unwrap();
        f.write_all(content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn reads_file_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; 2500];
        let path = write_temp(&dir, "a.bin", &content).await;

        let mut reader = ChunkedReader::open(&path, 1000).await.unwrap();
        assert_eq!(reader.total_chunks(), 3);
        let mut collected = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            collected.extend_from_slice(&chunk.bytes);
        }
        assert_eq!(collected, content);
    }

    #[tokio::test]
    async fn zero_byte_file_yields_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "empty.bin", b"").await;
        let mut reader = ChunkedReader::open(&path, 1000).await.unwrap();
        let chunk = reader.next_chunk().await.unwrap().unwrap();
        assert!(chunk.bytes.is_empty());
        assert!(reader.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writer_verifies_chunk_and_whole_file_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let content = b"hello world";
        let chunk_checksum = hex::encode(Sha256::digest(content));
        let whole_checksum = hex::encode(Sha256::digest(content));

        let mut writer = ChunkedWriter::create(&dest, "0").await.unwrap();
        writer.write_chunk(0, content, &chunk_checksum).await.unwrap();
        let final_path = writer.finalize(&whole_checksum).await.unwrap();
        assert_eq!(final_path, dest);
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), content);
    }

    #[tokio::test]
    async fn writer_rejects_tampered_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut writer = ChunkedWriter::create(&dest, "0").await.unwrap();
        let result = writer.write_chunk(0, b"hello", "0".repeat(64).as_str()).await;
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn collision_appends_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        tokio::fs::write(&dest, b"existing").await.unwrap();

        let content = b"new content";
        let chunk_checksum = hex::encode(Sha256::digest(content));
        let mut writer = ChunkedWriter::create(&dest, "0").await.unwrap();
        writer.write_chunk(0, content, &chunk_checksum).await.unwrap();
        let final_path = writer.finalize(&chunk_checksum).await.unwrap();
        assert_eq!(final_path, dir.path().join("out (2).txt"));
    }

    #[tokio::test]
    async fn same_named_files_write_into_distinct_part_files_when_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("same.txt");

        let content_a = b"from file a";
        let content_b = b"from file b, longer";
        let checksum_a = hex::encode(Sha256::digest(content_a));
        let checksum_b = hex::encode(Sha256::digest(content_b));

        let mut writer_a = ChunkedWriter::create(&dest, "0").await.unwrap();
        let mut writer_b = ChunkedWriter::create(&dest, "1").await.unwrap();

        // Interleave writes as if chunks from two files in the same transfer
        // arrived out of order on the wire.
        writer_b.write_chunk(0, content_b, &checksum_b).await.unwrap();
        writer_a.write_chunk(0, content_a, &checksum_a).await.unwrap();

        let path_a = writer_a.finalize(&checksum_a).await.unwrap();
        let path_b = writer_b.finalize(&checksum_b).await.unwrap();

        assert_ne!(path_a, path_b);
        assert_eq!(tokio::fs::read(&path_a).await.unwrap(), content_a);
        assert_eq!(tokio::fs::read(&path_b).await.unwrap(), content_b);
    }
}
