// Copyright (c) The harness-core Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded capture of a child's stdout/stderr, with head/tail truncation
//! and non-UTF-8 detection.

use crate::errors::OutputLogError;
use bytes::{Bytes, BytesMut};
use camino::Utf8PathBuf;
use std::sync::Arc;
use tokio::{fs::File, io::AsyncWriteExt};

/// Bytes retained from the start of the stream before truncation kicks in.
pub const MAX_HEAD: usize = 512 * 1024;
/// Bytes retained from the end of the stream once `MAX_HEAD` has been
/// exceeded.
pub const TAIL_LENGTH: usize = 10 * 1024;

const TRUNCATION_BANNER: &str =
    "test.dart: Data was removed due to excessive length. The full output is in the original log.";
const NON_UTF8_BANNER: &str = "test.dart: The output of this test contained non-UTF8 formatted data.";

/// A truncating, UTF-8-validating byte buffer for child stdio.
///
/// Captures at most `head` (up to [`MAX_HEAD`] bytes) plus a rolling
/// `tail` (the last [`TAIL_LENGTH`] bytes) once `head` has saturated.
/// Optionally tees every chunk to a file on disk as it arrives.
pub struct OutputLog {
    head: BytesMut,
    tail: BytesMut,
    dropped_any: bool,
    tee: Option<TeeFile>,
}

struct TeeFile {
    path: Utf8PathBuf,
    file: File,
}

/// The result of finalizing an [`OutputLog`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FinalizedOutput {
    pub bytes: Bytes,
    pub has_non_utf8: bool,
}

impl OutputLog {
    pub fn new() -> Self {
        Self {
            head: BytesMut::new(),
            tail: BytesMut::new(),
            dropped_any: false,
            tee: None,
        }
    }

    /// Builds an output log that also writes every appended chunk to
    /// `path`, in addition to buffering it in memory.
    pub async fn with_tee(path: impl Into<Utf8PathBuf>) -> Result<Self, OutputLogError> {
        let path = path.into();
        let file = File::create(&path)
            .await
            .map_err(|e| OutputLogError::TeeWrite {
                path: path.clone(),
                source: Arc::new(e),
            })?;
        Ok(Self {
            head: BytesMut::new(),
            tail: BytesMut::new(),
            dropped_any: false,
            tee: Some(TeeFile { path, file }),
        })
    }

    /// Total bytes currently retained. Never exceeds
    /// `MAX_HEAD + 2 * TAIL_LENGTH` (head can hold up to `MAX_HEAD`, and
    /// the rolling tail buffer is trimmed back down to `TAIL_LENGTH` only
    /// after it grows to `2 * TAIL_LENGTH`, to avoid re-trimming on every
    /// single byte).
    pub fn captured_len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// Appends a chunk of child output, applying truncation, and tees it
    /// to disk if configured.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<(), OutputLogError> {
        if let Some(tee) = &mut self.tee {
            tee.file
                .write_all(chunk)
                .await
                .map_err(|e| OutputLogError::TeeWrite {
                    path: tee.path.clone(),
                    source: Arc::new(e),
                })?;
        }

        if self.head.len() < MAX_HEAD {
            let room = MAX_HEAD - self.head.len();
            if chunk.len() <= room {
                self.head.extend_from_slice(chunk);
                return Ok(());
            }
            self.head.extend_from_slice(&chunk[..room]);
            self.dropped_any = true;
            self.push_tail(&chunk[room..]);
        } else {
            self.dropped_any = true;
            self.push_tail(chunk);
        }
        Ok(())
    }

    fn push_tail(&mut self, chunk: &[u8]) {
        self.tail.extend_from_slice(chunk);
        if self.tail.len() > 2 * TAIL_LENGTH {
            let start = self.tail.len() - TAIL_LENGTH;
            let trimmed = self.tail.split_off(start);
            self.tail = trimmed;
        }
    }

    /// Flushes and releases the file sink, if any. Safe to call more than
    /// once; safe to call on every exit path including cancellation.
    pub async fn close(&mut self) -> Result<(), OutputLogError> {
        if let Some(tee) = self.tee.take() {
            let TeeFile { path, mut file } = tee;
            file.flush()
                .await
                .map_err(|e| OutputLogError::TeeWrite {
                    path,
                    source: Arc::new(e),
                })?;
        }
        Ok(())
    }

    /// Combines head and tail into the final byte buffer, inserting a
    /// truncation banner if data was dropped, then UTF-8-validates the
    /// result. If invalid, the buffer is replaced by its lossy-decoded
    /// re-encoding plus a non-UTF-8 banner, and `has_non_utf8` is set.
    ///
    /// Idempotent: calling this twice on the same accumulated state
    /// yields identical bytes.
    pub fn finalize(&self) -> FinalizedOutput {
        let mut combined = BytesMut::with_capacity(
            self.head.len() + self.tail.len() + TRUNCATION_BANNER.len() + 2,
        );
        combined.extend_from_slice(&self.head);
        if self.dropped_any {
            if !combined.is_empty() {
                combined.extend_from_slice(b"\n");
            }
            combined.extend_from_slice(TRUNCATION_BANNER.as_bytes());
            combined.extend_from_slice(b"\n");
            // `tail` only gets re-trimmed down to TAIL_LENGTH once it
            // grows past 2 * TAIL_LENGTH (see push_tail), so it can still
            // be holding up to that much when finalize is called.
            let tail_start = self.tail.len().saturating_sub(TAIL_LENGTH);
            combined.extend_from_slice(&self.tail[tail_start..]);
        }

        match std::str::from_utf8(&combined) {
            Ok(_) => FinalizedOutput {
                bytes: combined.freeze(),
                has_non_utf8: false,
            },
            Err(_) => {
                let lossy = bstr::ByteSlice::to_str_lossy(&combined[..]).into_owned();
                let mut rewritten =
                    BytesMut::with_capacity(lossy.len() + NON_UTF8_BANNER.len() + 1);
                rewritten.extend_from_slice(lossy.as_bytes());
                rewritten.extend_from_slice(b"\n");
                rewritten.extend_from_slice(NON_UTF8_BANNER.as_bytes());
                FinalizedOutput {
                    bytes: rewritten.freeze(),
                    has_non_utf8: true,
                }
            }
        }
    }
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_output_round_trips_untruncated() {
        let mut log = OutputLog::new();
        log.append(b"hello world").await.unwrap();
        let out = log.finalize();
        assert_eq!(&out.bytes[..], b"hello world");
        assert!(!out.has_non_utf8);
    }

    #[tokio::test]
    async fn oversized_output_is_truncated_with_banner() {
        let mut log = OutputLog::new();
        log.append(&vec![b'a'; MAX_HEAD]).await.unwrap();
        log.append(b"middle-noise-that-gets-dropped").await.unwrap();
        log.append(b"tail-bytes").await.unwrap();

        let out = log.finalize();
        assert!(out.bytes.len() < MAX_HEAD + TAIL_LENGTH + 200);
        assert!(bstr::ByteSlice::contains_str(
            &out.bytes[..],
            "Data was removed due to excessive length"
        ));
        assert!(bstr::ByteSlice::ends_with_str(&out.bytes[..], "tail-bytes"));
    }

    #[tokio::test]
    async fn rolling_tail_keeps_only_the_last_tail_length_bytes() {
        let mut log = OutputLog::new();
        log.append(&vec![b'a'; MAX_HEAD]).await.unwrap();
        // Push enough tail data, in small chunks, to force several
        // rolling trims.
        for _ in 0..50 {
            log.append(&vec![b'b'; TAIL_LENGTH]).await.unwrap();
        }
        log.append(b"END").await.unwrap();

        assert!(log.captured_len() <= MAX_HEAD + 2 * TAIL_LENGTH);
        let out = log.finalize();
        assert!(bstr::ByteSlice::ends_with_str(&out.bytes[..], "END"));
    }

    #[tokio::test]
    async fn non_utf8_output_is_rewritten_with_banner() {
        let mut log = OutputLog::new();
        log.append(&[0xff, 0xfe, b'h', b'i']).await.unwrap();
        let out = log.finalize();
        assert!(out.has_non_utf8);
        assert!(std::str::from_utf8(&out.bytes).is_ok());
        assert!(bstr::ByteSlice::contains_str(
            &out.bytes[..],
            "non-UTF8 formatted data"
        ));
    }

    #[tokio::test]
    async fn finalize_never_carries_more_than_tail_length_of_tail() {
        let mut log = OutputLog::new();
        log.append(&vec![b'a'; MAX_HEAD]).await.unwrap();
        // One single chunk past MAX_HEAD, larger than TAIL_LENGTH but
        // under the rolling buffer's own 2 * TAIL_LENGTH re-trim point.
        log.append(&vec![b'b'; (TAIL_LENGTH * 3) / 2]).await.unwrap();

        let out = log.finalize();
        assert!(out.bytes.len() <= MAX_HEAD + TAIL_LENGTH + 200);
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let mut log = OutputLog::new();
        log.append(b"abc").await.unwrap();
        let first = log.finalize();
        let second = log.finalize();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn tee_writes_every_chunk_to_disk() {
        let dir = camino_tempfile();
        let path = dir.join("out.log");
        let mut log = OutputLog::with_tee(path.clone()).await.unwrap();
        log.append(b"one ").await.unwrap();
        log.append(b"two").await.unwrap();
        log.close().await.unwrap();

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(on_disk, "one two");
    }

    fn camino_tempfile() -> Utf8PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "harness-core-test-{}-{}",
            std::process::id(),
            n
        ));
        std::fs::create_dir_all(&dir).unwrap();
        Utf8PathBuf::from_path_buf(dir).unwrap()
    }
}
