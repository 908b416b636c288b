//! Per-object output stream.

use crate::config::IoConfig;
use bytes::{Buf, Bytes};
use std::any::Any;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Value released once the chunk it travels with is fully written.
pub type Guard = Box<dyn Any + Send>;

pub(crate) enum Chunk {
    Bytes {
        data: Bytes,
        _guard: Option<Guard>,
    },
    File {
        file: File,
        offset: u64,
        remaining: u64,
        pending: Bytes,
    },
}

#[derive(Default)]
pub(crate) struct OutputStream {
    chunks: VecDeque<Chunk>,
    backlog: usize,
}

impl OutputStream {
    pub(crate) fn push_bytes(&mut self, data: Bytes, guard: Option<Guard>) {
        self.backlog += data.len();
        self.chunks.push_back(Chunk::Bytes {
            data,
            _guard: guard,
        });
    }

    pub(crate) fn push_file(&mut self, file: File, offset: u64, len: u64) {
        self.backlog = self.backlog.saturating_add(len as usize);
        self.chunks.push_back(Chunk::File {
            file,
            offset,
            remaining: len,
            pending: Bytes::new(),
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes still waiting to be written.
    pub(crate) fn backlog(&self) -> usize {
        self.backlog
    }

    /// Write queued chunks through `write` until it would block or the
    /// stream is empty. Completed chunks are moved to `finished` so their
    /// guards can be dropped outside any lock.
    pub(crate) fn drain<W>(&mut self, mut write: W, finished: &mut Vec<Chunk>) -> io::Result<usize>
    where
        W: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut total = 0;
        while let Some(front) = self.chunks.front_mut() {
            let data = match front {
                Chunk::Bytes { data, .. } => data,
                Chunk::File {
                    file,
                    offset,
                    remaining,
                    pending,
                } => {
                    if pending.is_empty() && *remaining > 0 {
                        let want = (*remaining).min(IoConfig::FILE_CHUNK_SIZE as u64) as usize;
                        let mut buf = vec![0u8; want];
                        let n = file.read_at(&mut buf, *offset)?;
                        if n == 0 {
                            // File shrank underneath us.
                            self.backlog = self.backlog.saturating_sub(*remaining as usize);
                            *remaining = 0;
                        } else {
                            buf.truncate(n);
                            *offset += n as u64;
                            *remaining -= n as u64;
                            *pending = Bytes::from(buf);
                        }
                    }
                    pending
                }
            };

            if data.is_empty() {
                let done = matches!(front, Chunk::Bytes { .. })
                    || matches!(front, Chunk::File { remaining: 0, .. });
                if done {
                    if let Some(chunk) = self.chunks.pop_front() {
                        finished.push(chunk);
                    }
                }
                continue;
            }

            match write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    data.advance(n);
                    self.backlog = self.backlog.saturating_sub(n);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Remove every chunk, releasing nothing yet.
    pub(crate) fn take(&mut self) -> VecDeque<Chunk> {
        self.backlog = 0;
        std::mem::take(&mut self.chunks)
    }
}
