//! Tar partitions and the bounded queue that hands them to producers.
//!
//! A partition is one `part_NNN.tar.<ext>` object. The streaming variant
//! pipes tar bytes through compression and optional encryption straight
//! into an upload thread; the file variant writes a plain local tar; the
//! nop variant only accounts sizes. A dequeued partition belongs to exactly
//! one producer until it is enqueued back. Partitions open lazily on first
//! append, so a token that never sees data never becomes an object.
//!
//! One partition accumulates at a time; cutting it hands the upload to the
//! pending set (bounded by the upload concurrency) and circulates a fresh
//! token, so packing the next partition overlaps the uploads of its
//! predecessors.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::compress::pipe::{pipe, CountingWriter, PipeWriter};
use crate::compress::CompressionWriter;
use crate::storage::TAR_PARTITIONS_PATH;
use crate::sync::CancelToken;
use crate::upload::Uploader;
use crate::Result;

/// Writer chain under one streaming partition: tar bytes → compressor →
/// optional encryptor → pipe. Closed innermost-first.
enum SinkChain {
    Plain(CompressionWriter<CountingWriter<PipeWriter>>),
    Encrypted(CompressionWriter<age::stream::StreamWriter<CountingWriter<PipeWriter>>>),
}

struct PartitionSink {
    chain: SinkChain,
    tar_bytes: Arc<AtomicU64>,
}

impl Write for PartitionSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.chain {
            SinkChain::Plain(w) => w.write(buf)?,
            SinkChain::Encrypted(w) => w.write(buf)?,
        };
        self.tar_bytes.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.chain {
            SinkChain::Plain(w) => w.flush(),
            SinkChain::Encrypted(w) => w.flush(),
        }
    }
}

impl PartitionSink {
    /// Compressor close, then encryptor close, then pipe close (by drop).
    fn finish(self) -> io::Result<()> {
        match self.chain {
            SinkChain::Plain(compressor) => {
                let mut sink = compressor.finish()?;
                sink.flush()?;
            }
            SinkChain::Encrypted(compressor) => {
                let encryptor = compressor.finish()?;
                let mut sink = encryptor.finish()?;
                sink.flush()?;
            }
        }
        Ok(())
    }
}

/// In-flight upload of a sealed partition.
pub struct PendingUpload {
    name: String,
    join: JoinHandle<Result<()>>,
}

impl PendingUpload {
    pub fn wait(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| anyhow::anyhow!("upload of {} panicked", self.name))?
    }
}

struct StreamInner {
    builder: tar::Builder<PartitionSink>,
    upload: PendingUpload,
}

pub struct StreamTarBall {
    name: String,
    uploader: Arc<Uploader>,
    size: Arc<AtomicU64>,
    inner: Option<StreamInner>,
}

impl StreamTarBall {
    fn new(number: u32, uploader: Arc<Uploader>) -> Self {
        let name = format!(
            "part_{:03}.tar.{}",
            number,
            uploader.compression().extension()
        );
        Self {
            name,
            uploader,
            size: Arc::new(AtomicU64::new(0)),
            inner: None,
        }
    }

    fn open(&mut self) -> Result<&mut StreamInner> {
        if self.inner.is_none() {
            let (pipe_writer, mut pipe_reader) = pipe();
            let counting = CountingWriter {
                inner: pipe_writer,
                metrics: self.uploader.metrics(),
            };
            let chain = match self.uploader.crypter() {
                None => SinkChain::Plain(CompressionWriter::new(
                    self.uploader.compression(),
                    counting,
                )?),
                Some(crypter) => {
                    let encryptor = crypter.encrypt_writer(counting)?;
                    SinkChain::Encrypted(CompressionWriter::new(
                        self.uploader.compression(),
                        encryptor,
                    )?)
                }
            };
            let sink = PartitionSink {
                chain,
                tar_bytes: Arc::clone(&self.size),
            };
            let object_path = format!("{TAR_PARTITIONS_PATH}/{}", self.name);
            let uploader = Arc::clone(&self.uploader);
            let join = thread::Builder::new()
                .name(format!("upload-{}", self.name))
                .spawn(move || uploader.upload(&object_path, &mut pipe_reader))
                .expect("spawning a partition upload cannot fail");
            debug!(partition = %self.name, "partition opened");
            self.inner = Some(StreamInner {
                builder: tar::Builder::new(sink),
                upload: PendingUpload {
                    name: self.name.clone(),
                    join,
                },
            });
        }
        Ok(self.inner.as_mut().expect("just opened"))
    }

    /// Terminate the tar stream and the pipe; the upload keeps running and
    /// is returned for the queue's pending set. A never-opened partition
    /// seals to nothing.
    fn seal(self) -> Result<Option<PendingUpload>> {
        match self.inner {
            None => Ok(None),
            Some(inner) => {
                let sink = inner.builder.into_inner()?;
                sink.finish()?;
                Ok(Some(inner.upload))
            }
        }
    }
}

pub struct FileTarBall {
    name: String,
    builder: tar::Builder<File>,
    size: u64,
}

impl FileTarBall {
    fn create(number: u32, dir: &Path) -> Result<Self> {
        let name = format!("part_{number:03}.tar");
        let file = File::create(dir.join(&name))?;
        Ok(Self {
            name,
            builder: tar::Builder::new(file),
            size: 0,
        })
    }

    fn seal(self) -> Result<()> {
        let file = self.builder.into_inner()?;
        file.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NopTarBall {
    name: String,
    size: u64,
}

/// One tar partition in any of its three shapes.
pub enum TarBall {
    Stream(StreamTarBall),
    File(FileTarBall),
    Nop(NopTarBall),
}

impl std::fmt::Debug for TarBall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TarBall::Stream(b) => f.debug_tuple("Stream").field(&b.name).finish(),
            TarBall::File(b) => f.debug_tuple("File").field(&b.name).finish(),
            TarBall::Nop(b) => f.debug_tuple("Nop").field(b).finish(),
        }
    }
}

impl TarBall {
    pub fn name(&self) -> &str {
        match self {
            TarBall::Stream(b) => &b.name,
            TarBall::File(b) => &b.name,
            TarBall::Nop(b) => &b.name,
        }
    }

    /// Accumulated uncompressed tar bytes; drives the cut decision.
    pub fn size(&self) -> u64 {
        match self {
            TarBall::Stream(b) => b.size.load(Ordering::Relaxed),
            TarBall::File(b) => b.size,
            TarBall::Nop(b) => b.size,
        }
    }

    /// Append a regular entry. The header must carry the final size.
    pub fn append_regular(
        &mut self,
        header: &mut tar::Header,
        path: &Path,
        data: &mut dyn Read,
    ) -> Result<()> {
        match self {
            TarBall::Stream(b) => b.open()?.builder.append_data(header, path, data)?,
            TarBall::File(b) => {
                b.size += header.size()? + 512;
                b.builder.append_data(header, path, data)?;
            }
            TarBall::Nop(b) => {
                b.size += header.size()? + 512;
                io::copy(data, &mut io::sink())?;
            }
        }
        Ok(())
    }

    /// Append a directory or other bodyless entry.
    pub fn append_special(&mut self, header: &mut tar::Header, path: &Path) -> Result<()> {
        self.append_regular(header, path, &mut io::empty())
    }

    pub fn append_symlink(
        &mut self,
        header: &mut tar::Header,
        path: &Path,
        target: &Path,
    ) -> Result<()> {
        match self {
            TarBall::Stream(b) => b.open()?.builder.append_link(header, path, target)?,
            TarBall::File(b) => {
                b.size += 512;
                b.builder.append_link(header, path, target)?;
            }
            TarBall::Nop(b) => b.size += 512,
        }
        Ok(())
    }

    /// Close the tar stream; streaming partitions hand back their in-flight
    /// upload.
    pub fn seal(self) -> Result<Option<PendingUpload>> {
        match self {
            TarBall::Stream(b) => b.seal(),
            TarBall::File(b) => b.seal().map(|_| None),
            TarBall::Nop(_) => Ok(None),
        }
    }
}

/// Factory for the partition shape one operation uses.
pub enum TarBallMaker {
    Stream { uploader: Arc<Uploader> },
    File { dir: PathBuf },
    Nop,
}

impl TarBallMaker {
    pub fn make(&self, number: u32) -> Result<TarBall> {
        Ok(match self {
            TarBallMaker::Stream { uploader } => {
                TarBall::Stream(StreamTarBall::new(number, Arc::clone(uploader)))
            }
            TarBallMaker::File { dir } => TarBall::File(FileTarBall::create(number, dir)?),
            TarBallMaker::Nop => TarBall::Nop(NopTarBall {
                name: format!("part_{number:03}.tar"),
                size: 0,
            }),
        })
    }
}

const DEQUEUE_POLL: Duration = Duration::from_millis(50);

struct QueueState {
    available: VecDeque<TarBall>,
    pending: Vec<PendingUpload>,
}

/// Hands out the accumulating partition and keeps at most
/// `upload_concurrency` cut partitions uploading at once.
pub struct TarBallQueue {
    maker: TarBallMaker,
    upload_concurrency: usize,
    threshold: u64,
    cancel: CancelToken,
    state: Mutex<QueueState>,
    ready: Condvar,
    next_number: AtomicU32,
}

impl TarBallQueue {
    pub fn new(
        maker: TarBallMaker,
        upload_concurrency: usize,
        threshold: u64,
        cancel: CancelToken,
    ) -> Result<Self> {
        let queue = Self {
            maker,
            upload_concurrency: upload_concurrency.max(1),
            threshold,
            cancel,
            state: Mutex::new(QueueState {
                available: VecDeque::new(),
                pending: Vec::new(),
            }),
            ready: Condvar::new(),
            next_number: AtomicU32::new(1),
        };
        let first = queue.maker.make(queue.take_number())?;
        queue.state.lock().available.push_back(first);
        Ok(queue)
    }

    fn take_number(&self) -> u32 {
        self.next_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Block until the partition is free; respects cancellation.
    pub fn dequeue(&self) -> Result<TarBall> {
        let mut state = self.state.lock();
        loop {
            self.cancel.check()?;
            if let Some(ball) = state.available.pop_front() {
                return Ok(ball);
            }
            self.ready.wait_for(&mut state, DEQUEUE_POLL);
        }
    }

    /// Return a partition; cut it instead when it crossed the size
    /// threshold.
    pub fn enqueue_back(&self, ball: TarBall) -> Result<()> {
        let ball = if ball.size() >= self.threshold {
            info!(partition = ball.name(), bytes = ball.size(), "cutting partition");
            let pending = ball.seal()?;
            let fresh = self.maker.make(self.take_number())?;
            let mut state = self.state.lock();
            if let Some(pending) = pending {
                state.pending.push(pending);
            }
            // Bound in-flight uploads to the configured concurrency.
            while state.pending.len() > self.upload_concurrency {
                let oldest = state.pending.remove(0);
                drop(state);
                oldest.wait()?;
                state = self.state.lock();
            }
            drop(state);
            fresh
        } else {
            ball
        };
        self.state.lock().available.push_back(ball);
        self.ready.notify_one();
        Ok(())
    }

    /// Seal every remaining partition, newest first, and wait for all
    /// uploads. Errors are collected, not hidden behind the first one.
    pub fn close_all(self) -> Result<()> {
        let state = self.state.into_inner();
        let mut pending = state.pending;
        let mut available = state.available;
        let mut first_error = None;

        while let Some(ball) = available.pop_back() {
            debug!(partition = ball.name(), bytes = ball.size(), "sealing partition");
            match ball.seal() {
                Ok(Some(upload)) => pending.push(upload),
                Ok(None) => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        for upload in pending {
            if let Err(err) = upload.wait() {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
