//! The compress→encrypt pipe.
//!
//! One producer thread copies plaintext through the compressor and the
//! optional encryptor into a bounded in-memory pipe; the consumer reads the
//! other end. A failure at any layer closes the pipe with an error that the
//! consumer observes on its next read. Close order on success: compressor,
//! then encryptor, then the pipe itself.

use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use super::{decompression_reader, CompressionMethod, CompressionWriter};
use crate::crypto::Crypter;
use crate::logging::MetricsSink;
use crate::Result;

const PIPE_CHUNK: usize = 64 * 1024;
const PIPE_DEPTH: usize = 4;
const COPY_CHUNK: usize = 64 * 1024;

type Chunk = io::Result<Vec<u8>>;

pub struct PipeWriter {
    tx: SyncSender<Chunk>,
    buf: Vec<u8>,
}

/// Handle used to fail the pipe from outside the writer chain once the
/// writer itself has been consumed by the compressor/encryptor layers.
#[derive(Clone)]
pub struct PipeFailure {
    tx: SyncSender<Chunk>,
}

impl PipeFailure {
    pub fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err));
    }
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    current: Vec<u8>,
    pos: usize,
    failed: Option<(io::ErrorKind, String)>,
    eof: bool,
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = sync_channel(PIPE_DEPTH);
    (
        PipeWriter {
            tx,
            buf: Vec::with_capacity(PIPE_CHUNK),
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            failed: None,
            eof: false,
        },
    )
}

impl PipeWriter {
    pub fn failure_handle(&self) -> PipeFailure {
        PipeFailure {
            tx: self.tx.clone(),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(PIPE_CHUNK));
        self.tx
            .send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= PIPE_CHUNK {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            // Reader gone means nobody cares about the tail.
            match self.tx.try_send(Ok(chunk)) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(chunk)) => {
                    let _ = self.tx.send(chunk);
                }
            }
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if let Some((kind, message)) = &self.failed {
            return Err(io::Error::new(*kind, message.clone()));
        }
        loop {
            if self.pos < self.current.len() {
                let n = (self.current.len() - self.pos).min(out.len());
                out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = Some((err.kind(), err.to_string()));
                    return Err(err);
                }
                Err(_) => {
                    self.eof = true;
                    return Ok(0);
                }
            }
        }
    }
}

/// Count bytes leaving the compression layer.
pub(crate) struct CountingWriter<W: Write> {
    pub(crate) inner: W,
    pub(crate) metrics: Arc<MetricsSink>,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(data)?;
        self.metrics.add_compressed(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Compress (and optionally encrypt) `source` into a reader. The returned
/// reader must be drained or the producer blocks on pipe backpressure.
pub fn compress_and_encrypt(
    source: Box<dyn Read + Send>,
    method: CompressionMethod,
    crypter: Option<Arc<Crypter>>,
    metrics: Arc<MetricsSink>,
) -> PipeReader {
    let (writer, reader) = pipe();
    let failure = writer.failure_handle();
    thread::Builder::new()
        .name("compress-encrypt".into())
        .spawn(move || {
            if let Err(err) = pump(source, writer, method, crypter, metrics) {
                failure.fail(err);
            }
        })
        .expect("spawning the compression producer cannot fail");
    reader
}

fn pump(
    mut source: Box<dyn Read + Send>,
    writer: PipeWriter,
    method: CompressionMethod,
    crypter: Option<Arc<Crypter>>,
    metrics: Arc<MetricsSink>,
) -> io::Result<()> {
    let counting = CountingWriter {
        inner: writer,
        metrics: Arc::clone(&metrics),
    };
    match crypter {
        None => {
            let mut sink = copy_compressed(&mut *source, counting, method, &metrics)?;
            sink.flush()?;
        }
        Some(crypter) => {
            let encryptor = crypter
                .encrypt_writer(counting)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{e:#}")))?;
            let encryptor = copy_compressed(&mut *source, encryptor, method, &metrics)?;
            let mut sink = encryptor.finish()?;
            sink.flush()?;
        }
    }
    Ok(())
}

fn copy_compressed<W: Write>(
    source: &mut dyn Read,
    sink: W,
    method: CompressionMethod,
    metrics: &MetricsSink,
) -> io::Result<W> {
    let mut writer = CompressionWriter::new(method, sink)?;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        metrics.add_uncompressed(n as u64);
        writer.write_all(&buf[..n])?;
    }
    writer.finish()
}

/// Inverse of [`compress_and_encrypt`] for restores: decrypt, then
/// decompress.
pub fn decrypt_and_decompress(
    raw: Box<dyn Read + Send>,
    method: CompressionMethod,
    crypter: Option<&Crypter>,
) -> Result<Box<dyn Read + Send>> {
    let plaintext = match crypter {
        Some(crypter) => crypter.decrypt_reader(raw)?,
        None => raw,
    };
    Ok(decompression_reader(method, plaintext)?)
}
