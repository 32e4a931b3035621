//! Backpressured uploader with bounded retries and a write-once failure
//! latch.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::compress::CompressionMethod;
use crate::crypto::Crypter;
use crate::logging::MetricsSink;
use crate::storage::Folder;
use crate::sync::WaitGroup;
use crate::{Error, Result};

pub const UPLOAD_RETRIES: u32 = 3;

/// Shared by every producer of one backup or archive operation. The failure
/// latch flips once and is checked before the commit barrier (sentinel
/// upload).
pub struct Uploader {
    folder: Arc<dyn Folder>,
    compression: CompressionMethod,
    crypter: Option<Arc<Crypter>>,
    metrics: Arc<MetricsSink>,
    failed: Arc<AtomicBool>,
    size_tracking: AtomicBool,
    in_flight: WaitGroup,
}

impl Uploader {
    pub fn new(
        folder: Arc<dyn Folder>,
        compression: CompressionMethod,
        crypter: Option<Arc<Crypter>>,
        metrics: Arc<MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            folder,
            compression,
            crypter,
            metrics,
            failed: Arc::new(AtomicBool::new(false)),
            size_tracking: AtomicBool::new(true),
            in_flight: WaitGroup::new(),
        })
    }

    pub fn folder(&self) -> &Arc<dyn Folder> {
        &self.folder
    }

    pub fn compression(&self) -> CompressionMethod {
        self.compression
    }

    pub fn crypter(&self) -> Option<Arc<Crypter>> {
        self.crypter.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsSink> {
        Arc::clone(&self.metrics)
    }

    /// Same uploader aimed at another folder; latch and counters are shared.
    pub fn retarget(self: &Arc<Self>, folder: Arc<dyn Folder>) -> Arc<Self> {
        Arc::new(Self {
            folder,
            compression: self.compression,
            crypter: self.crypter.clone(),
            metrics: Arc::clone(&self.metrics),
            failed: Arc::clone(&self.failed),
            size_tracking: AtomicBool::new(self.size_tracking.load(Ordering::SeqCst)),
            in_flight: WaitGroup::new(),
        })
    }

    /// Detach the byte counter.
    pub fn disable_size_tracking(&self) {
        self.size_tracking.store(false, Ordering::SeqCst);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Upload one object, retrying transient failures. Exhausting the
    /// retries latches the uploader as failed.
    pub fn upload(&self, path: &str, content: &mut dyn Read) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=UPLOAD_RETRIES {
            match self.folder.put_object(path, content) {
                Ok(()) => {
                    if self.size_tracking.load(Ordering::SeqCst) {
                        self.metrics.add_uploaded_object();
                    }
                    return Ok(());
                }
                Err(err) => {
                    error!(path, attempt, "retrying upload error: {err:#}");
                    last_err = Some(err);
                }
            }
        }
        error!(path, "exhausted upload retries");
        self.failed.store(true, Ordering::SeqCst);
        Err(last_err.unwrap_or_else(|| {
            Error::UploadFailed {
                path: path.to_string(),
                attempts: UPLOAD_RETRIES,
            }
            .into()
        }))
    }

    /// Register background work with `finish`; the guard's drop marks it
    /// done.
    pub fn in_flight_guard(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.add();
        InFlightGuard {
            uploader: Arc::clone(self),
        }
    }

    /// Wait for in-flight uploads; aggregated pass/fail.
    pub fn finish(&self) -> Result<()> {
        self.in_flight.wait();
        if self.is_failed() {
            error!("could not complete upload");
            return Err(Error::UploadFailed {
                path: self.folder.describe(),
                attempts: UPLOAD_RETRIES,
            }
            .into());
        }
        Ok(())
    }
}

/// Keeps `Uploader::finish` waiting while background work is running.
pub struct InFlightGuard {
    uploader: Arc<Uploader>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.uploader.in_flight.done();
    }
}
