//! Logging initialization using `tracing` and `tracing-subscriber`, plus the
//! transfer metrics sink shared by the compression pipe and the uploader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Initialize global tracing subscriber. Safe to call multiple times;
/// subsequent calls will no-op.
pub fn init_logging() -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(true);

    let _ = builder.finish().try_init();
    Ok(())
}

/// Byte counters threaded through the compression pipe and the uploader.
/// Passed explicitly into components; there is no process-wide instance.
#[derive(Debug, Default)]
pub struct MetricsSink {
    uncompressed_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
    uploaded_objects: AtomicU64,
}

/// Point-in-time copy of [`MetricsSink`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub uploaded_objects: u64,
}

impl MetricsSink {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_uncompressed(&self, bytes: u64) {
        self.uncompressed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_compressed(&self, bytes: u64) {
        self.compressed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded_object(&self) {
        self.uploaded_objects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            uncompressed_bytes: self.uncompressed_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
            uploaded_objects: self.uploaded_objects.load(Ordering::Relaxed),
        }
    }
}

/// Emit transfer counters once a backup or archive operation completes.
pub fn log_transfer_metrics(snapshot: TransferSnapshot) {
    info!(
        target = "walvault::transfer",
        uncompressed_bytes = snapshot.uncompressed_bytes,
        compressed_bytes = snapshot.compressed_bytes,
        uploaded_objects = snapshot.uploaded_objects,
        "transfer_metrics"
    );
}
