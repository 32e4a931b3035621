//! WAL tail reader: follows the cluster's WAL directory for the duration of
//! one backup, feeding closed segments through the parser into a delta map.

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::pg::{segment_start_lsn, wal_segment_name, Lsn, TimelineId};
use crate::sync::CancelToken;
use crate::{Error, Result};

use super::{DeltaMap, WalStreamParser};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct WalTailReader {
    pub wal_dir: PathBuf,
    pub timeline: TimelineId,
    pub wal_segment_size: u64,
    pub cancel: CancelToken,
}

pub struct WalTailHandle {
    stop_tx: Sender<Lsn>,
    join: JoinHandle<Result<DeltaMap>>,
}

impl WalTailReader {
    /// Start following WAL from the segment containing `start_lsn`.
    pub fn spawn(self, start_lsn: Lsn) -> WalTailHandle {
        let (stop_tx, stop_rx) = channel();
        let join = thread::Builder::new()
            .name("wal-tail".into())
            .spawn(move || self.run(start_lsn, stop_rx))
            .expect("spawning the wal tail reader cannot fail");
        WalTailHandle { stop_tx, join }
    }

    fn run(self, start_lsn: Lsn, stop_rx: Receiver<Lsn>) -> Result<DeltaMap> {
        let size = self.wal_segment_size;
        let mut parser = WalStreamParser::new(size);
        let mut map = DeltaMap::new();
        let mut segment_no = start_lsn.segment_no(size);
        let mut stop: Option<Lsn> = None;

        loop {
            self.cancel.check()?;
            if stop.is_none() {
                match stop_rx.try_recv() {
                    Ok(lsn) => stop = Some(lsn),
                    Err(TryRecvError::Empty) => {}
                    // Coordinator dropped the handle: abort.
                    Err(TryRecvError::Disconnected) => return Err(Error::Cancelled.into()),
                }
            }
            if let Some(stop_lsn) = stop {
                if segment_start_lsn(segment_no, size) >= stop_lsn {
                    break;
                }
            }

            let segment_start = segment_start_lsn(segment_no, size);
            let segment_end = Lsn(segment_start.0 + size);
            let name = wal_segment_name(self.timeline, segment_no, size);
            let path = self.wal_dir.join(&name);
            let next_exists = self
                .wal_dir
                .join(wal_segment_name(self.timeline, segment_no + 1, size))
                .exists();
            let stop_inside = stop.is_some_and(|s| s <= segment_end);

            if !path.exists() {
                if stop.is_some() {
                    warn!(segment = %name, "wal segment vanished before it was parsed");
                    map.mark_incomplete();
                    break;
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            if !next_exists && !stop_inside {
                // Segment still being written and the backup is not over.
                thread::sleep(POLL_INTERVAL);
                continue;
            }

            let data = match fs::read(&path) {
                Ok(data) if data.len() == size as usize => data,
                Ok(data) => {
                    warn!(segment = %name, bytes = data.len(), "short wal segment");
                    map.mark_incomplete();
                    break;
                }
                Err(err) => {
                    warn!(segment = %name, "could not read wal segment: {err}");
                    map.mark_incomplete();
                    break;
                }
            };
            match parser.parse_segment(segment_start, &data) {
                Ok(records) => {
                    for record in records {
                        let in_window = record.lsn >= start_lsn
                            && stop.map_or(true, |stop_lsn| record.lsn < stop_lsn);
                        if in_window {
                            map.absorb_record(&record);
                        }
                    }
                }
                Err(err) => {
                    // An unattributable stream is fatal; damage is only a
                    // lost narrowing opportunity.
                    if matches!(err.downcast_ref::<Error>(), Some(Error::UnknownRm(_))) {
                        return Err(err);
                    }
                    warn!(segment = %name, "wal parse failed: {err}");
                    map.mark_incomplete();
                    break;
                }
            }
            debug!(segment = %name, relations = map.relation_count(), "wal segment folded");
            segment_no += 1;
        }
        Ok(map)
    }
}

impl WalTailHandle {
    /// Signal the finish LSN and wait for the reader to drain up to it.
    pub fn finish(self, stop_lsn: Lsn) -> Result<DeltaMap> {
        let _ = self.stop_tx.send(stop_lsn);
        self.join
            .join()
            .map_err(|_| anyhow::anyhow!("wal tail reader panicked"))?
    }

    /// Abandon the reader on the abort path.
    pub fn abort(self) {
        drop(self.stop_tx);
        let _ = self.join.join();
    }
}
