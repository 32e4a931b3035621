//! In-memory [`Folder`] with failure injection, used by tests to exercise
//! retry and latch behavior without touching a real store.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::{Folder, ObjectInfo};
use crate::Result;

#[derive(Debug, Clone)]
struct ObjectRecord {
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct Inner {
    objects: Mutex<BTreeMap<String, ObjectRecord>>,
    // Deterministic modification ordering for LATEST resolution in tests.
    clock: AtomicU64,
    fail_next_puts: AtomicUsize,
    put_attempts: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFolder {
    inner: Arc<Inner>,
    prefix: String,
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Make the next `count` put attempts fail with a transient I/O error.
    pub fn fail_next_puts(&self, count: usize) {
        self.inner.fail_next_puts.store(count, Ordering::SeqCst);
    }

    /// Total put attempts observed, successful or not.
    pub fn put_attempts(&self) -> usize {
        self.inner.put_attempts.load(Ordering::SeqCst)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.inner.objects.lock().keys().cloned().collect()
    }
}

impl Folder for MemoryFolder {
    fn describe(&self) -> String {
        format!("memory://{}", self.prefix)
    }

    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()> {
        self.inner.put_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.inner.fail_next_puts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .fail_next_puts
                .store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::Other, "injected put failure").into());
        }

        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let tick = self.inner.clock.fetch_add(1, Ordering::SeqCst);
        self.inner.objects.lock().insert(
            self.full_key(name),
            ObjectRecord {
                data,
                modified: UNIX_EPOCH + Duration::from_secs(tick),
            },
        );
        Ok(())
    }

    fn get_object(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let key = self.full_key(name);
        let objects = self.inner.objects.lock();
        match objects.get(&key) {
            Some(record) => Ok(Box::new(Cursor::new(record.data.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, key).into()),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .objects
            .lock()
            .contains_key(&self.full_key(name)))
    }

    fn list(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let mut objects = Vec::new();
        let mut subfolders = Vec::new();
        for (key, record) in self.inner.objects.lock().iter() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                None => objects.push(ObjectInfo {
                    name: rest.to_string(),
                    last_modified: record.modified,
                    size: record.data.len() as u64,
                }),
                Some((folder, _)) => {
                    let folder = folder.to_string();
                    if !subfolders.contains(&folder) {
                        subfolders.push(folder);
                    }
                }
            }
        }
        Ok((objects, subfolders))
    }

    fn list_recursively(&self) -> Result<Vec<ObjectInfo>> {
        let prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let objects = self
            .inner
            .objects
            .lock()
            .iter()
            .filter_map(|(key, record)| {
                key.strip_prefix(&prefix).map(|rest| ObjectInfo {
                    name: rest.to_string(),
                    last_modified: record.modified,
                    size: record.data.len() as u64,
                })
            })
            .collect();
        Ok(objects)
    }

    fn delete_objects(&self, names: &[String]) -> Result<()> {
        let mut objects = self.inner.objects.lock();
        for name in names {
            objects.remove(&self.full_key(name));
        }
        Ok(())
    }

    fn sub_folder(&self, name: &str) -> Arc<dyn Folder> {
        Arc::new(Self {
            inner: Arc::clone(&self.inner),
            prefix: self.full_key(name),
        })
    }
}
