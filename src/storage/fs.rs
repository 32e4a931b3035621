//! Filesystem-backed [`Folder`], the adapter behind `WALG_FILE_PREFIX`.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Folder, ObjectInfo};
use crate::Result;

#[derive(Debug, Clone)]
pub struct FsFolder {
    root: PathBuf,
}

impl FsFolder {
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Folder for FsFolder {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn put_object(&self, name: &str, content: &mut dyn Read) -> Result<()> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        io::copy(content, &mut file)?;
        file.sync_all()?;
        Ok(())
    }

    fn get_object(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let file = File::open(self.object_path(name))?;
        Ok(Box::new(file))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.object_path(name).is_file())
    }

    fn list(&self) -> Result<(Vec<ObjectInfo>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut subfolders = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok((objects, subfolders))
            }
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                subfolders.push(name);
            } else {
                objects.push(ObjectInfo {
                    name,
                    last_modified: meta.modified()?,
                    size: meta.len(),
                });
            }
        }
        Ok((objects, subfolders))
    }

    fn list_recursively(&self) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        if !self.root.is_dir() {
            return Ok(objects);
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .expect("walked path is under root")
                .to_string_lossy()
                .into_owned();
            objects.push(ObjectInfo {
                name: relative,
                last_modified: meta.modified()?,
                size: meta.len(),
            });
        }
        Ok(objects)
    }

    fn delete_objects(&self, names: &[String]) -> Result<()> {
        for name in names {
            match fs::remove_file(self.object_path(name)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn sub_folder(&self, name: &str) -> Arc<dyn Folder> {
        Arc::new(Self {
            root: self.root.join(name),
        })
    }
}
