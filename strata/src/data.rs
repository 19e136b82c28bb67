// Resource data providers
//
// A DataSource turns a ResourceId into a readable, seekable stream of the
// resource's blob. FileDatabase reads blobs from a directory indexed by a
// JSON database file, MemorySource serves blobs held in memory.
use crate::resource::ResourceId;
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Name of the database file inside a data directory
pub const DATABASE_FILE: &str = "data.db";

pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

pub trait DataSource: Send + Sync {
    /// Open the blob for `id`, positioned at its start
    fn open(&self, id: ResourceId) -> Result<Box<dyn ReadSeek>>;

    fn contains(&self, id: ResourceId) -> bool;
}

#[derive(Serialize, Deserialize)]
struct DatabaseEntry {
    guid: ResourceId,
    path: String,
}

#[derive(Serialize, Deserialize)]
struct DatabaseFile {
    #[serde(rename = "type")]
    ty: String,
    database: Vec<DatabaseEntry>,
}

/// Blobs stored as files in a directory
///
/// `data.db` looks like
/// `{"type": "database", "database": [{"guid": "...", "path": "mesh.bin"}]}`
/// with paths relative to the directory.
pub struct FileDatabase {
    fd_root: PathBuf,
    fd_entries: RwLock<HashMap<ResourceId, String>>,
}

impl FileDatabase {
    /// Load the database in `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let file = File::open(root.join(DATABASE_FILE))?;
        let db: DatabaseFile = serde_json::from_reader(BufReader::new(file))?;

        if db.ty != "database" {
            return Err(StrataError::INVALID_BLOB(format!(
                "{} has type \"{}\"",
                DATABASE_FILE, db.ty
            )));
        }

        let entries = db
            .database
            .into_iter()
            .map(|e| (e.guid, e.path))
            .collect();

        Ok(Self {
            fd_root: root,
            fd_entries: RwLock::new(entries),
        })
    }

    /// An empty database rooted at `dir`, nothing is written until `save`
    pub fn empty<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            fd_root: dir.as_ref().to_path_buf(),
            fd_entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register the file `path` (relative to the root) as `id`
    pub fn add(&self, id: ResourceId, path: &str) {
        self.fd_entries
            .write()
            .unwrap()
            .insert(id, path.to_string());
    }

    /// Write the database file back to the directory
    pub fn save(&self) -> Result<()> {
        let entries = self.fd_entries.read().unwrap();
        let mut database: Vec<DatabaseEntry> = entries
            .iter()
            .map(|(id, path)| DatabaseEntry {
                guid: *id,
                path: path.clone(),
            })
            .collect();
        database.sort_by(|a, b| a.path.cmp(&b.path));

        let file = File::create(self.fd_root.join(DATABASE_FILE))?;
        serde_json::to_writer_pretty(
            file,
            &DatabaseFile {
                ty: "database".to_string(),
                database: database,
            },
        )?;

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.fd_root
    }

    /// Full path of the blob for `id`
    pub fn path_of(&self, id: ResourceId) -> Option<PathBuf> {
        self.fd_entries
            .read()
            .unwrap()
            .get(&id)
            .map(|p| self.fd_root.join(p))
    }

    /// Every registered id
    pub fn ids(&self) -> Vec<ResourceId> {
        self.fd_entries.read().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.fd_entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataSource for FileDatabase {
    fn open(&self, id: ResourceId) -> Result<Box<dyn ReadSeek>> {
        let path = self
            .path_of(id)
            .ok_or(StrataError::RESOURCE_NOT_FOUND(id))?;
        let file = File::open(path)?;

        Ok(Box::new(BufReader::new(file)))
    }

    fn contains(&self, id: ResourceId) -> bool {
        self.fd_entries.read().unwrap().contains_key(&id)
    }
}

/// Blobs held in memory
pub struct MemorySource {
    ms_blobs: RwLock<HashMap<ResourceId, Arc<[u8]>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            ms_blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: ResourceId, blob: Vec<u8>) {
        self.ms_blobs.write().unwrap().insert(id, blob.into());
    }

    /// Store `blob` under its content derived id and return the id
    pub fn insert_content(&self, blob: Vec<u8>) -> ResourceId {
        let id = ResourceId::from_content(&blob);
        self.insert(id, blob);
        id
    }

    pub fn remove(&self, id: ResourceId) -> bool {
        self.ms_blobs.write().unwrap().remove(&id).is_some()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSource for MemorySource {
    fn open(&self, id: ResourceId) -> Result<Box<dyn ReadSeek>> {
        let blob = self
            .ms_blobs
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StrataError::RESOURCE_NOT_FOUND(id))?;

        Ok(Box::new(Cursor::new(blob)))
    }

    fn contains(&self, id: ResourceId) -> bool {
        self.ms_blobs.read().unwrap().contains_key(&id)
    }
}
