use crate::ids::{ContentId, PlaceholderId, TitleId};
use crate::ncm::{
    ContentMetaDb, ContentMetaKey, ContentMetaType, ContentStorage, InstallType, IoSnafu,
    StoreError, TicketStore,
};
use binrw::{BinReaderExt, BinWriterExt};
use itertools::Itertools;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Directory-backed content store: placeholders accumulate under
/// `placeholder/`, registration renames them into `registered/`.
pub struct FsContentStorage {
    root: PathBuf,
    next_placeholder: AtomicU64,
}

impl FsContentStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("placeholder")).context(IoSnafu)?;
        std::fs::create_dir_all(root.join("registered")).context(IoSnafu)?;
        Ok(Self {
            root,
            next_placeholder: AtomicU64::new(1),
        })
    }

    fn placeholder_path(&self, placeholder_id: PlaceholderId) -> PathBuf {
        self.root
            .join("placeholder")
            .join(format!("{}.nca", placeholder_id))
    }

    fn content_path(&self, content_id: ContentId) -> PathBuf {
        self.root
            .join("registered")
            .join(format!("{}.nca", content_id))
    }

    fn open_placeholder(&self, placeholder_id: PlaceholderId) -> Result<File, StoreError> {
        OpenOptions::new()
            .write(true)
            .open(self.placeholder_path(placeholder_id))
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StoreError::PlaceholderNotFound { placeholder_id }
                } else {
                    StoreError::Io { source: e }
                }
            })
    }
}

impl ContentStorage for FsContentStorage {
    fn generate_placeholder_id(&self) -> Result<PlaceholderId, StoreError> {
        let n = self.next_placeholder.fetch_add(1, Ordering::Relaxed);
        let mut id = [0u8; 0x10];
        id[..8].copy_from_slice(&(std::process::id() as u64).to_be_bytes());
        id[8..].copy_from_slice(&n.to_be_bytes());
        Ok(PlaceholderId(id))
    }

    fn create_placeholder(
        &self,
        _content_id: ContentId,
        placeholder_id: PlaceholderId,
        size: u64,
    ) -> Result<(), StoreError> {
        let file = File::create(self.placeholder_path(placeholder_id)).context(IoSnafu)?;
        file.set_len(size).context(IoSnafu)?;
        Ok(())
    }

    fn set_placeholder_size(
        &self,
        placeholder_id: PlaceholderId,
        size: u64,
    ) -> Result<(), StoreError> {
        self.open_placeholder(placeholder_id)?
            .set_len(size)
            .context(IoSnafu)
    }

    fn write_placeholder(
        &self,
        placeholder_id: PlaceholderId,
        offset: u64,
        buf: &[u8],
    ) -> Result<(), StoreError> {
        let mut file = self.open_placeholder(placeholder_id)?;
        file.seek(SeekFrom::Start(offset)).context(IoSnafu)?;
        file.write_all(buf).context(IoSnafu)
    }

    fn flush_placeholder(&self) -> Result<(), StoreError> {
        // writes go straight to the filesystem, nothing to flush
        Ok(())
    }

    fn get_placeholder_path(&self, placeholder_id: PlaceholderId) -> Result<PathBuf, StoreError> {
        let path = self.placeholder_path(placeholder_id);
        if !path.exists() {
            return Err(StoreError::PlaceholderNotFound { placeholder_id });
        }
        Ok(path)
    }

    fn delete_placeholder(&self, placeholder_id: PlaceholderId) -> Result<(), StoreError> {
        std::fs::remove_file(self.placeholder_path(placeholder_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::PlaceholderNotFound { placeholder_id }
            } else {
                StoreError::Io { source: e }
            }
        })
    }

    fn register(
        &self,
        content_id: ContentId,
        placeholder_id: PlaceholderId,
    ) -> Result<(), StoreError> {
        debug!("registering {} as {}", placeholder_id, content_id);
        let from = self.get_placeholder_path(placeholder_id)?;
        std::fs::rename(from, self.content_path(content_id)).context(IoSnafu)
    }

    fn has(&self, content_id: ContentId) -> Result<bool, StoreError> {
        Ok(self.content_path(content_id).exists())
    }

    fn read_content(
        &self,
        content_id: ContentId,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StoreError> {
        let mut file = File::open(self.content_path(content_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::ContentNotFound { content_id }
            } else {
                StoreError::Io { source: e }
            }
        })?;
        file.seek(SeekFrom::Start(offset)).context(IoSnafu)?;

        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..]).context(IoSnafu)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn get_content_path(&self, content_id: ContentId) -> Result<PathBuf, StoreError> {
        let path = self.content_path(content_id);
        if !path.exists() {
            return Err(StoreError::ContentNotFound { content_id });
        }
        Ok(path)
    }

    fn delete(&self, content_id: ContentId) -> Result<(), StoreError> {
        std::fs::remove_file(self.content_path(content_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::ContentNotFound { content_id }
            } else {
                StoreError::Io { source: e }
            }
        })
    }
}

/// Directory-backed meta database. Mutations are staged in memory and only
/// land on disk at `commit`, mirroring the service's transactional surface.
pub struct FsMetaDb {
    root: PathBuf,
    staged: Mutex<HashMap<ContentMetaKey, Option<Vec<u8>>>>,
}

impl FsMetaDb {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).context(IoSnafu)?;
        Ok(Self {
            root,
            staged: Mutex::new(HashMap::new()),
        })
    }

    fn record_path(&self, key: ContentMetaKey) -> PathBuf {
        let mut encoded = Cursor::new(Vec::with_capacity(0x10));
        encoded
            .write_le(&key)
            .expect("BUG: meta key must serialize into 0x10 bytes");
        self.root
            .join(format!("{}.meta", hex::encode(encoded.into_inner())))
    }

    fn parse_record_name(name: &str) -> Option<ContentMetaKey> {
        let stem = name.strip_suffix(".meta")?;
        let bytes = hex::decode(stem).ok()?;
        Cursor::new(bytes).read_le().ok()
    }
}

impl ContentMetaDb for FsMetaDb {
    fn list(
        &self,
        ty: Option<ContentMetaType>,
        application_id: TitleId,
        id_range: (TitleId, TitleId),
        install_type: InstallType,
    ) -> Result<Vec<ContentMetaKey>, StoreError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root).context(IoSnafu)? {
            let entry = entry.context(IoSnafu)?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(Self::parse_record_name) else {
                continue;
            };

            if let Some(ty) = ty {
                if key.ty != ty {
                    continue;
                }
            }
            if key.application_id() != application_id {
                continue;
            }
            if key.id < id_range.0 || key.id > id_range.1 {
                continue;
            }
            if key.install_type != install_type {
                continue;
            }
            keys.push(key);
        }
        Ok(keys
            .into_iter()
            .sorted_by_key(|k| (k.id, k.version))
            .collect())
    }

    fn get(&self, key: ContentMetaKey) -> Result<Vec<u8>, StoreError> {
        std::fs::read(self.record_path(key)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::MetaNotFound { key }
            } else {
                StoreError::Io { source: e }
            }
        })
    }

    fn has(&self, key: ContentMetaKey) -> Result<bool, StoreError> {
        Ok(self.record_path(key).exists())
    }

    fn set(&self, key: ContentMetaKey, blob: &[u8]) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().expect("BUG: meta db mutex poisoned");
        staged.insert(key, Some(blob.to_vec()));
        Ok(())
    }

    fn remove(&self, key: ContentMetaKey) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().expect("BUG: meta db mutex poisoned");
        staged.insert(key, None);
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        let mut staged = self.staged.lock().expect("BUG: meta db mutex poisoned");
        for (key, op) in staged.drain() {
            let path = self.record_path(key);
            match op {
                Some(blob) => std::fs::write(path, blob).context(IoSnafu)?,
                None => match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StoreError::Io { source: e }),
                },
            }
        }
        Ok(())
    }
}

/// Writes imported tickets and certs next to each other in one directory.
pub struct FsTicketStore {
    root: PathBuf,
    next: AtomicU64,
}

impl FsTicketStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).context(IoSnafu)?;
        Ok(Self {
            root,
            next: AtomicU64::new(0),
        })
    }
}

impl TicketStore for FsTicketStore {
    fn import_ticket(&self, ticket: &[u8], cert: &[u8]) -> Result<(), StoreError> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        std::fs::write(self.root.join(format!("{n:04}.tik")), ticket).context(IoSnafu)?;
        std::fs::write(self.root.join(format!("{n:04}.cert")), cert).context(IoSnafu)?;
        Ok(())
    }
}
