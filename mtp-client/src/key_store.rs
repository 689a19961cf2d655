//! Persisted auth keys.
//!
//! The [`KeyStore`] trait is the only way connections read or write keys,
//! so callers can put them anywhere. Built-in stores:
//! * [`InMemoryKeyStore`]: nothing touches disk.
//! * [`FileKeyStore`]: one small binary file.
//! * `SqliteKeyStore`: SQLite (requires the `sqlite-keys` Cargo feature).

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::sync::Mutex;

use mtp_crypto::AuthKey;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Where auth keys live between runs, one per DC.
///
/// Implementations must tolerate concurrent calls for different DCs.
pub trait KeyStore: Send + Sync {
    /// The stored key for `dc_id`.
    fn get(&self, dc_id: i32) -> io::Result<Option<AuthKey>>;

    /// Store `key` for `dc_id`, replacing any previous one.
    fn set(&self, dc_id: i32, key: &AuthKey) -> io::Result<()>;

    /// Forget the key for `dc_id`.
    fn erase(&self, dc_id: i32) -> io::Result<()>;

    /// Human-readable name of this store (for log messages).
    fn name(&self) -> &str;
}

fn poisoned() -> io::Error {
    io::Error::new(ErrorKind::Other, "key store lock poisoned")
}

// ─── InMemoryKeyStore ────────────────────────────────────────────────────────

/// Keys that live as long as the process.
#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: Mutex<BTreeMap<i32, AuthKey>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self { Self::default() }
}

impl KeyStore for InMemoryKeyStore {
    fn get(&self, dc_id: i32) -> io::Result<Option<AuthKey>> {
        Ok(self.keys.lock().map_err(|_| poisoned())?.get(&dc_id).cloned())
    }

    fn set(&self, dc_id: i32, key: &AuthKey) -> io::Result<()> {
        self.keys.lock().map_err(|_| poisoned())?.insert(dc_id, key.clone());
        Ok(())
    }

    fn erase(&self, dc_id: i32) -> io::Result<()> {
        self.keys.lock().map_err(|_| poisoned())?.remove(&dc_id);
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── FileKeyStore ────────────────────────────────────────────────────────────

const FILE_MAGIC: &[u8; 4] = b"MTPK";
const FILE_VERSION: u8 = 1;
const ENTRY_LEN: usize = 4 + 256;

/// All keys in one binary file.
///
/// Layout: `"MTPK" ‖ version:u8 ‖ count:u8 ‖ (dc_id:i32le ‖ key:256)*`.
/// The whole file is rewritten through a temporary on every change.
pub struct FileKeyStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    fn read_all(&self) -> io::Result<BTreeMap<i32, [u8; 256]>> {
        let buf = match std::fs::read(&self.path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        decode_file(&buf).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidData, format!("{} is not a key file", self.path.display()))
        })
    }

    fn write_all(&self, keys: &BTreeMap<i32, [u8; 256]>) -> io::Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, encode_file(keys))?;
        std::fs::rename(&tmp, &self.path)
    }
}

fn encode_file(keys: &BTreeMap<i32, [u8; 256]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + keys.len() * ENTRY_LEN);
    buf.extend_from_slice(FILE_MAGIC);
    buf.push(FILE_VERSION);
    buf.push(keys.len() as u8);
    for (dc_id, key) in keys {
        buf.extend(dc_id.to_le_bytes());
        buf.extend_from_slice(key);
    }
    buf
}

fn decode_file(buf: &[u8]) -> Option<BTreeMap<i32, [u8; 256]>> {
    let (header, body) = buf.split_at_checked(6)?;
    if &header[..4] != FILE_MAGIC || header[4] != FILE_VERSION {
        return None;
    }
    let count = header[5] as usize;
    if body.len() != count * ENTRY_LEN {
        return None;
    }
    body.chunks_exact(ENTRY_LEN)
        .map(|entry| {
            let dc_id = i32::from_le_bytes(entry[..4].try_into().ok()?);
            let key: [u8; 256] = entry[4..].try_into().ok()?;
            Some((dc_id, key))
        })
        .collect()
}

impl KeyStore for FileKeyStore {
    fn get(&self, dc_id: i32) -> io::Result<Option<AuthKey>> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        Ok(self.read_all()?.get(&dc_id).map(|&data| AuthKey::new(dc_id, data)))
    }

    fn set(&self, dc_id: i32, key: &AuthKey) -> io::Result<()> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut keys = self.read_all()?;
        keys.insert(dc_id, key.to_bytes());
        if keys.len() > u8::MAX as usize {
            return Err(io::Error::new(ErrorKind::InvalidInput, "too many DCs for one key file"));
        }
        self.write_all(&keys)
    }

    fn erase(&self, dc_id: i32) -> io::Result<()> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut keys = self.read_all()?;
        if keys.remove(&dc_id).is_some() {
            self.write_all(&keys)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── SqliteKeyStore ──────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-keys")]
pub use sqlite_store::SqliteKeyStore;

#[cfg(feature = "sqlite-keys")]
mod sqlite_store {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    fn sql_err(e: rusqlite::Error) -> io::Error {
        io::Error::new(ErrorKind::Other, e)
    }

    /// Keys in an SQLite table `auth_keys (dc_id, auth_key)`.
    ///
    /// Enable with the `sqlite-keys` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// mtp-client = { version = "*", features = ["sqlite-keys"] }
    /// ```
    pub struct SqliteKeyStore {
        conn: Mutex<Connection>,
    }

    impl SqliteKeyStore {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let conn = Connection::open(path.into()).map_err(sql_err)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS auth_keys (
                    dc_id    INTEGER PRIMARY KEY,
                    auth_key BLOB    NOT NULL
                );",
            ).map_err(sql_err)?;
            Ok(Self { conn: Mutex::new(conn) })
        }
    }

    impl KeyStore for SqliteKeyStore {
        fn get(&self, dc_id: i32) -> io::Result<Option<AuthKey>> {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            let blob: Option<Vec<u8>> = conn
                .query_row("SELECT auth_key FROM auth_keys WHERE dc_id = ?1", params![dc_id], |row| row.get(0))
                .optional()
                .map_err(sql_err)?;
            match blob {
                None => Ok(None),
                Some(bytes) => AuthKey::from_slice(dc_id, &bytes)
                    .map(Some)
                    .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "stored auth key is not 256 bytes")),
            }
        }

        fn set(&self, dc_id: i32, key: &AuthKey) -> io::Result<()> {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            conn.execute(
                "INSERT OR REPLACE INTO auth_keys (dc_id, auth_key) VALUES (?1, ?2)",
                params![dc_id, key.to_bytes().to_vec()],
            ).map_err(sql_err)?;
            Ok(())
        }

        fn erase(&self, dc_id: i32) -> io::Result<()> {
            let conn = self.conn.lock().map_err(|_| poisoned())?;
            conn.execute("DELETE FROM auth_keys WHERE dc_id = ?1", params![dc_id]).map_err(sql_err)?;
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> AuthKey {
        AuthKey::new(2, [byte; 256])
    }

    fn scratch_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("mtp-client-{name}-{}.keys", std::process::id()));
        let _ = std::fs::remove_file(&p);
        p
    }

    #[test]
    fn in_memory_get_set_erase() {
        let store = InMemoryKeyStore::new();
        assert!(store.get(2).unwrap().is_none());
        store.set(2, &key(7)).unwrap();
        assert_eq!(store.get(2).unwrap().unwrap().key_id(), key(7).key_id());
        store.erase(2).unwrap();
        assert!(store.get(2).unwrap().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let path = scratch_path("reopen");
        FileKeyStore::new(&path).set(2, &key(1)).unwrap();
        FileKeyStore::new(&path).set(4, &key(9)).unwrap();

        let store = FileKeyStore::new(&path);
        let two = store.get(2).unwrap().unwrap();
        assert_eq!(two.to_bytes(), [1; 256]);
        assert_eq!(two.dc_id(), 2);
        assert_eq!(store.get(4).unwrap().unwrap().to_bytes(), [9; 256]);

        store.erase(2).unwrap();
        assert!(FileKeyStore::new(&path).get(2).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn file_store_rejects_foreign_files() {
        let path = scratch_path("foreign");
        std::fs::write(&path, b"not a key file").unwrap();
        let err = FileKeyStore::new(&path).get(2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = scratch_path("missing");
        assert!(FileKeyStore::new(&path).get(1).unwrap().is_none());
        FileKeyStore::new(&path).erase(1).unwrap();
    }
}
