//! Component D: content-addressed blob storage keyed by `(tenant, dataCid)`,
//! reference-counted so multiple records can point at the same bytes (a
//! record update that keeps the same `dataCid` must not re-upload data,
//! and deleting one of several referencing records must not blow away
//! data another record still needs).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use simple_database::database::Index;
use simple_database::{Database, Indexable, KeyValueStore};
use tokio::sync::RwLock;

use crate::cid::Cid;
use crate::store::Error;

/// Below this size a record's data is inlined into its own descriptor
/// (`encodedData`) instead of written here at all; see `records.rs`.
pub const INLINE_THRESHOLD: u64 = 30_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlobEntry {
    data_cid: String,
    size: u64,
    bytes: Vec<u8>,
    refs: u32,
}

impl Indexable for BlobEntry {
    const PRIMARY_KEY: &'static str = "dataCid";
    fn primary_key(&self) -> Vec<u8> {
        self.data_cid.as_bytes().to_vec()
    }
    fn secondary_keys(&self) -> Index {
        Index::new()
    }
}

pub struct DataStore<KVS: KeyValueStore + 'static> {
    root: PathBuf,
    tenants: RwLock<HashMap<String, Database>>,
    _kvs: PhantomData<KVS>,
}

pub struct PutResult {
    pub data_cid: Cid,
    pub size: u64,
}

impl<KVS: KeyValueStore + 'static> DataStore<KVS> {
    pub fn new(root: PathBuf) -> Self {
        DataStore { root, tenants: RwLock::new(HashMap::new()), _kvs: PhantomData }
    }

    async fn database(&self, tenant: &str) -> Result<Database, Error> {
        if let Some(db) = self.tenants.read().await.get(tenant) {
            return Ok(db.clone());
        }
        let mut tenants = self.tenants.write().await;
        if let Some(db) = tenants.get(tenant) {
            return Ok(db.clone());
        }
        let db = Database::new::<KVS>(self.root.join(tenant).join("data")).await?;
        tenants.insert(tenant.to_string(), db.clone());
        Ok(db)
    }

    /// Stores `bytes` if this is the first reference to its content,
    /// otherwise bumps the reference count. Returns the derived CID and
    /// size either way, so the caller can bind them into a descriptor
    /// without having hashed the bytes itself.
    pub async fn put(&self, tenant: &str, bytes: &[u8]) -> Result<PutResult, Error> {
        let data_cid = Cid::of_bytes(bytes)?;
        let db = self.database(tenant).await?;
        if let Some(mut existing) = db.get::<BlobEntry>(data_cid.to_string().as_bytes()).await? {
            existing.refs += 1;
            db.set(&existing).await?;
        } else {
            db.set(&BlobEntry { data_cid: data_cid.to_string(), size: bytes.len() as u64, bytes: bytes.to_vec(), refs: 1 })
                .await?;
        }
        Ok(PutResult { data_cid, size: bytes.len() as u64 })
    }

    /// Associates an additional record with data that's already stored
    /// (a second `RecordsWrite` pointing at the same `dataCid` via
    /// `data_cid`/`data_size` instead of inline `data`).
    pub async fn associate(&self, tenant: &str, data_cid: &Cid) -> Result<bool, Error> {
        let db = self.database(tenant).await?;
        if let Some(mut existing) = db.get::<BlobEntry>(data_cid.to_string().as_bytes()).await? {
            existing.refs += 1;
            db.set(&existing).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub async fn get(&self, tenant: &str, data_cid: &Cid) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.database(tenant).await?.get::<BlobEntry>(data_cid.to_string().as_bytes()).await?.map(|e| e.bytes))
    }

    /// Drops one reference; the blob is deleted once nothing references
    /// it any longer.
    pub async fn delete(&self, tenant: &str, data_cid: &Cid) -> Result<(), Error> {
        let db = self.database(tenant).await?;
        if let Some(mut entry) = db.get::<BlobEntry>(data_cid.to_string().as_bytes()).await? {
            if entry.refs <= 1 {
                db.delete(data_cid.to_string().as_bytes()).await?;
            } else {
                entry.refs -= 1;
                db.set(&entry).await?;
            }
        }
        Ok(())
    }

    /// Forcibly removes data left behind by a write whose descriptor was
    /// never finalized (e.g. the process crashed between storing data
    /// and indexing the message). Invoked explicitly, not scheduled.
    pub async fn sweep_orphans(&self, tenant: &str, live_data_cids: &[Cid]) -> Result<u32, Error> {
        let db = self.database(tenant).await?;
        let live: std::collections::HashSet<&str> = live_data_cids.iter().map(|c| c.as_str()).collect();
        let (entries, _) = db.query::<BlobEntry>(&simple_database::database::Filters::new(), None).await?;
        let mut swept = 0;
        for entry in entries {
            if !live.contains(entry.data_cid.as_str()) {
                db.delete(entry.data_cid.as_bytes()).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_database::MemoryStore;

    #[tokio::test]
    async fn put_is_idempotent_and_reference_counted() {
        let store: DataStore<MemoryStore> = DataStore::new(PathBuf::from("test-data"));
        let a = store.put("did:example:alice", b"hello world").await.unwrap();
        let b = store.put("did:example:alice", b"hello world").await.unwrap();
        assert_eq!(a.data_cid, b.data_cid);

        store.delete("did:example:alice", &a.data_cid).await.unwrap();
        assert!(store.get("did:example:alice", &a.data_cid).await.unwrap().is_some());
        store.delete("did:example:alice", &a.data_cid).await.unwrap();
        assert!(store.get("did:example:alice", &a.data_cid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn associate_returns_false_for_unknown_cid() {
        let store: DataStore<MemoryStore> = DataStore::new(PathBuf::from("test-data-2"));
        let bogus = Cid::of_bytes(b"never stored").unwrap();
        assert!(!store.associate("did:example:alice", &bogus).await.unwrap());
    }
}
