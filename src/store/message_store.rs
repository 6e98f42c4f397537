//! Component C: the tenant-scoped secondary index over every message a
//! DWN instance has accepted. One `simple_database::Database` per
//! tenant, lazily created on first use, mirroring `Dwn::new`'s
//! `private_database`/`public_database` split -- except here every
//! message (of any interface/method) lives in the same per-tenant
//! index, since queries can span interfaces (4.C's disjunction-of-
//! conjunctions filter grammar does not assume a single message kind).

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use simple_database::database::{Filters, Index, IndexBuilder, SortOptions};
use simple_database::{Database, Indexable, KeyValueStore};
use tokio::sync::RwLock;

use crate::cid::Cid;
use crate::jws::GeneralJws;
use crate::store::{encode_cursor, Error};

/// A message as it lives in the index: the wire-level descriptor kept
/// as a JSON value (its shape varies by interface/method), the
/// authorization envelope, and a flattened secondary index built by the
/// caller (records.rs/protocols.rs/messages.rs/permissions.rs each know
/// which of their own fields should be queryable).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_cid: String,
    pub interface: String,
    pub method: String,
    pub descriptor: serde_json::Value,
    pub authorization: Option<GeneralJws>,
    pub attestation: Option<GeneralJws>,
    pub index: Index,
}

impl Indexable for StoredMessage {
    const PRIMARY_KEY: &'static str = "messageCid";
    const DEFAULT_SORT: &'static str = "messageTimestamp";
    fn primary_key(&self) -> Vec<u8> {
        self.message_cid.as_bytes().to_vec()
    }
    fn secondary_keys(&self) -> Index {
        let mut index = self.index.clone();
        index.insert("interface".to_string(), self.interface.clone().into());
        index.insert("method".to_string(), self.method.clone().into());
        index
    }
}

pub struct MessageStore<KVS: KeyValueStore + 'static> {
    root: PathBuf,
    tenants: RwLock<HashMap<String, Database>>,
    _kvs: PhantomData<KVS>,
}

impl<KVS: KeyValueStore + 'static> MessageStore<KVS> {
    pub fn new(root: PathBuf) -> Self {
        MessageStore { root, tenants: RwLock::new(HashMap::new()), _kvs: PhantomData }
    }

    async fn database(&self, tenant: &str) -> Result<Database, Error> {
        if let Some(db) = self.tenants.read().await.get(tenant) {
            return Ok(db.clone());
        }
        let mut tenants = self.tenants.write().await;
        if let Some(db) = tenants.get(tenant) {
            return Ok(db.clone());
        }
        let db = Database::new::<KVS>(self.root.join(tenant).join("messages")).await?;
        tenants.insert(tenant.to_string(), db.clone());
        Ok(db)
    }

    pub async fn put(
        &self,
        tenant: &str,
        message_cid: &Cid,
        interface: &str,
        method: &str,
        descriptor: serde_json::Value,
        authorization: Option<GeneralJws>,
        attestation: Option<GeneralJws>,
        index: Index,
    ) -> Result<(), Error> {
        let record = StoredMessage {
            message_cid: message_cid.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            descriptor,
            authorization,
            attestation,
            index,
        };
        self.database(tenant).await?.set(&record).await?;
        Ok(())
    }

    pub async fn get(&self, tenant: &str, message_cid: &Cid) -> Result<Option<StoredMessage>, Error> {
        Ok(self.database(tenant).await?.get::<StoredMessage>(message_cid.to_string().as_bytes()).await?)
    }

    pub async fn delete(&self, tenant: &str, message_cid: &Cid) -> Result<(), Error> {
        self.database(tenant).await?.delete(message_cid.to_string().as_bytes()).await?;
        Ok(())
    }

    /// Runs a single conjunction against the index. The store itself
    /// returns a continuation cursor whenever more rows exist past
    /// `sort`'s limit, which we surface directly as the reply's opaque
    /// `cursor` -- a present cursor already means "there are more".
    pub async fn query(
        &self,
        tenant: &str,
        filters: &Filters,
        sort: SortOptions,
    ) -> Result<(Vec<StoredMessage>, Option<String>), Error> {
        let (rows, cursor) = self.database(tenant).await?.query::<StoredMessage>(filters, Some(sort)).await?;
        Ok((rows, cursor.map(|c| encode_cursor(&c))))
    }
}

pub fn index(pairs: Vec<(&str, simple_database::database::Value)>) -> Result<Index, Error> {
    Ok(IndexBuilder::build(pairs)?)
}
