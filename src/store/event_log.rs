//! Component E: an append-only per-tenant log of every message accepted
//! by the pipeline, ordered by a monotonic watermark. `EventsGet` and
//! `MessagesQuery`'s change-feed both read forward from a watermark
//! cursor; `EventsSubscribe`/`MessagesSubscribe`/`RecordsSubscribe`
//! additionally get live notifications through a broadcast channel, so
//! a subscriber doesn't have to poll the log for messages that land
//! after it attaches.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use simple_database::database::{Filters, Index, IndexBuilder, SortOptions};
use simple_database::{Database, Indexable, KeyValueStore};
use tokio::sync::{broadcast, RwLock};

use crate::cid::Cid;
use crate::store::{encode_cursor, Error};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub watermark: u64,
    pub message_cid: String,
    pub interface: String,
    pub method: String,
    pub index: Index,
}

impl Indexable for Event {
    const PRIMARY_KEY: &'static str = "watermark";
    const DEFAULT_SORT: &'static str = "watermark";
    fn primary_key(&self) -> Vec<u8> {
        self.watermark.to_be_bytes().to_vec()
    }
    fn secondary_keys(&self) -> Index {
        let mut index = self.index.clone();
        index.insert("interface".to_string(), self.interface.clone().into());
        index.insert("method".to_string(), self.method.clone().into());
        index.insert("watermark".to_string(), self.watermark.into());
        index
    }
}

struct TenantLog {
    db: Database,
    watermark: AtomicU64,
    live: broadcast::Sender<Event>,
}

pub struct EventLog<KVS: KeyValueStore + 'static> {
    root: PathBuf,
    tenants: RwLock<HashMap<String, Arc<TenantLog>>>,
    _kvs: PhantomData<KVS>,
}

impl<KVS: KeyValueStore + 'static> EventLog<KVS> {
    pub fn new(root: PathBuf) -> Self {
        EventLog { root, tenants: RwLock::new(HashMap::new()), _kvs: PhantomData }
    }

    async fn tenant(&self, tenant: &str) -> Result<Arc<TenantLog>, Error> {
        if let Some(log) = self.tenants.read().await.get(tenant) {
            return Ok(log.clone());
        }
        let mut tenants = self.tenants.write().await;
        if let Some(log) = tenants.get(tenant) {
            return Ok(log.clone());
        }
        let db = Database::new::<KVS>(self.root.join(tenant).join("events")).await?;
        let (rows, _) = db.query::<Event>(&Filters::new(), None).await?;
        let watermark = rows.iter().map(|e| e.watermark).max().unwrap_or(0);
        let (live, _) = broadcast::channel(1024);
        let log = Arc::new(TenantLog { db, watermark: AtomicU64::new(watermark), live });
        tenants.insert(tenant.to_string(), log.clone());
        Ok(log)
    }

    /// Appends an event for `message_cid` and returns its watermark.
    /// Called once per accepted message, after the message store write
    /// succeeds (never before -- the event log must never point at a
    /// message the store doesn't have).
    pub async fn append(
        &self,
        tenant: &str,
        message_cid: &Cid,
        interface: &str,
        method: &str,
        index: Index,
    ) -> Result<u64, Error> {
        let log = self.tenant(tenant).await?;
        let watermark = log.watermark.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            watermark,
            message_cid: message_cid.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
            index,
        };
        log.db.set(&event).await?;
        let _ = log.live.send(event);
        Ok(watermark)
    }

    /// Removes the event recording a message that was subsequently
    /// purged (a `RecordsDelete` prune, for instance, removes the
    /// tombstone's own event once it is no longer needed).
    pub async fn remove(&self, tenant: &str, watermark: u64) -> Result<(), Error> {
        let log = self.tenant(tenant).await?;
        log.db.delete(&watermark.to_be_bytes()).await?;
        Ok(())
    }

    /// Page size for a single `query` call when the caller supplies no
    /// narrower bound; mirrors `records.rs`'s own manual-offset paging.
    const PAGE_SIZE: usize = 256;

    /// Events matching `filters`, in ascending watermark order, paged
    /// through an opaque offset cursor the same way `records.rs::query`
    /// paginates the message store.
    pub async fn query(
        &self,
        tenant: &str,
        filters: &Filters,
        cursor: Option<&str>,
    ) -> Result<(Vec<Event>, Option<String>), Error> {
        let log = self.tenant(tenant).await?;
        let (mut rows, _) = log.db.query::<Event>(filters, Some(SortOptions::new("watermark"))).await?;
        rows.sort_by_key(|e| e.watermark);

        let offset: usize = match cursor {
            Some(c) => {
                let bytes = crate::store::decode_cursor(c)?;
                String::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
            }
            None => 0,
        };
        let page: Vec<Event> = rows.iter().skip(offset).take(Self::PAGE_SIZE + 1).cloned().collect();
        let has_more = page.len() > Self::PAGE_SIZE;
        let page: Vec<Event> = page.into_iter().take(Self::PAGE_SIZE).collect();
        let next_cursor = if has_more { Some(encode_cursor((offset + Self::PAGE_SIZE).to_string().as_bytes())) } else { None };
        Ok((page, next_cursor))
    }

    /// Subscribes to events landing after this call, matching `filters`.
    /// The returned receiver yields every future event regardless of
    /// filter; callers test membership themselves (mirrors how
    /// `RecordsSubscribe`/`MessagesSubscribe`/`EventsSubscribe` all
    /// narrow a single underlying feed per their own descriptor filter).
    pub async fn subscribe(&self, tenant: &str) -> Result<broadcast::Receiver<Event>, Error> {
        Ok(self.tenant(tenant).await?.live.subscribe())
    }
}

pub fn index(pairs: Vec<(&str, simple_database::database::Value)>) -> Result<Index, Error> {
    Ok(IndexBuilder::build(pairs)?)
}
