//! Component I: records -- the write/query/read/delete/subscribe state
//! machine. Grounded primarily in the teacher's `dwn/records_write.rs`
//! (`RecordsWriteOptions::create`, `RecordsWrite::sign`, the
//! `Descriptor`/`EntryIdInput`/`AuthorizationModel` shapes) for the
//! write path, and `other_examples`'s vercre-dwn `records/query.rs`
//! (`into_non_owner`, `only_published`) for non-owner visibility.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use simple_database::database::{Filter, FiltersBuilder, SortOptions};
use thiserror::Error as ThisError;

use crate::cid::Cid;
use crate::message::{entry_id, Authorization};
use crate::store::data_store::DataStore;
use crate::store::message_store::{MessageStore, StoredMessage};
use simple_database::KeyValueStore;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("data and dataCid are mutually exclusive")]
    DataAndDataCid,
    #[error("dataCid requires dataSize")]
    DataCidRequiresSize,
    #[error("protocol requires protocolPath, and vice versa")]
    ProtocolRequiresPath,
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} has been deleted")]
    Deleted(String),
    #[error("write for record {0} is superseded by a newer entry")]
    Conflict(String),
    #[error("immutable property {0} changed across updates")]
    ImmutablePropertyChanged(&'static str),
    #[error("descriptor claims dataCid {claimed} but the data hashes to {actual}")]
    DataCidMismatch { claimed: String, actual: String },
    #[error("descriptor claims dataSize {claimed} but the data is {actual} bytes")]
    DataSizeMismatch { claimed: u64, actual: u64 },
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Cid(#[from] crate::cid::Error),
    #[error(transparent)]
    Jws(#[from] crate::jws::Error),
    #[error(transparent)]
    Validator(#[from] crate::validator::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) | Error::Deleted(_) => 404,
            Error::Conflict(_) => 409,
            Error::Store(e) => e.status_code(),
            Error::Cid(_) | Error::Serde(_) | Error::Base64(_) => 500,
            Error::Jws(e) => e.status_code(),
            Error::Validator(_)
            | Error::DataAndDataCid
            | Error::DataCidRequiresSize
            | Error::ProtocolRequiresPath
            | Error::ImmutablePropertyChanged(_)
            | Error::DataCidMismatch { .. }
            | Error::DataSizeMismatch { .. } => 400,
        }
    }
}

/// Current lifecycle state of a `recordId`, tracked as an index field
/// alongside every write so a query can cheaply restrict itself to the
/// current winner without re-deriving it from the whole history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Latest,
    Historic,
    Deleted,
}

impl RecordState {
    fn as_str(self) -> &'static str {
        match self {
            RecordState::Latest => "latest",
            RecordState::Historic => "historic",
            RecordState::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordsWriteDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "protocolPath", skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "dataFormat")]
    pub data_format: String,
    #[serde(rename = "dataCid")]
    pub data_cid: String,
    #[serde(rename = "dataSize")]
    pub data_size: u64,
    #[serde(rename = "dateCreated")]
    pub date_created: DateTime<Utc>,
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub published: bool,
    #[serde(rename = "datePublished", skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateTime<Utc>>,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordsWriteMessage {
    pub descriptor: RecordsWriteDescriptor,
    #[serde(rename = "recordId")]
    pub record_id: String,
    #[serde(rename = "contextId", skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub authorization: Authorization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<crate::jws::GeneralJws>,
    /// Data inlined in the message itself, below the 30,000-byte
    /// threshold; mutually exclusive with a separate data-store write.
    #[serde(rename = "encodedData", skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,
}

pub struct WriteInput {
    pub descriptor: RecordsWriteDescriptor,
    pub record_id: Option<String>,
    pub context_id: Option<String>,
    pub data: Vec<u8>,
    pub attestation: Option<crate::jws::GeneralJws>,
    /// Role this write invokes, carried into the signed payload as
    /// `protocolRole` for `authorize_write`'s role branch (4.H).
    pub protocol_role: Option<String>,
    /// Grant licensing `signer` to act for `kid`'s own author, carried
    /// into the signed payload as `delegatedGrantId` (4.B/4.G).
    pub delegated_grant_id: Option<String>,
}

impl Default for WriteInput {
    fn default() -> Self {
        WriteInput {
            descriptor: RecordsWriteDescriptor {
                protocol: None,
                protocol_path: None,
                recipient: None,
                schema: None,
                data_format: String::new(),
                data_cid: String::new(),
                data_size: 0,
                date_created: Utc::now(),
                message_timestamp: Utc::now(),
                published: false,
                date_published: None,
                parent_id: None,
                tags: None,
            },
            record_id: None,
            context_id: None,
            data: Vec::new(),
            attestation: None,
            protocol_role: None,
            delegated_grant_id: None,
        }
    }
}

/// A tombstone superseding the current latest write of a record. Carries
/// no data of its own; `recordId` ties it to the record history it
/// closes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordsDeleteDescriptor {
    #[serde(rename = "recordId")]
    pub record_id: String,
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordsDeleteMessage {
    pub descriptor: RecordsDeleteDescriptor,
    pub authorization: Authorization,
}

impl RecordsDeleteMessage {
    pub fn message_cid(&self) -> Result<Cid, Error> {
        Ok(crate::message::message_cid(&self.descriptor, Some(&self.authorization))?)
    }
}

/// `DateSort` of §4.I: which timestamp a `RecordsQuery` orders by, and in
/// which direction. `Published*` variants additionally exclude
/// unpublished records from the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateSort {
    CreatedAscending,
    CreatedDescending,
    PublishedAscending,
    PublishedDescending,
    MessageTimestamp,
}

impl DateSort {
    fn sort_key(self) -> &'static str {
        match self {
            DateSort::CreatedAscending | DateSort::CreatedDescending => "dateCreated",
            DateSort::PublishedAscending | DateSort::PublishedDescending => "datePublished",
            DateSort::MessageTimestamp => "messageTimestamp",
        }
    }

    fn descending(self) -> bool {
        matches!(self, DateSort::CreatedDescending | DateSort::PublishedDescending)
    }

    fn published_only(self) -> bool {
        matches!(self, DateSort::PublishedAscending | DateSort::PublishedDescending)
    }
}

/// The filter fields a `RecordsQuery`/`RecordsRead` descriptor may carry,
/// ANDed together into a single conjunction; see `RecordsEngine::query`
/// for how the non-owner visibility union (4.I) layers a predicate on
/// top of this.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RecordsFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "protocolPath", skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(rename = "contextId", skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(rename = "dataFormat", skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,
    #[serde(rename = "recordId", skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl RecordsFilter {
    /// 4.F: queries never carry an entirely empty filter object.
    pub fn is_empty(&self) -> bool {
        self.protocol.is_none()
            && self.protocol_path.is_none()
            && self.schema.is_none()
            && self.recipient.is_none()
            && self.context_id.is_none()
            && self.parent_id.is_none()
            && self.data_format.is_none()
            && self.record_id.is_none()
            && self.author.is_none()
    }
}

impl RecordsWriteMessage {
    /// Assembles and signs a new write. `record_id` must be `Some` for
    /// an update (it identifies which record history this write joins);
    /// left `None`, this is treated as an initial write and its
    /// `recordId` is derived from the author and descriptor.
    pub fn create(
        input: WriteInput,
        signer: &crate::jws::SigningKey,
        kid: &str,
    ) -> Result<Self, Error> {
        crate::validator::require_together(
            ("protocol", input.descriptor.protocol.is_some()),
            ("protocolPath", input.descriptor.protocol_path.is_some()),
        )?;

        let author = kid.split('#').next().unwrap_or(kid).to_string();
        let record_id = match input.record_id {
            Some(id) => id,
            None => entry_id(&author, &input.descriptor)?.to_string(),
        };
        let context_id = input.context_id.or_else(|| {
            input.descriptor.protocol.as_ref().map(|_| record_id.clone())
        });

        let descriptor_cid = crate::message::descriptor_cid(&input.descriptor)?;
        let encoded_data = if input.data.len() as u64 <= crate::store::data_store::INLINE_THRESHOLD {
            use base64::Engine;
            Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&input.data))
        } else {
            None
        };

        let payload = crate::jws::SignaturePayload {
            descriptor_cid: descriptor_cid.to_string(),
            record_id: Some(record_id.clone()),
            context_id: context_id.clone(),
            attestation_cid: input.attestation.as_ref().map(|a| a.cid()).transpose()?.map(|c| c.to_string()),
            protocol_role: input.protocol_role.clone(),
            delegated_grant_id: input.delegated_grant_id.clone(),
            ..Default::default()
        };
        let jws = crate::jws::GeneralJws::sign(signer, kid, &payload)?;

        Ok(RecordsWriteMessage {
            descriptor: input.descriptor,
            record_id,
            context_id,
            authorization: Authorization { signature: jws, owner_signature: None },
            attestation: input.attestation,
            encoded_data,
        })
    }

    pub fn message_cid(&self) -> Result<Cid, Error> {
        Ok(crate::message::message_cid(&self.descriptor, Some(&self.authorization))?)
    }

    pub fn is_initial_write(&self) -> Result<bool, Error> {
        Ok(entry_id(&self.author()?, &self.descriptor)?.to_string() == self.record_id)
    }

    pub fn author(&self) -> Result<String, Error> {
        Ok(self.authorization.author_kid()?.split('#').next().unwrap_or_default().to_string())
    }
}

/// Orders two writes to the same `recordId` (spec.md 4.I step 4): for an
/// initial write, the higher `dateCreated` wins -- the only time this can
/// differ is a race between two competing initial writes, since every
/// later write's `dateCreated` is pinned to the initial write's by
/// `check_immutable`. Otherwise (an update) the higher `messageTimestamp`
/// wins. A further tie is broken by the lexicographically larger
/// `messageCid`, so every replica converges on the same winner without
/// coordination.
pub fn compare(is_initial: bool, a: (&DateTime<Utc>, &DateTime<Utc>, &str), b: (&DateTime<Utc>, &DateTime<Utc>, &str)) -> std::cmp::Ordering {
    let primary = if is_initial { a.0.cmp(b.0) } else { a.1.cmp(b.1) };
    primary.then_with(|| a.2.cmp(b.2))
}

pub struct RecordsEngine<KVS: KeyValueStore + 'static> {
    pub messages: std::sync::Arc<MessageStore<KVS>>,
    pub data: DataStore<KVS>,
}

pub enum WriteOutcome {
    Accepted { message_cid: Cid },
    Conflict { winner_message_cid: String },
}

impl<KVS: KeyValueStore + 'static> RecordsEngine<KVS> {
    /// Applies a write: stores data, resolves the race against whatever
    /// else is currently indexed for this `recordId`, and re-indexes
    /// the loser (if any) as historic so only one entry carries
    /// `RecordState::Latest` per `recordId` at a time.
    pub async fn write(&self, tenant: &str, msg: &RecordsWriteMessage, data: &[u8]) -> Result<WriteOutcome, Error> {
        let message_cid = msg.message_cid()?;

        let is_initial = msg.is_initial_write()?;
        let existing = self.current(tenant, &msg.record_id).await?;
        if let Some(current) = &existing {
            let current_key = (&current.1, &current.2, current.0.message_cid.as_str());
            let new_key = (&msg.descriptor.date_created, &msg.descriptor.message_timestamp, message_cid.as_str());
            if compare(is_initial, new_key, current_key) != std::cmp::Ordering::Greater {
                log::debug!("recordId {} write {message_cid} superseded by {}", msg.record_id, current.0.message_cid);
                return Ok(WriteOutcome::Conflict { winner_message_cid: current.0.message_cid.clone() });
            }
            if !is_initial {
                Self::check_immutable(&current.0, &msg.descriptor)?;
            }
        }

        // `dataCid`/`dataSize` are signed by the author but describe bytes
        // the node receives separately; verify they're authoritative
        // rather than trusting a claim that could point at arbitrary data.
        if msg.descriptor.data_size != data.len() as u64 {
            return Err(Error::DataSizeMismatch { claimed: msg.descriptor.data_size, actual: data.len() as u64 });
        }
        let actual_cid = Cid::of_bytes(data)?;
        if msg.descriptor.data_cid != actual_cid.to_string() {
            return Err(Error::DataCidMismatch { claimed: msg.descriptor.data_cid.clone(), actual: actual_cid.to_string() });
        }

        if msg.encoded_data.is_none() {
            self.data.put(tenant, data).await?;
        }

        let mut descriptor_value = serde_json::to_value(&msg.descriptor)?;
        if let Some(encoded) = &msg.encoded_data {
            descriptor_value["encodedData"] = serde_json::Value::String(encoded.clone());
        }

        let mut index = crate::store::message_store::index(vec![
            ("recordId", msg.record_id.clone().into()),
            ("recordState", RecordState::Latest.as_str().to_string().into()),
            ("dateCreated", msg.descriptor.date_created.timestamp().into()),
            ("messageTimestamp", msg.descriptor.message_timestamp.timestamp().into()),
            ("published", msg.descriptor.published.to_string().into()),
            ("author", msg.author()?.into()),
            ("dataFormat", msg.descriptor.data_format.clone().into()),
            ("isInitialWrite", is_initial.to_string().into()),
            ("hasBlob", msg.encoded_data.is_none().to_string().into()),
        ])?;
        if let Some(protocol) = &msg.descriptor.protocol {
            index.insert("protocol".to_string(), protocol.clone().into());
        }
        if let Some(path) = &msg.descriptor.protocol_path {
            index.insert("protocolPath".to_string(), path.clone().into());
        }
        if let Some(schema) = &msg.descriptor.schema {
            index.insert("schema".to_string(), schema.clone().into());
        }
        if let Some(recipient) = &msg.descriptor.recipient {
            index.insert("recipient".to_string(), recipient.clone().into());
        }
        if let Some(context_id) = &msg.context_id {
            index.insert("contextId".to_string(), context_id.clone().into());
        }
        if let Some(parent_id) = &msg.descriptor.parent_id {
            index.insert("parentId".to_string(), parent_id.clone().into());
        }

        self.messages
            .put(
                tenant,
                &message_cid,
                "Records",
                "Write",
                descriptor_value,
                Some(msg.authorization.signature.clone()),
                msg.attestation.clone(),
                index,
            )
            .await?;

        if let Some((old, _, _)) = existing {
            // 4.I step 7's retention rule: the initial write stays around
            // (re-indexed historic) as the root of the record's lineage,
            // but an intermediate write that is itself superseded is
            // pruned outright rather than piling up forever.
            let old_is_initial = old.index.get("isInitialWrite").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false);
            if old_is_initial {
                self.demote(tenant, &old).await?;
            } else {
                self.prune(tenant, &old).await?;
            }
        }

        log::debug!("recordId {} accepted write {message_cid}", msg.record_id);
        Ok(WriteOutcome::Accepted { message_cid })
    }

    /// Rejects an update that changes one of the properties a record's
    /// initial write fixes for its whole lineage. `dataFormat`/`tags`/
    /// `published` are deliberately excluded -- those are exactly what an
    /// update is for.
    fn check_immutable(current: &StoredMessage, new: &RecordsWriteDescriptor) -> Result<(), Error> {
        let field_matches = |key: &str, val: Option<&str>| -> bool {
            match (current.index.get(key).and_then(|v| v.as_string()), val) {
                (None, None) => true,
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        };
        if !field_matches("protocol", new.protocol.as_deref()) {
            return Err(Error::ImmutablePropertyChanged("protocol"));
        }
        if !field_matches("protocolPath", new.protocol_path.as_deref()) {
            return Err(Error::ImmutablePropertyChanged("protocolPath"));
        }
        if !field_matches("schema", new.schema.as_deref()) {
            return Err(Error::ImmutablePropertyChanged("schema"));
        }
        if !field_matches("recipient", new.recipient.as_deref()) {
            return Err(Error::ImmutablePropertyChanged("recipient"));
        }
        if !field_matches("parentId", new.parent_id.as_deref()) {
            return Err(Error::ImmutablePropertyChanged("parentId"));
        }
        let date_created_matches = current
            .index
            .get("dateCreated")
            .and_then(|v| v.as_u64())
            .map(|t| *t as i64 == new.date_created.timestamp())
            .unwrap_or(false);
        if !date_created_matches {
            return Err(Error::ImmutablePropertyChanged("dateCreated"));
        }
        Ok(())
    }

    async fn demote(&self, tenant: &str, old: &StoredMessage) -> Result<(), Error> {
        let mut demoted = old.clone();
        demoted.index.insert("recordState".to_string(), RecordState::Historic.as_str().to_string().into());
        self.messages
            .put(
                tenant,
                &old.message_cid.parse()?,
                &demoted.interface,
                &demoted.method,
                demoted.descriptor,
                demoted.authorization,
                demoted.attestation,
                demoted.index,
            )
            .await?;
        Ok(())
    }

    /// Deletes an intermediate write (and its data blob, if any) once a
    /// newer write has superseded it and it is not the lineage's initial
    /// write.
    async fn prune(&self, tenant: &str, old: &StoredMessage) -> Result<(), Error> {
        self.messages.delete(tenant, &old.message_cid.parse()?).await?;
        let has_blob = old.index.get("hasBlob").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false);
        if has_blob {
            if let Some(data_cid) = old.descriptor.get("dataCid").and_then(|v| v.as_str()) {
                if let Ok(data_cid) = data_cid.parse::<Cid>() {
                    self.data.delete(tenant, &data_cid).await?;
                }
            }
        }
        Ok(())
    }

    /// The record's current winner and its `(dateCreated,
    /// messageTimestamp)` ordering key, or `None` if nothing has ever
    /// been written under this `recordId`.
    async fn current(&self, tenant: &str, record_id: &str) -> Result<Option<(StoredMessage, DateTime<Utc>, DateTime<Utc>)>, Error> {
        let filters = FiltersBuilder::build(vec![
            ("recordId", Filter::equal(record_id.to_string())),
            ("recordState", Filter::equal(RecordState::Latest.as_str().to_string())),
        ]);
        let (rows, _) = self.messages.query(tenant, &filters, SortOptions::new("messageTimestamp")).await?;
        Ok(rows.into_iter().next().map(|row| {
            let field = |key: &str| {
                row.index
                    .get(key)
                    .and_then(|v| v.as_u64())
                    .map(|t| DateTime::from_timestamp(*t as i64, 0).unwrap_or_default())
                    .unwrap_or_default()
            };
            let date_created = field("dateCreated");
            let message_timestamp = field("messageTimestamp");
            (row, date_created, message_timestamp)
        }))
    }

    /// Marks the current winner deleted (a tombstone write carrying no
    /// data). A subsequent write with a newer ordering key still
    /// resurrects the record -- deletion is just another state
    /// transition, not a permanent grave (open question 2).
    pub async fn delete(&self, tenant: &str, msg: &RecordsDeleteMessage) -> Result<(), Error> {
        let record_id = &msg.descriptor.record_id;
        let tombstone_cid = msg.message_cid()?;
        let existing = self.current(tenant, record_id).await?.ok_or(Error::NotFound(record_id.to_string()))?;
        // A delete is never an initial write, so the comparison always runs
        // on `messageTimestamp`; `dateCreated` plays no role here and the
        // existing record's own value is passed through on both sides.
        let new_key = (&existing.1, &msg.descriptor.message_timestamp, tombstone_cid.as_str());
        let current_key = (&existing.1, &existing.2, existing.0.message_cid.as_str());
        if compare(false, new_key, current_key) != std::cmp::Ordering::Greater {
            return Err(Error::Conflict(existing.0.message_cid.clone()));
        }
        let mut index = existing.0.index.clone();
        index.insert("recordState".to_string(), RecordState::Deleted.as_str().to_string().into());
        index.insert("messageTimestamp".to_string(), msg.descriptor.message_timestamp.timestamp().into());
        self.messages
            .put(
                tenant,
                &tombstone_cid,
                "Records",
                "Delete",
                serde_json::to_value(&msg.descriptor)?,
                Some(msg.authorization.signature.clone()),
                None,
                index,
            )
            .await?;
        let existing_is_initial = existing.0.index.get("isInitialWrite").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false);
        if existing_is_initial {
            self.demote(tenant, &existing.0).await?;
            if let Some(data_cid) = existing.0.descriptor.get("dataCid").and_then(|v| v.as_str()) {
                if let Ok(data_cid) = data_cid.parse::<Cid>() {
                    self.data.delete(tenant, &data_cid).await?;
                }
            }
        } else {
            self.prune(tenant, &existing.0).await?;
        }
        Ok(())
    }

    /// Open question 3 resolved: reading a tombstoned record surfaces the
    /// `Deleted` error rather than the tombstone's own metadata.
    pub async fn read(&self, tenant: &str, record_id: &str) -> Result<StoredMessage, Error> {
        let (row, _, _) = self.current(tenant, record_id).await?.ok_or(Error::NotFound(record_id.to_string()))?;
        if row.method == "Delete" {
            return Err(Error::Deleted(record_id.to_string()));
        }
        Ok(row)
    }

    /// Recovers a `RecordsWrite`'s payload: base64-decodes `encodedData`
    /// if the write was inlined, otherwise fetches the blob by the
    /// descriptor's own `dataCid`. `None` for anything that isn't a
    /// write (e.g. a tombstone) or carries no data.
    pub async fn read_data(&self, tenant: &str, row: &StoredMessage) -> Result<Option<Vec<u8>>, Error> {
        if row.method != "Write" {
            return Ok(None);
        }
        if let Some(encoded) = row.descriptor.get("encodedData").and_then(|v| v.as_str()) {
            use base64::Engine;
            return Ok(Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded)?));
        }
        match row.descriptor.get("dataCid").and_then(|v| v.as_str()) {
            Some(data_cid) if !data_cid.is_empty() => {
                let data_cid: Cid = data_cid.parse()?;
                Ok(self.data.get(tenant, &data_cid).await?)
            }
            _ => Ok(None),
        }
    }

    fn filter_pairs(filter: &RecordsFilter) -> Vec<(&'static str, Filter)> {
        let mut pairs = vec![
            ("recordState", Filter::equal(RecordState::Latest.as_str().to_string())),
        ];
        if let Some(v) = &filter.protocol {
            pairs.push(("protocol", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.protocol_path {
            pairs.push(("protocolPath", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.schema {
            pairs.push(("schema", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.recipient {
            pairs.push(("recipient", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.context_id {
            pairs.push(("contextId", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.parent_id {
            pairs.push(("parentId", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.data_format {
            pairs.push(("dataFormat", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.record_id {
            pairs.push(("recordId", Filter::equal(v.clone())));
        }
        if let Some(v) = &filter.author {
            pairs.push(("author", Filter::equal(v.clone())));
        }
        pairs
    }

    /// Component I's `RecordsQuery`/`RecordsSubscribe` entry point. `visible`
    /// encodes the caller's access-control decision for a single stored
    /// message -- the dispatcher builds it from the owner/published/
    /// recipient/author union plus grant and protocol-role checks (4.I),
    /// so this engine only has to know how to filter, sort, and paginate.
    ///
    /// `filters` is 4.C's "disjunction of conjunctions": each element is
    /// ANDed internally, and the overall result is the union (deduplicated
    /// by `messageCid`) of every element's matches.
    pub async fn query(
        &self,
        tenant: &str,
        filters: &[RecordsFilter],
        date_sort: DateSort,
        cursor: Option<&str>,
        limit: usize,
        visible: impl Fn(&StoredMessage) -> bool,
    ) -> Result<(Vec<StoredMessage>, Option<String>), Error> {
        let mut rows: Vec<StoredMessage> = Vec::new();
        for filter in filters {
            let built = FiltersBuilder::build(Self::filter_pairs(filter));
            let (matched, _) = self.messages.query(tenant, &built, SortOptions::new("messageTimestamp")).await?;
            rows.extend(matched);
        }
        let rows: Vec<StoredMessage> = rows.into_iter().unique_by(|r| r.message_cid.clone()).collect();

        let mut rows: Vec<StoredMessage> = rows.into_iter().filter(|r| visible(r)).collect();
        if date_sort.published_only() {
            rows.retain(|r| r.index.get("published").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false));
        }

        let key = date_sort.sort_key();
        rows.sort_by(|a, b| {
            let av = a.index.get(key).and_then(|v| v.as_u64()).copied().unwrap_or(0);
            let bv = b.index.get(key).and_then(|v| v.as_u64()).copied().unwrap_or(0);
            av.cmp(&bv).then_with(|| a.message_cid.cmp(&b.message_cid))
        });
        if date_sort.descending() {
            rows.reverse();
        }

        let offset: usize = match cursor {
            Some(c) => {
                let bytes = crate::store::decode_cursor(c).map_err(crate::store::Error::from)?;
                String::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
            }
            None => 0,
        };
        let page: Vec<StoredMessage> = rows.iter().skip(offset).take(limit + 1).cloned().collect();
        let has_more = page.len() > limit;
        let page: Vec<StoredMessage> = page.into_iter().take(limit).collect();
        let next_cursor = if has_more { Some(crate::store::encode_cursor((offset + limit).to_string().as_bytes())) } else { None };
        Ok((page, next_cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey as EdSigningKey;
    use rand::rngs::OsRng;
    use simple_database::MemoryStore;
    use std::path::PathBuf;

    #[test]
    fn compare_prefers_later_message_timestamp_for_updates() {
        let created = Utc::now();
        let t1 = created + chrono::Duration::seconds(1);
        let t2 = created + chrono::Duration::seconds(2);
        assert_eq!(compare(false, (&created, &t2, "a"), (&created, &t1, "z")), std::cmp::Ordering::Greater);
    }

    #[test]
    fn compare_prefers_later_date_created_for_initial_writes() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);
        // message_timestamp is deliberately reversed from date_created to
        // prove the initial-write branch keys off date_created, not it.
        assert_eq!(compare(true, (&t2, &t1, "a"), (&t1, &t2, "z")), std::cmp::Ordering::Greater);
    }

    #[test]
    fn compare_breaks_ties_on_message_cid() {
        let t = Utc::now();
        assert_eq!(compare(false, (&t, &t, "z"), (&t, &t, "a")), std::cmp::Ordering::Greater);
    }

    const KID: &str = "did:example:alice#key-1";

    fn signer() -> crate::jws::SigningKey {
        crate::jws::SigningKey::Ed25519(Box::new(EdSigningKey::generate(&mut OsRng)))
    }

    fn write(
        record_id: Option<String>,
        date_created: DateTime<Utc>,
        message_timestamp: DateTime<Utc>,
        schema: Option<&str>,
        data: &[u8],
        key: &crate::jws::SigningKey,
    ) -> RecordsWriteMessage {
        let descriptor = RecordsWriteDescriptor {
            protocol: None,
            protocol_path: None,
            recipient: None,
            schema: schema.map(str::to_string),
            data_format: "application/json".to_string(),
            data_cid: Cid::of_bytes(data).unwrap().to_string(),
            data_size: data.len() as u64,
            date_created,
            message_timestamp,
            published: false,
            date_published: None,
            parent_id: None,
            tags: None,
        };
        let input = WriteInput { descriptor, record_id, context_id: None, data: data.to_vec(), attestation: None, protocol_role: None, delegated_grant_id: None };
        RecordsWriteMessage::create(input, key, KID).unwrap()
    }

    fn engine(name: &str) -> RecordsEngine<MemoryStore> {
        let messages = std::sync::Arc::new(MessageStore::new(PathBuf::from(format!("test-records-{name}"))));
        RecordsEngine { messages, data: DataStore::new(PathBuf::from(format!("test-records-data-{name}"))) }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let eng = engine("roundtrip");
        let key = signer();
        let t0 = Utc::now();
        let initial = write(None, t0, t0, None, b"hello world", &key);
        let record_id = initial.record_id.clone();

        eng.write("did:example:alice", &initial, b"hello world").await.unwrap();
        let stored = eng.read("did:example:alice", &record_id).await.unwrap();
        assert_eq!(stored.message_cid, initial.message_cid().unwrap().to_string());
        let data = eng.read_data("did:example:alice", &stored).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn write_rejects_data_that_does_not_match_the_claimed_cid() {
        let eng = engine("mismatched-cid");
        let key = signer();
        let t0 = Utc::now();
        let initial = write(None, t0, t0, None, b"hello world", &key);
        let err = eng.write("did:example:alice", &initial, b"goodbye world").await.unwrap_err();
        assert!(matches!(err, Error::DataCidMismatch { .. }));
    }

    #[tokio::test]
    async fn write_rejects_data_whose_length_does_not_match_the_claimed_size() {
        let eng = engine("mismatched-size");
        let key = signer();
        let t0 = Utc::now();
        let initial = write(None, t0, t0, None, b"hello world", &key);
        let err = eng.write("did:example:alice", &initial, b"hello").await.unwrap_err();
        assert!(matches!(err, Error::DataSizeMismatch { .. }));
    }

    #[tokio::test]
    async fn write_then_read_recovers_out_of_band_data() {
        let eng = engine("out-of-band");
        let key = signer();
        let t0 = Utc::now();
        let big = vec![7u8; crate::store::data_store::INLINE_THRESHOLD as usize + 1];
        let initial = write(None, t0, t0, None, &big, &key);
        assert!(initial.encoded_data.is_none());
        eng.write("did:example:alice", &initial, &big).await.unwrap();
        let stored = eng.read("did:example:alice", &initial.record_id).await.unwrap();
        let data = eng.read_data("did:example:alice", &stored).await.unwrap();
        assert_eq!(data, Some(big));
    }

    #[tokio::test]
    async fn later_update_wins_and_earlier_is_rejected() {
        let eng = engine("conflict");
        let key = signer();
        let t0 = Utc::now();
        let initial = write(None, t0, t0, None, b"v1", &key);
        let record_id = initial.record_id.clone();
        eng.write("did:example:alice", &initial, b"v1").await.unwrap();

        let later = write(Some(record_id.clone()), t0, t0 + chrono::Duration::seconds(2), None, b"v2", &key);
        let earlier_retry = write(Some(record_id.clone()), t0, t0 + chrono::Duration::seconds(1), None, b"v1b", &key);

        assert!(matches!(eng.write("did:example:alice", &later, b"v2").await.unwrap(), WriteOutcome::Accepted { .. }));
        assert!(matches!(eng.write("did:example:alice", &earlier_retry, b"v1b").await.unwrap(), WriteOutcome::Conflict { .. }));

        let stored = eng.read("did:example:alice", &record_id).await.unwrap();
        assert_eq!(stored.message_cid, later.message_cid().unwrap().to_string());
    }

    #[tokio::test]
    async fn intermediate_writes_are_pruned_but_initial_write_survives() {
        let eng = engine("retention");
        let key = signer();
        let t0 = Utc::now();
        let initial = write(None, t0, t0, None, b"v1", &key);
        let record_id = initial.record_id.clone();
        let initial_cid = initial.message_cid().unwrap().to_string();
        eng.write("did:example:alice", &initial, b"v1").await.unwrap();

        let v2 = write(Some(record_id.clone()), t0, t0 + chrono::Duration::seconds(1), None, b"v2", &key);
        let v2_cid = v2.message_cid().unwrap().to_string();
        eng.write("did:example:alice", &v2, b"v2").await.unwrap();

        let v3 = write(Some(record_id.clone()), t0, t0 + chrono::Duration::seconds(2), None, b"v3", &key);
        eng.write("did:example:alice", &v3, b"v3").await.unwrap();

        let filters = FiltersBuilder::build(vec![("recordId", Filter::equal(record_id.clone()))]);
        let (rows, _) = eng.messages.query("did:example:alice", &filters, SortOptions::new("messageTimestamp")).await.unwrap();
        let cids: Vec<&str> = rows.iter().map(|r| r.message_cid.as_str()).collect();

        assert!(cids.contains(&initial_cid.as_str()), "initial write must survive as lineage root");
        assert!(!cids.contains(&v2_cid.as_str()), "superseded intermediate write must be pruned");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn update_changing_schema_is_rejected() {
        let eng = engine("immutable");
        let key = signer();
        let t0 = Utc::now();
        let initial = write(None, t0, t0, Some("https://example.com/note"), b"v1", &key);
        let record_id = initial.record_id.clone();
        eng.write("did:example:alice", &initial, b"v1").await.unwrap();

        let bad_update = write(Some(record_id), t0, t0 + chrono::Duration::seconds(1), Some("https://example.com/other"), b"v2", &key);
        let err = eng.write("did:example:alice", &bad_update, b"v2").await.unwrap_err();
        assert!(matches!(err, Error::ImmutablePropertyChanged("schema")));
    }

    fn write_with_parent(
        record_id: Option<String>,
        date_created: DateTime<Utc>,
        message_timestamp: DateTime<Utc>,
        parent_id: Option<&str>,
        data: &[u8],
        key: &crate::jws::SigningKey,
    ) -> RecordsWriteMessage {
        let descriptor = RecordsWriteDescriptor {
            protocol: None,
            protocol_path: None,
            recipient: None,
            schema: None,
            data_format: "application/json".to_string(),
            data_cid: Cid::of_bytes(data).unwrap().to_string(),
            data_size: data.len() as u64,
            date_created,
            message_timestamp,
            published: false,
            date_published: None,
            parent_id: parent_id.map(str::to_string),
            tags: None,
        };
        let input = WriteInput { descriptor, record_id, context_id: None, data: data.to_vec(), attestation: None, protocol_role: None, delegated_grant_id: None };
        RecordsWriteMessage::create(input, key, KID).unwrap()
    }

    #[tokio::test]
    async fn update_changing_parent_id_is_rejected() {
        let eng = engine("immutable-parent");
        let key = signer();
        let t0 = Utc::now();
        let initial = write_with_parent(None, t0, t0, Some("parent-a"), b"v1", &key);
        let record_id = initial.record_id.clone();
        eng.write("did:example:alice", &initial, b"v1").await.unwrap();

        let bad_update = write_with_parent(Some(record_id), t0, t0 + chrono::Duration::seconds(1), Some("parent-b"), b"v2", &key);
        let err = eng.write("did:example:alice", &bad_update, b"v2").await.unwrap_err();
        assert!(matches!(err, Error::ImmutablePropertyChanged("parentId")));
    }
}
