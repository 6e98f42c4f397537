//! Component K: the pipeline dispatcher. A single entry point per
//! interface/method pair that authenticates the incoming message,
//! authorizes it (tenant ownership, protocol rules, or a permission
//! grant), hands it to its handler (records/protocols/permissions/
//! messages), and shapes the uniform `{status, entries?, data?, cursor?}`
//! reply every interface returns (§6).
//!
//! Grounded in the teacher's `Dwn::process_packet` (one method per
//! `DwnRequest` variant, routed to a handler, errors folded into a
//! reply envelope) and `other_examples`'s vercre-dwn `service/handle.rs`
//! dispatch-by-`(Interface, Method)` shape.

use chrono::Utc;
use simple_database::KeyValueStore;
use thiserror::Error as ThisError;

use crate::authorize::{self, ChainLink, ProtocolDefinition, WriteContext};
use crate::cid::Cid;
use crate::jws::DidResolver;
use crate::message::{Interface, Method};
use crate::messages::MessagesEngine;
use crate::permissions::{PermissionsEngine, PermissionsGrant, PermissionsRequest, PermissionsRevoke};
use crate::protocols::{ConfigureOutcome, ProtocolsConfigureMessage, ProtocolsEngine};
use crate::records::{DateSort, RecordsDeleteMessage, RecordsEngine, RecordsFilter, RecordsWriteDescriptor, RecordsWriteMessage, WriteOutcome};
use crate::store::data_store::DataStore;
use crate::store::event_log::{Event, EventLog};
use crate::store::message_store::{MessageStore, StoredMessage};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("message authentication failed")]
    Unauthenticated(#[source] crate::jws::Error),
    #[error("descriptorCid {expected} does not match the signed payload's {actual}")]
    DescriptorCidMismatch { expected: String, actual: String },
    #[error("attestationCid {expected} does not match the attestation's own {actual}")]
    AttestationCidMismatch { expected: String, actual: String },
    #[error("ancestor record {0} was not found")]
    ParentNotFound(String),
    #[error("empty filter objects are not permitted in a query")]
    EmptyFilter,
    #[error("protocol {0} is not installed")]
    ProtocolNotFound(String),
    #[error("subscribe requires an event stream, which this reply context does not have")]
    Unimplemented,
    #[error(transparent)]
    Protocol(#[from] authorize::Error),
    #[error(transparent)]
    Permissions(#[from] crate::permissions::Error),
    #[error(transparent)]
    Records(#[from] crate::records::Error),
    #[error(transparent)]
    Protocols(#[from] crate::protocols::Error),
    #[error(transparent)]
    Messages(#[from] crate::messages::Error),
    #[error(transparent)]
    Validation(#[from] crate::validator::Error),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Cid(#[from] crate::cid::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ParentNotFound(_) | Error::ProtocolNotFound(_) => 404,
            Error::Unauthenticated(e) => e.status_code(),
            Error::DescriptorCidMismatch { .. } | Error::AttestationCidMismatch { .. } | Error::EmptyFilter | Error::Validation(_) | Error::Json(_) => 400,
            Error::Unimplemented => 501,
            Error::Protocol(e) => e.status_code(),
            Error::Permissions(e) => e.status_code(),
            Error::Records(e) => e.status_code(),
            Error::Protocols(e) => e.status_code(),
            Error::Messages(e) => e.status_code(),
            Error::Store(e) => e.status_code(),
            Error::Cid(_) => 500,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Status {
    pub code: u16,
    pub detail: Option<String>,
}

#[derive(Default)]
pub struct Reply {
    pub status: Status,
    pub entries: Vec<StoredMessage>,
    pub events: Vec<Event>,
    pub data: Option<Vec<u8>>,
    pub cursor: Option<String>,
}

impl Reply {
    fn accepted(message_cid: &Cid) -> Reply {
        Reply { status: Status { code: 202, detail: Some(format!("accepted {message_cid}")) }, ..Default::default() }
    }

    fn conflict(winner: String) -> Reply {
        Reply { status: Status { code: 409, detail: Some(format!("superseded by {winner}")) }, ..Default::default() }
    }

    fn ok_entries(entries: Vec<StoredMessage>, cursor: Option<String>) -> Reply {
        Reply { status: Status { code: 200, detail: None }, entries, cursor, ..Default::default() }
    }
}

fn from_jws_error(e: crate::jws::Error) -> Error {
    Error::Unauthenticated(e)
}

/// Everything one tenant's pipeline needs, wired together the way
/// `Dwn::new` assembles the teacher's stores -- a message/data/event
/// triple plus the components layered on top of them.
pub struct Dwn<KVS: KeyValueStore + 'static> {
    pub records: RecordsEngine<KVS>,
    pub protocols: ProtocolsEngine<KVS>,
    pub permissions: PermissionsEngine<KVS>,
    pub messages: MessagesEngine<KVS>,
    pub resolver: Box<dyn DidResolver>,
}

impl<KVS: KeyValueStore + 'static> Dwn<KVS> {
    /// Every component shares one message index and one event log -- the
    /// whole point of `MessagesGet`/`MessagesQuery`/`EventsGet` is to see
    /// every interface's accepted messages, not just records. `config`
    /// defaults per [`crate::server::DwnConfig`] when omitted; `resolver`
    /// is wrapped in a [`crate::server::CachingResolver`] so repeated
    /// authentication of the same signer doesn't re-resolve its DID.
    pub fn new(root: std::path::PathBuf, resolver: Box<dyn DidResolver>, config: Option<crate::server::DwnConfig>) -> Self {
        let config = config.unwrap_or_default();
        let messages = std::sync::Arc::new(MessageStore::new(root.join("messages")));
        let events = std::sync::Arc::new(EventLog::new(root.join("events")));
        let data_store = DataStore::new(root.join("data"));
        let resolver: Box<dyn DidResolver> = Box::new(crate::server::CachingResolver::new(resolver, config.did_resolver_cache_ttl));
        Dwn {
            records: RecordsEngine { messages: messages.clone(), data: data_store },
            protocols: ProtocolsEngine { messages: messages.clone() },
            permissions: PermissionsEngine { messages: messages.clone() },
            messages: MessagesEngine { messages, events },
            resolver,
        }
    }

    fn author_did(kid: &str) -> String {
        kid.split('#').next().unwrap_or(kid).to_string()
    }

    /// 4.B: verifies every signature entry, then binds the author's
    /// signature to `descriptor` by recomputing its CID. Returns the
    /// author's DID alongside the signed payload so a caller can read
    /// whichever optional authorization-context fields it carries (a
    /// `protocolRole` being invoked, a `delegatedGrantId`).
    async fn authenticate<T: serde::Serialize>(
        &self,
        authorization: &crate::message::Authorization,
        descriptor: &T,
    ) -> Result<(String, crate::jws::SignaturePayload), Error> {
        authorization.signature.verify(&*self.resolver).await.map_err(from_jws_error)?;
        let payload = authorization.payload().map_err(from_jws_error)?;
        let expected = crate::message::descriptor_cid(descriptor)?.to_string();
        if payload.descriptor_cid != expected {
            return Err(Error::DescriptorCidMismatch { expected, actual: payload.descriptor_cid });
        }
        let kid = authorization.author_kid().map_err(from_jws_error)?;
        Ok((Self::author_did(&kid), payload))
    }

    /// Verifies a `RecordsWrite`'s optional attestation: its own signature
    /// entries must check out against the resolver, and its CID must match
    /// the `attestationCid` the author's signature bound into its payload
    /// -- otherwise an attestation could be swapped for an unrelated one
    /// without invalidating the author's own signature. The attestation
    /// never participates in authorization, only in integrity.
    async fn verify_attestation(&self, attestation: &crate::jws::GeneralJws, bound_cid: Option<&str>) -> Result<(), Error> {
        attestation.verify(&*self.resolver).await.map_err(from_jws_error)?;
        let actual = attestation.cid().map_err(from_jws_error)?.to_string();
        match bound_cid {
            Some(expected) if expected == actual => Ok(()),
            Some(expected) => Err(Error::AttestationCidMismatch { expected: expected.to_string(), actual }),
            None => Err(Error::AttestationCidMismatch { expected: String::new(), actual }),
        }
    }

    /// Resolves the authorization envelope's `delegatedGrantId`, if any,
    /// into the grant that licenses `signer` to act for its `grantor`
    /// (4.B/4.G delegation): the grant must be marked delegable, not
    /// expired, not revoked, and issued to `signer` as grantee. Returns
    /// the grantor DID -- the logical author for ownership checks --
    /// bounded by the grant's own scope, which the caller still applies.
    async fn resolve_delegation(&self, tenant: &str, signer: &str, delegated_grant_id: Option<&str>) -> Result<Option<(String, crate::permissions::PermissionsGrant)>, Error> {
        let Some(grant_id) = delegated_grant_id else { return Ok(None) };
        let grant = self.permissions.get_grant(tenant, grant_id).await?.ok_or_else(|| Error::Permissions(crate::permissions::Error::Expired(grant_id.to_string())))?;
        grant.check_delegable().map_err(Error::from)?;
        grant.check_not_expired(Utc::now()).map_err(Error::from)?;
        if self.permissions.grant_is_revoked(tenant, grant_id).await? {
            return Err(Error::Permissions(crate::permissions::Error::Revoked(grant_id.to_string())));
        }
        if grant.descriptor.grantee != signer {
            return Err(Error::Permissions(crate::permissions::Error::NotDelegable(grant_id.to_string())));
        }
        let grantor = grant.grantor().map_err(Error::from)?;
        Ok(Some((grantor, grant)))
    }

    async fn protocol_definition(&self, tenant: &str, protocol: &str) -> Result<ProtocolDefinition, Error> {
        let installed = self.protocols.query(tenant, Some(protocol), true).await?;
        let stored = installed.into_iter().next().ok_or_else(|| Error::ProtocolNotFound(protocol.to_string()))?;
        Ok(ProtocolsEngine::<KVS>::definition_of(&stored)?)
    }

    async fn chain_link(&self, tenant: &str, record_id: &str) -> Result<(ChainLink, Option<String>), Error> {
        let stored = self.records.read(tenant, record_id).await.map_err(|_| Error::ParentNotFound(record_id.to_string()))?;
        let descriptor: RecordsWriteDescriptor = serde_json::from_value(stored.descriptor.clone())?;
        let author = stored.index.get("author").and_then(|v| v.as_string()).cloned().unwrap_or_default();
        let context_id = stored.index.get("contextId").and_then(|v| v.as_string()).cloned().unwrap_or_default();
        let link = ChainLink {
            record_id: record_id.to_string(),
            protocol_path: descriptor.protocol_path.clone().unwrap_or_default(),
            context_id,
            author,
            recipient: descriptor.recipient.clone(),
        };
        Ok((link, descriptor.parent_id))
    }

    /// Walks `parentId` up to the root, returning ancestors root-first
    /// (4.H step 2). Cycles are impossible because a `parentId` must
    /// reference an already-stored record.
    async fn build_chain(&self, tenant: &str, parent_id: Option<&str>) -> Result<Vec<ChainLink>, Error> {
        let mut chain = Vec::new();
        let mut current = parent_id.map(str::to_string);
        while let Some(id) = current {
            let (link, next) = self.chain_link(tenant, &id).await?;
            current = next;
            chain.push(link);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Resolves a `$globalRole` invocation (4.H): `author` holds `role`
    /// if a role record exists at that `protocolPath`, addressed to
    /// `author` as recipient. A nested role path (e.g. `thread/participant`)
    /// is context-scoped -- the role record's own `contextId` must root
    /// `context_id` -- while a top-level path is protocol-wide and holds
    /// regardless of context, per spec.md's expanded role check.
    async fn role_granted(&self, tenant: &str, protocol: &str, role: &str, author: &str, context_id: &str) -> Result<bool, Error> {
        let filter = RecordsFilter { protocol: Some(protocol.to_string()), protocol_path: Some(role.to_string()), recipient: Some(author.to_string()), ..Default::default() };
        let (rows, _) = self.records.query(tenant, std::slice::from_ref(&filter), DateSort::MessageTimestamp, None, 1000, |_| true).await?;
        let context_scoped = role.contains('/');
        Ok(rows.iter().any(|row| {
            if !context_scoped {
                return true;
            }
            row.index.get("contextId").and_then(|v| v.as_string()).map(|c| context_id.starts_with(c.as_str())).unwrap_or(false)
        }))
    }

    /// 4.I step 1: owner writes need no protocol/grant check; everyone
    /// else is run through 4.H (if the record is protocol-scoped) or 4.G
    /// (if a `permissionGrantId` rides on the authorization envelope).
    /// `delegated_grant`, when present, bounds the whole check to that
    /// grant's scope regardless of who `author` resolved to (4.B/4.G
    /// delegation: a delegate never gets the owner bypass just because
    /// it is acting on the grantor's behalf).
    #[allow(clippy::too_many_arguments)]
    async fn authorize_write(
        &self,
        tenant: &str,
        author: &str,
        descriptor: &RecordsWriteDescriptor,
        record_id: &str,
        context_id: &str,
        is_initial: bool,
        invoked_role: Option<&str>,
        delegated_grant: Option<&crate::permissions::PermissionsGrant>,
    ) -> Result<(), Error> {
        if let Some(grant) = delegated_grant {
            grant.permits(Interface::Records, Method::Write, descriptor.protocol.as_deref(), Some(context_id), Some(record_id), descriptor.schema.as_deref())?;
            return Ok(());
        }
        if author == tenant {
            return Ok(());
        }
        if let Some(protocol) = &descriptor.protocol {
            let def = self.protocol_definition(tenant, protocol).await?;
            let parent = match &descriptor.parent_id {
                Some(p) => Some(self.chain_link(tenant, p).await?.0),
                None => None,
            };
            let chain = self.build_chain(tenant, descriptor.parent_id.as_deref()).await?;
            let role_granted = match invoked_role {
                Some(role) => self.role_granted(tenant, protocol, role, author, context_id).await?,
                None => false,
            };
            let ctx = WriteContext {
                protocol_path: descriptor.protocol_path.as_deref().unwrap_or_default(),
                schema: descriptor.schema.as_deref(),
                data_format: &descriptor.data_format,
                data_size: descriptor.data_size,
                tags: descriptor.tags.as_ref(),
                context_id,
                parent: parent.as_ref(),
                chain: &chain,
                author,
                recipient: descriptor.recipient.as_deref(),
                is_initial_write: is_initial,
                invoked_role,
                role_granted,
            };
            authorize::authorize_write(&def, &ctx)?;
            let _ = record_id;
            return Ok(());
        }
        // No protocol scope: only a permission grant can authorize a
        // non-owner write.
        let grant = self.permissions.find_active_grant(tenant, author, Interface::Records, Method::Write, Utc::now()).await?;
        let grant = grant.ok_or(crate::permissions::Error::Expired(String::new()))?;
        grant.permits(Interface::Records, Method::Write, descriptor.protocol.as_deref(), Some(context_id), Some(record_id), descriptor.schema.as_deref())?;
        Ok(())
    }

    /// `RecordsWrite`: validate, authenticate, authorize, then let
    /// `records.rs` resolve the conflict and (if this write wins) persist
    /// it and append an event.
    pub async fn records_write(&self, tenant: &str, msg: RecordsWriteMessage, data: Vec<u8>) -> Result<Reply, Error> {
        crate::validator::require_together(("protocol", msg.descriptor.protocol.is_some()), ("protocolPath", msg.descriptor.protocol_path.is_some()))?;
        if let Some(protocol) = &msg.descriptor.protocol {
            crate::validator::require_normalized("protocol", protocol)?;
        }
        if let Some(schema) = &msg.descriptor.schema {
            crate::validator::require_normalized("schema", schema)?;
        }
        let (signer, payload) = self.authenticate(&msg.authorization, &msg.descriptor).await?;
        if let Some(attestation) = &msg.attestation {
            self.verify_attestation(attestation, payload.attestation_cid.as_deref()).await?;
        }
        let delegation = self.resolve_delegation(tenant, &signer, payload.delegated_grant_id.as_deref()).await?;
        let author = delegation.as_ref().map(|(grantor, _)| grantor.clone()).unwrap_or_else(|| signer.clone());
        let is_initial = msg.is_initial_write()?;
        let context_id = msg.context_id.clone().unwrap_or_default();

        if is_initial {
            if let Some(parent_id) = &msg.descriptor.parent_id {
                self.records.read(tenant, parent_id).await.map_err(|_| Error::ParentNotFound(parent_id.clone()))?;
            }
        }

        self.authorize_write(
            tenant,
            &author,
            &msg.descriptor,
            &msg.record_id,
            &context_id,
            is_initial,
            payload.protocol_role.as_deref(),
            delegation.as_ref().map(|(_, g)| g),
        )
        .await?;

        match self.records.write(tenant, &msg, &data).await? {
            WriteOutcome::Accepted { message_cid } => {
                let mut idx = crate::store::event_log::index(vec![("recordId", msg.record_id.clone().into())]).map_err(Error::from)?;
                if let Some(protocol) = &msg.descriptor.protocol {
                    idx.insert("protocol".to_string(), protocol.clone().into());
                }
                self.messages.events.append(tenant, &message_cid, "Records", "Write", idx).await.map_err(Error::from)?;
                Ok(Reply::accepted(&message_cid))
            }
            WriteOutcome::Conflict { winner_message_cid } => Ok(Reply::conflict(winner_message_cid)),
        }
    }

    /// `RecordsDelete`: a tombstone write, otherwise handled identically
    /// to `RecordsWrite`'s conflict-resolution path.
    pub async fn records_delete(&self, tenant: &str, msg: RecordsDeleteMessage) -> Result<Reply, Error> {
        let (author, _payload) = self.authenticate(&msg.authorization, &msg.descriptor).await?;
        if author != tenant {
            let grant = self.permissions.find_active_grant(tenant, &author, Interface::Records, Method::Delete, Utc::now()).await?;
            let grant = grant.ok_or(crate::permissions::Error::Expired(String::new()))?;
            grant.permits(Interface::Records, Method::Delete, None, None, Some(&msg.descriptor.record_id), None)?;
        }
        let message_cid = msg.message_cid()?;
        self.records.delete(tenant, &msg).await?;
        let idx = crate::store::event_log::index(vec![("recordId", msg.descriptor.record_id.clone().into())]).map_err(Error::from)?;
        self.messages.events.append(tenant, &message_cid, "Records", "Delete", idx).await.map_err(Error::from)?;
        Ok(Reply::accepted(&message_cid))
    }

    /// `RecordsRead`: owners see anything; a non-owner must satisfy the
    /// same visibility union `records_query` uses, collapsed to a single
    /// record.
    pub async fn records_read(&self, tenant: &str, requester: Option<&str>, record_id: &str, invoked_role: Option<&str>) -> Result<Reply, Error> {
        let stored = self.records.read(tenant, record_id).await?;
        let is_owner = requester == Some(tenant);
        if !is_owner && !self.visible_to(tenant, requester, &stored, invoked_role, Method::Read).await? {
            return Err(Error::Records(crate::records::Error::NotFound(record_id.to_string())));
        }
        let data = self.records.read_data(tenant, &stored).await?;
        Ok(Reply { status: Status { code: 200, detail: None }, entries: vec![stored], data, ..Default::default() })
    }

    /// Whether `stored` is visible to `requester` under the 4.I non-owner
    /// union (published / addressed recipient or author / active grant /
    /// protocol role or action rule). Exposed so a `RecordsSubscribe`
    /// consumer can test membership itself against each event landing on
    /// the live feed, the same way [`crate::store::event_log::EventLog::subscribe`]
    /// expects callers to filter a single shared broadcast. `invoked_role`
    /// mirrors the `protocolRole` a live `RecordsSubscribe`/`RecordsQuery`
    /// invocation carries (4.H step 4): the caller is responsible for
    /// having already confirmed it holds that role (`role_granted`/
    /// [`Self::records_subscribe`] do this once, up front).
    pub async fn record_visible(&self, tenant: &str, requester: Option<&str>, stored: &StoredMessage, invoked_role: Option<&str>) -> Result<bool, Error> {
        if requester == Some(tenant) {
            return Ok(true);
        }
        self.visible_to(tenant, requester, stored, invoked_role, Method::Subscribe).await
    }

    async fn visible_to(&self, tenant: &str, requester: Option<&str>, stored: &StoredMessage, invoked_role: Option<&str>, method: Method) -> Result<bool, Error> {
        let published = stored.index.get("published").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false);
        if published {
            return Ok(true);
        }
        let Some(requester) = requester else { return Ok(false) };
        let recipient = stored.index.get("recipient").and_then(|v| v.as_string());
        if recipient.map(|r| r == requester).unwrap_or(false) {
            return Ok(true);
        }
        let author = stored.index.get("author").and_then(|v| v.as_string());
        if author.map(|a| a == requester).unwrap_or(false) {
            return Ok(true);
        }
        let protocol = stored.index.get("protocol").and_then(|v| v.as_string());
        let context_id = stored.index.get("contextId").and_then(|v| v.as_string());
        let record_id = stored.index.get("recordId").and_then(|v| v.as_string());
        let schema = stored.index.get("schema").and_then(|v| v.as_string());
        if let Some(grant) = self.permissions.find_active_grant(tenant, requester, Interface::Records, method, Utc::now()).await? {
            if grant
                .permits(Interface::Records, method, protocol.map(|s| s.as_str()), context_id.map(|s| s.as_str()), record_id.map(|s| s.as_str()), schema.map(|s| s.as_str()))
                .is_ok()
            {
                return Ok(true);
            }
        }
        if let Some(protocol) = protocol {
            if let Ok(def) = self.protocol_definition(tenant, protocol).await {
                let descriptor: RecordsWriteDescriptor = serde_json::from_value(stored.descriptor.clone())?;
                let context_id = context_id.cloned().unwrap_or_default();
                let chain = self.build_chain(tenant, descriptor.parent_id.as_deref()).await?;
                let role_granted = match invoked_role {
                    Some(role) => self.role_granted(tenant, protocol, role, requester, &context_id).await?,
                    None => false,
                };
                let ctx = WriteContext {
                    protocol_path: descriptor.protocol_path.as_deref().unwrap_or_default(),
                    schema: descriptor.schema.as_deref(),
                    data_format: &descriptor.data_format,
                    data_size: descriptor.data_size,
                    tags: descriptor.tags.as_ref(),
                    context_id: &context_id,
                    parent: chain.last(),
                    chain: &chain,
                    author: requester,
                    recipient: descriptor.recipient.as_deref(),
                    is_initial_write: false,
                    invoked_role,
                    role_granted,
                };
                if authorize::authorize_action(&def, method, &ctx).is_ok() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// `RecordsQuery`: compose the owner/non-owner visibility union over
    /// whatever `records.query` fetched for the bare filter.
    /// `filters` is 4.C's disjunction of conjunctions: every element is a
    /// conjunction of attribute predicates, ANDed internally; the reply is
    /// the union across elements. An empty filter list, or any element
    /// with no predicates at all, is rejected outright (4.F).
    pub async fn records_query(
        &self,
        tenant: &str,
        requester: Option<&str>,
        filters: &[RecordsFilter],
        date_sort: DateSort,
        cursor: Option<&str>,
        limit: usize,
        invoked_role: Option<&str>,
    ) -> Result<Reply, Error> {
        if filters.is_empty() || filters.iter().any(RecordsFilter::is_empty) {
            return Err(Error::EmptyFilter);
        }
        let is_owner = requester == Some(tenant);

        // The visibility predicate must itself await a grant/role lookup
        // per row; `records.query` takes a synchronous `Fn`, so pre-fetch
        // the unfiltered candidate set's worth of async state up front
        // isn't tractable generically -- instead fall back to publish/
        // recipient/author, which covers scenario 4, and layer protocol
        // role/grant visibility as a second pass over what's left out.
        let (rows, next) = self
            .records
            .query(tenant, filters, date_sort, cursor, limit, |row| {
                if is_owner {
                    return true;
                }
                let published = row.index.get("published").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false);
                let recipient = row.index.get("recipient").and_then(|v| v.as_string());
                let author = row.index.get("author").and_then(|v| v.as_string());
                published
                    || requester.map(|r| recipient.map(|x| x == r).unwrap_or(false)).unwrap_or(false)
                    || requester.map(|r| author.map(|x| x == r).unwrap_or(false)).unwrap_or(false)
            })
            .await?;

        log::debug!("records_query: tenant={tenant} first pass matched {} rows", rows.len());
        if is_owner {
            return Ok(Reply::ok_entries(rows, next));
        }

        // Second pass: candidates the first pass excluded (unpublished,
        // not addressed to or authored by the requester) may still be
        // visible via a grant or a protocol role/action rule. Every
        // leftover candidate's visibility check is independent, so they
        // run concurrently rather than one DID-resolution-bound await at
        // a time.
        let (all, _) = self.records.query(tenant, filters, date_sort, None, usize::MAX.min(10_000), |_| true).await?;
        let leftover: Vec<StoredMessage> = all.into_iter().filter(|row| !rows.iter().any(|r| r.message_cid == row.message_cid)).collect();
        let checks = leftover.iter().map(|row| self.visible_to(tenant, requester, row, invoked_role, Method::Query));
        let verdicts = futures::future::try_join_all(checks).await?;
        let extra: Vec<StoredMessage> = leftover.into_iter().zip(verdicts).filter_map(|(row, ok)| ok.then_some(row)).collect();

        let mut combined = rows;
        combined.extend(extra);
        Ok(Reply::ok_entries(combined, next))
    }

    pub async fn protocols_configure(&self, tenant: &str, msg: ProtocolsConfigureMessage) -> Result<Reply, Error> {
        crate::validator::require_normalized("protocol", &msg.descriptor.definition.protocol)?;
        let (author, _payload) = self.authenticate(&msg.authorization, &msg.descriptor).await?;
        if author != tenant {
            let grant = self.permissions.find_active_grant(tenant, &author, Interface::Protocols, Method::Configure, Utc::now()).await?;
            grant.ok_or(crate::permissions::Error::Expired(String::new()))?;
        }
        match self.protocols.configure(tenant, &msg).await? {
            ConfigureOutcome::Accepted { message_cid } => {
                let idx = crate::store::event_log::index(vec![("protocol", msg.descriptor.definition.protocol.clone().into())]).map_err(Error::from)?;
                self.messages.events.append(tenant, &message_cid, "Protocols", "Configure", idx).await.map_err(Error::from)?;
                Ok(Reply::accepted(&message_cid))
            }
            ConfigureOutcome::Conflict { winner_message_cid } => Ok(Reply::conflict(winner_message_cid)),
        }
    }

    pub async fn protocols_query(&self, tenant: &str, requester: Option<&str>, protocol: Option<&str>) -> Result<Reply, Error> {
        let owner_request = requester == Some(tenant);
        let rows = self.protocols.query(tenant, protocol, owner_request).await?;
        Ok(Reply::ok_entries(rows, None))
    }

    pub async fn permissions_grant(&self, tenant: &str, grant: PermissionsGrant) -> Result<Reply, Error> {
        if let Some(protocol) = &grant.descriptor.scope.protocol {
            crate::validator::require_normalized("scope.protocol", protocol)?;
        }
        let (author, _payload) = self.authenticate(&grant.authorization, &grant.descriptor).await?;
        if author != tenant {
            return Err(Error::Permissions(crate::permissions::Error::NotDelegable(author)));
        }
        let grant_id = self.permissions.store_grant(tenant, &grant).await?;
        let idx = crate::store::event_log::index(vec![("grantee", grant.descriptor.grantee.clone().into())]).map_err(Error::from)?;
        self.messages.events.append(tenant, &grant_id, "Permissions", "Grant", idx).await.map_err(Error::from)?;
        Ok(Reply::accepted(&grant_id))
    }

    pub async fn permissions_request(&self, tenant: &str, request: PermissionsRequest) -> Result<Reply, Error> {
        let (_author, _payload) = self.authenticate(&request.authorization, &request.descriptor).await?;
        let cid = self.permissions.store_request(tenant, &request).await?;
        let idx = crate::store::event_log::index(vec![("interface", request.descriptor.interface.to_string().into())]).map_err(Error::from)?;
        self.messages.events.append(tenant, &cid, "Permissions", "Request", idx).await.map_err(Error::from)?;
        Ok(Reply::accepted(&cid))
    }

    pub async fn permissions_revoke(&self, tenant: &str, revoke: PermissionsRevoke) -> Result<Reply, Error> {
        let (author, _payload) = self.authenticate(&revoke.authorization, &revoke.descriptor).await?;
        if author != tenant {
            return Err(Error::Permissions(crate::permissions::Error::NotDelegable(author)));
        }
        let cid = self.permissions.store_revoke(tenant, &revoke).await?;
        let idx = crate::store::event_log::index(vec![("permissionGrantId", revoke.descriptor.permission_grant_id.clone().into())]).map_err(Error::from)?;
        self.messages.events.append(tenant, &cid, "Permissions", "Revoke", idx).await.map_err(Error::from)?;
        Ok(Reply::accepted(&cid))
    }

    pub async fn messages_get(&self, tenant: &str, requester: &str, message_cid: &Cid) -> Result<Reply, Error> {
        if requester != tenant {
            let active = self.permissions.find_active_grant(tenant, requester, Interface::Messages, Method::Get, Utc::now()).await?;
            crate::messages::authorize_non_owner(active.as_ref(), Interface::Messages, Method::Get, None)?;
        }
        match self.messages.get(tenant, message_cid).await.map_err(Error::from)? {
            Some(stored) => Ok(Reply { status: Status { code: 200, detail: None }, entries: vec![stored], ..Default::default() }),
            None => Ok(Reply { status: Status { code: 404, detail: None }, ..Default::default() }),
        }
    }

    pub async fn messages_query(&self, tenant: &str, requester: &str, protocol: Option<&str>, cursor: Option<&str>) -> Result<Reply, Error> {
        if requester != tenant {
            let active = self.permissions.find_active_grant(tenant, requester, Interface::Messages, Method::Query, Utc::now()).await?;
            crate::messages::authorize_non_owner(active.as_ref(), Interface::Messages, Method::Query, protocol)?;
        }
        let (events, next) = self.messages.query(tenant, protocol, cursor).await.map_err(Error::from)?;
        Ok(Reply { status: Status { code: 200, detail: None }, events, cursor: next, ..Default::default() })
    }

    pub async fn events_get(&self, tenant: &str, requester: &str, cursor: Option<&str>) -> Result<Reply, Error> {
        if requester != tenant {
            let active = self.permissions.find_active_grant(tenant, requester, Interface::Events, Method::Get, Utc::now()).await?;
            crate::messages::authorize_non_owner(active.as_ref(), Interface::Events, Method::Get, None)?;
        }
        let (events, next) = self.messages.events_get(tenant, cursor).await.map_err(Error::from)?;
        Ok(Reply { status: Status { code: 200, detail: None }, events, cursor: next, ..Default::default() })
    }

    /// `RecordsSubscribe`/`MessagesSubscribe`/`EventsSubscribe` all ride
    /// the same underlying per-tenant feed; unlike `*Get`/`*Query` this
    /// cannot be expressed as a `Reply` (no single response, just a
    /// stream). Kept as a low-level entry point for embedders that want
    /// the raw feed with no per-method gate (e.g. the tenant owner's own
    /// dashboard); non-owner requesters should use the method-specific
    /// variants below instead, which apply 4.I/4.H/4.G's authorization
    /// before handing back a receiver.
    pub async fn subscribe(&self, tenant: &str) -> Result<tokio::sync::broadcast::Receiver<Event>, Error> {
        self.messages.subscribe(tenant).await.map_err(Error::from)
    }

    /// `RecordsSubscribe`: any requester may attach -- what actually
    /// crosses the feed is gated per event by [`Self::record_visible`],
    /// mirroring `records_query`'s owner/published/recipient/author/
    /// grant/role union. `invoked_role`, if set, is validated once up
    /// front against `protocol` so a subscriber can't claim a role it
    /// doesn't hold just to widen what it expects to see.
    pub async fn records_subscribe(
        &self,
        tenant: &str,
        requester: Option<&str>,
        protocol: Option<&str>,
        invoked_role: Option<&str>,
    ) -> Result<tokio::sync::broadcast::Receiver<Event>, Error> {
        if let (Some(protocol), Some(role), Some(requester)) = (protocol, invoked_role, requester) {
            if requester != tenant && !self.role_granted(tenant, protocol, role, requester, "").await? {
                return Err(Error::Protocol(authorize::Error::RoleNotHeld(role.to_string())));
            }
        }
        self.subscribe(tenant).await
    }

    /// `MessagesSubscribe`: a non-owner requester must hold an active
    /// `{Messages, Subscribe}`-scoped grant (scenario 6: a grant scoped to
    /// a different interface/method is rejected with `GrantInterfaceMismatch`/
    /// `GrantMethodMismatch` before a receiver is ever handed back).
    pub async fn messages_subscribe(&self, tenant: &str, requester: &str) -> Result<tokio::sync::broadcast::Receiver<Event>, Error> {
        if requester != tenant {
            let active = self.permissions.find_active_grant(tenant, requester, Interface::Messages, Method::Subscribe, Utc::now()).await?;
            crate::messages::authorize_non_owner(active.as_ref(), Interface::Messages, Method::Subscribe, None)?;
        }
        self.subscribe(tenant).await
    }

    /// `EventsSubscribe`: same grant gate as `EventsGet`.
    pub async fn events_subscribe(&self, tenant: &str, requester: &str) -> Result<tokio::sync::broadcast::Receiver<Event>, Error> {
        if requester != tenant {
            let active = self.permissions.find_active_grant(tenant, requester, Interface::Events, Method::Subscribe, Utc::now()).await?;
            crate::messages::authorize_non_owner(active.as_ref(), Interface::Events, Method::Subscribe, None)?;
        }
        self.subscribe(tenant).await
    }
}
