//! Component J (protocols half): `ProtocolsConfigure`/`ProtocolsQuery`.
//! One current configuration per `protocol` per tenant; a later
//! `ProtocolsConfigure` for the same `protocol` replaces the old one
//! outright rather than joining a lineage the way `RecordsWrite` does.
//!
//! Grounded in `other_examples`'s vercre-dwn `protocols/configure.rs`
//! (`handle`'s "fetch existing, keep if newest, delete the rest" shape)
//! with the tiebreak resolved per spec.md open question 1: identical
//! `messageTimestamp` is broken by the lexicographically larger
//! `messageCid`, matching `records.rs`'s own `compare`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simple_database::database::{Filter, FiltersBuilder, SortOptions};
use simple_database::KeyValueStore;
use thiserror::Error as ThisError;

use crate::authorize::ProtocolDefinition;
use crate::cid::Cid;
use crate::message::Authorization;
use crate::store::message_store::{index, MessageStore, StoredMessage};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("protocol {0} is not installed")]
    NotFound(String),
    #[error("configuration for protocol {0} is superseded by a newer entry")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Cid(#[from] crate::cid::Error),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Store(e) => e.status_code(),
            Error::Cid(_) => 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigureDescriptor {
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: DateTime<Utc>,
    pub definition: ProtocolDefinition,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProtocolsConfigureMessage {
    pub descriptor: ConfigureDescriptor,
    pub authorization: Authorization,
}

impl ProtocolsConfigureMessage {
    pub fn message_cid(&self) -> Result<Cid, crate::cid::Error> {
        crate::message::message_cid(&self.descriptor, Some(&self.authorization))
    }
}

pub struct ProtocolsEngine<KVS: KeyValueStore + 'static> {
    pub messages: std::sync::Arc<MessageStore<KVS>>,
}

pub enum ConfigureOutcome {
    Accepted { message_cid: Cid },
    Conflict { winner_message_cid: String },
}

impl<KVS: KeyValueStore + 'static> ProtocolsEngine<KVS> {
    async fn installed(&self, tenant: &str, protocol: &str) -> Result<Vec<StoredMessage>, Error> {
        let filters = FiltersBuilder::build(vec![
            ("interface", Filter::equal("Protocols".to_string())),
            ("method", Filter::equal("Configure".to_string())),
            ("protocol", Filter::equal(protocol.to_string())),
        ]);
        let (rows, _) = self.messages.query(tenant, &filters, SortOptions::new("messageTimestamp")).await?;
        Ok(rows)
    }

    /// Installs or replaces the configuration for `msg.descriptor.definition.protocol`.
    /// Every prior configuration for the same protocol is deleted outright
    /// (protocols have no lineage the way records do) unless the incoming
    /// message loses the tiebreak, in which case nothing changes.
    pub async fn configure(&self, tenant: &str, msg: &ProtocolsConfigureMessage) -> Result<ConfigureOutcome, Error> {
        let message_cid = msg.message_cid()?;
        let protocol = &msg.descriptor.definition.protocol;
        let existing = self.installed(tenant, protocol).await?;

        for prior in &existing {
            let prior_ts = prior.index.get("messageTimestamp").and_then(|v| v.as_u64()).copied().unwrap_or(0);
            let new_ts = msg.descriptor.message_timestamp.timestamp() as u64;
            let newer = (new_ts, message_cid.as_str()) > (prior_ts, prior.message_cid.as_str());
            if !newer {
                return Ok(ConfigureOutcome::Conflict { winner_message_cid: prior.message_cid.clone() });
            }
        }

        let mut idx = index(vec![
            ("protocol", protocol.clone().into()),
            ("published", msg.descriptor.definition.published.to_string().into()),
            ("messageTimestamp", msg.descriptor.message_timestamp.timestamp().into()),
        ])?;
        idx.insert("messageTimestamp".to_string(), (msg.descriptor.message_timestamp.timestamp() as u64).into());

        self.messages
            .put(
                tenant,
                &message_cid,
                "Protocols",
                "Configure",
                serde_json::to_value(&msg.descriptor)?,
                Some(msg.authorization.signature.clone()),
                None,
                idx,
            )
            .await?;

        for prior in &existing {
            self.messages.delete(tenant, &prior.message_cid.parse()?).await?;
        }

        Ok(ConfigureOutcome::Accepted { message_cid })
    }

    /// `protocol` narrows to a single installed definition; omitted, every
    /// definition is returned, filtered to `published=true` ones for an
    /// anonymous (non-owner) requester.
    pub async fn query(&self, tenant: &str, protocol: Option<&str>, owner_request: bool) -> Result<Vec<StoredMessage>, Error> {
        let mut pairs = vec![
            ("interface", Filter::equal("Protocols".to_string())),
            ("method", Filter::equal("Configure".to_string())),
        ];
        if let Some(p) = protocol {
            pairs.push(("protocol", Filter::equal(p.to_string())));
        }
        let filters = FiltersBuilder::build(pairs);
        let (rows, _) = self.messages.query(tenant, &filters, SortOptions::new("messageTimestamp")).await?;
        Ok(if owner_request {
            rows
        } else {
            rows.into_iter()
                .filter(|r| r.index.get("published").and_then(|v| v.as_string()).map(|s| s == "true").unwrap_or(false))
                .collect()
        })
    }

    pub fn definition_of(stored: &StoredMessage) -> Result<ProtocolDefinition, Error> {
        let descriptor: ConfigureDescriptor = serde_json::from_value(stored.descriptor.clone())?;
        Ok(descriptor.definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jws::{GeneralJws, SignaturePayload, SigningKey};
    use ed25519_dalek::SigningKey as EdSigningKey;
    use rand::rngs::OsRng;
    use simple_database::MemoryStore;
    use std::collections::HashMap;

    fn signed(protocol: &str, ts: DateTime<Utc>) -> ProtocolsConfigureMessage {
        let signing = EdSigningKey::generate(&mut OsRng);
        let key = SigningKey::Ed25519(Box::new(signing));
        let kid = "did:example:alice#key-1";
        let definition = ProtocolDefinition { protocol: protocol.to_string(), published: true, types: HashMap::new(), structure: HashMap::new() };
        let descriptor = ConfigureDescriptor { message_timestamp: ts, definition };
        let descriptor_cid = crate::message::descriptor_cid(&descriptor).unwrap();
        let payload = SignaturePayload { descriptor_cid: descriptor_cid.to_string(), ..Default::default() };
        let jws = GeneralJws::sign(&key, kid, &payload).unwrap();
        ProtocolsConfigureMessage { descriptor, authorization: Authorization { signature: jws, owner_signature: None } }
    }

    #[tokio::test]
    async fn later_configure_replaces_earlier() {
        let engine = ProtocolsEngine::<MemoryStore> { messages: std::sync::Arc::new(MessageStore::new(std::path::PathBuf::from("test-protocols"))) };
        let t0 = Utc::now();
        let first = signed("https://example.com/proto", t0);
        let second = signed("https://example.com/proto", t0 + chrono::Duration::seconds(1));

        engine.configure("did:example:alice", &first).await.unwrap();
        let outcome = engine.configure("did:example:alice", &second).await.unwrap();
        assert!(matches!(outcome, ConfigureOutcome::Accepted { .. }));

        let installed = engine.installed("did:example:alice", "https://example.com/proto").await.unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].message_cid, second.message_cid().unwrap().to_string());
    }

    #[tokio::test]
    async fn older_configure_is_rejected() {
        let engine = ProtocolsEngine::<MemoryStore> { messages: std::sync::Arc::new(MessageStore::new(std::path::PathBuf::from("test-protocols-2"))) };
        let t0 = Utc::now();
        let first = signed("https://example.com/proto", t0 + chrono::Duration::seconds(1));
        let second = signed("https://example.com/proto", t0);

        engine.configure("did:example:alice", &first).await.unwrap();
        let outcome = engine.configure("did:example:alice", &second).await.unwrap();
        assert!(matches!(outcome, ConfigureOutcome::Conflict { .. }));
    }
}
