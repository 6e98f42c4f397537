//! Component J (messages/events half): `MessagesGet`/`MessagesQuery`/
//! `MessagesSubscribe` and `EventsGet`/`EventsSubscribe`. These interfaces
//! never touch record lineage or protocol authorization -- they only
//! expose the event log (E) and, for `MessagesGet`, the raw block store,
//! gated by a grant instead of the owner/recipient/published union
//! `records.rs` uses.
//!
//! Grounded in `other_examples`'s vercre-dwn `messages/read.rs` (a grant
//! is required for any non-owner `MessagesGet`, checked by interface/
//! method/protocol scope match) generalized across all four methods.

use simple_database::database::{Filter, FiltersBuilder};
use simple_database::KeyValueStore;
use thiserror::Error as ThisError;

use crate::cid::Cid;
use crate::message::{Interface, Method};
use crate::permissions::PermissionsGrant;
use crate::store::event_log::{Event, EventLog};
use crate::store::message_store::{MessageStore, StoredMessage};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("a non-owner request requires an active grant")]
    GrantMissing,
    #[error(transparent)]
    Grant(#[from] crate::permissions::Error),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::GrantMissing => 401,
            Error::Grant(e) => e.status_code(),
            Error::Store(e) => e.status_code(),
        }
    }
}

/// Checks that a non-owner requester invoking `interface`/`method`
/// (optionally scoped to `protocol`, for a protocol-filtered
/// `MessagesQuery`) holds a covering grant. Owners bypass this entirely.
pub fn authorize_non_owner(
    grant: Option<&PermissionsGrant>,
    interface: Interface,
    method: Method,
    protocol: Option<&str>,
) -> Result<(), Error> {
    let grant = grant.ok_or(Error::GrantMissing)?;
    grant.permits(interface, method, protocol, None, None, None)?;
    Ok(())
}

pub struct MessagesEngine<KVS: KeyValueStore + 'static> {
    pub messages: std::sync::Arc<MessageStore<KVS>>,
    pub events: std::sync::Arc<EventLog<KVS>>,
}

impl<KVS: KeyValueStore + 'static> MessagesEngine<KVS> {
    /// `MessagesGet`: the full stored message (descriptor + authorization)
    /// for a known `messageCid`, or `None` if this tenant never accepted it.
    pub async fn get(&self, tenant: &str, message_cid: &Cid) -> Result<Option<StoredMessage>, Error> {
        Ok(self.messages.get(tenant, message_cid).await?)
    }

    /// `MessagesQuery`: every accepted message (any interface/method)
    /// whose descriptor matches `protocol`, if given, read from the event
    /// log so the result is a watermark-ordered change feed rather than an
    /// index scan.
    pub async fn query(&self, tenant: &str, protocol: Option<&str>, cursor: Option<&str>) -> Result<(Vec<Event>, Option<String>), Error> {
        let mut pairs = vec![];
        if let Some(p) = protocol {
            pairs.push(("protocol", Filter::equal(p.to_string())));
        }
        let filters = FiltersBuilder::build(pairs);
        Ok(self.events.query(tenant, &filters, cursor).await?)
    }

    /// `EventsGet`: every event at or after `cursor` (or all of them, with
    /// no cursor), exactly the log's own `query` with no descriptor filter.
    pub async fn events_get(&self, tenant: &str, cursor: Option<&str>) -> Result<(Vec<Event>, Option<String>), Error> {
        self.query(tenant, None, cursor).await
    }

    /// `MessagesSubscribe`/`EventsSubscribe`: a live feed of every event
    /// landing after this call. The caller narrows by `protocol` itself
    /// (mirrors `EventLog::subscribe`'s "callers test membership
    /// themselves" contract).
    pub async fn subscribe(&self, tenant: &str) -> Result<tokio::sync::broadcast::Receiver<Event>, Error> {
        Ok(self.events.subscribe(tenant).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn grant(protocol: Option<&str>) -> PermissionsGrant {
        use crate::message::Authorization;
        use crate::permissions::{GrantDescriptor, PermissionScope};
        PermissionsGrant {
            descriptor: GrantDescriptor {
                interface: Interface::Messages,
                method: Method::Subscribe,
                message_timestamp: Utc::now(),
                grantee: "did:example:bob".to_string(),
                date_expires: Utc::now() + Duration::days(1),
                delegated: false,
                description: None,
                scope: PermissionScope { interface: Some(Interface::Records), method: Some(Method::Write), protocol: protocol.map(str::to_string), ..Default::default() },
                conditions: None,
            },
            authorization: Authorization::default(),
        }
    }

    #[test]
    fn non_owner_without_grant_is_rejected() {
        assert!(authorize_non_owner(None, Interface::Records, Method::Write, None).is_err());
    }

    #[test]
    fn grant_scoped_to_other_protocol_is_rejected() {
        let g = grant(Some("https://example.com/p1"));
        let err = authorize_non_owner(Some(&g), Interface::Records, Method::Write, Some("https://example.com/p2")).unwrap_err();
        assert!(matches!(err, Error::Grant(crate::permissions::Error::ProtocolMismatch(..))));
    }

    #[test]
    fn grant_interface_mismatch_is_surfaced() {
        let g = grant(None);
        let err = authorize_non_owner(Some(&g), Interface::Messages, Method::Subscribe, None).unwrap_err();
        assert!(matches!(err, Error::Grant(crate::permissions::Error::ScopeMismatch(..))));
    }
}
