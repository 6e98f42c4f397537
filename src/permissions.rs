//! Component G: permission grants, requests, and revocations. A grant
//! authorizes a grantee to invoke one interface/method against a
//! tenant's DWN within a scope (optionally narrowed to a protocol,
//! context, record, or schema); a revocation referenced by the grant's
//! own `messageCid` (its `permissionGrantId`) retroactively invalidates
//! it for everything authorized after the revocation lands.
//!
//! The scope/grant/revoke shape is this crate's own -- the teacher's
//! `dwn/permission.rs` models a different, capability-key based scheme
//! (`PermissionOptions`/`Key::derive_usize`) that doesn't fit a DID-
//! addressed grantee model, so only its validate-by-field-comparison
//! texture carries over here, not its key-derivation semantics.
//! Delegation (a grantee invoking a grant on the grantor's behalf, with
//! the grant itself riding along on the authorization envelope) is
//! grounded in the teacher's `AuthorizationModel`/`RecordsWrite::sign`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::cid::Cid;
use crate::message::{Authorization, Interface, Method};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("grant {0} has expired")]
    Expired(String),
    #[error("grant {0} has been revoked")]
    Revoked(String),
    #[error("grant {0} does not authorize {1} {2}")]
    ScopeMismatch(String, Interface, Method),
    #[error("grant {0} is scoped to protocol {1}, request did not match")]
    ProtocolMismatch(String, String),
    #[error("grant {0} is scoped to a different context or record")]
    ContextMismatch(String),
    #[error("grant {0} is not delegable")]
    NotDelegable(String),
    #[error(transparent)]
    Cid(#[from] crate::cid::Error),
    #[error(transparent)]
    Jws(#[from] crate::jws::Error),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Cid(_) => 500,
            Error::Jws(e) => e.status_code(),
            Error::Store(e) => e.status_code(),
            Error::Json(_) => 400,
            _ => 401,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PermissionScope {
    pub interface: Option<Interface>,
    pub method: Option<Method>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "contextId", skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(rename = "recordId", skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(rename = "protocolRole", skip_serializing_if = "Option::is_none")]
    pub protocol_role: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conditions {
    /// If set, every write authorized by this grant must itself be
    /// published (prevents a grantee from writing private data under a
    /// grant meant only for public contributions).
    #[serde(rename = "publicationRequired", default)]
    pub publication_required: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GrantDescriptor {
    pub interface: Interface,
    pub method: Method,
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: DateTime<Utc>,
    pub grantee: String,
    #[serde(rename = "dateExpires")]
    pub date_expires: DateTime<Utc>,
    #[serde(default)]
    pub delegated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub scope: PermissionScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionsGrant {
    pub descriptor: GrantDescriptor,
    pub authorization: Authorization,
}

impl PermissionsGrant {
    pub fn grant_id(&self) -> Result<Cid, Error> {
        Ok(crate::message::message_cid(&self.descriptor, Some(&self.authorization))?)
    }

    pub fn grantor(&self) -> Result<String, Error> {
        Ok(self.authorization.author_kid()?.split('#').next().unwrap_or_default().to_string())
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.descriptor.date_expires
    }

    /// Checks whether this grant covers invoking `interface`/`method`
    /// under the given optional protocol/context/record/schema. Does
    /// not check revocation or expiry -- callers that have fetched the
    /// grant from the store should check `revoked` separately, since
    /// that requires a store lookup this pure function doesn't have
    /// access to.
    pub fn permits(
        &self,
        interface: Interface,
        method: Method,
        protocol: Option<&str>,
        context_id: Option<&str>,
        record_id: Option<&str>,
        schema: Option<&str>,
    ) -> Result<(), Error> {
        let grant_id = self.grant_id()?.to_string();
        if self.descriptor.scope.interface.map(|i| i != interface).unwrap_or(false)
            || self.descriptor.scope.method.map(|m| m != method).unwrap_or(false)
        {
            return Err(Error::ScopeMismatch(grant_id, interface, method));
        }
        if let Some(p) = &self.descriptor.scope.protocol {
            match protocol {
                Some(req) if req == p => {}
                _ => return Err(Error::ProtocolMismatch(grant_id, p.clone())),
            }
        }
        if let Some(c) = &self.descriptor.scope.context_id {
            if context_id.map(|req| !req.starts_with(c.as_str())).unwrap_or(true) {
                return Err(Error::ContextMismatch(grant_id));
            }
        }
        if let Some(r) = &self.descriptor.scope.record_id {
            if record_id != Some(r.as_str()) {
                return Err(Error::ContextMismatch(grant_id));
            }
        }
        if let Some(s) = &self.descriptor.scope.schema {
            if schema != Some(s.as_str()) {
                return Err(Error::ContextMismatch(grant_id));
            }
        }
        Ok(())
    }

    pub fn check_not_expired(&self, now: DateTime<Utc>) -> Result<(), Error> {
        if self.is_expired(now) {
            return Err(Error::Expired(self.grant_id()?.to_string()));
        }
        Ok(())
    }

    pub fn check_delegable(&self) -> Result<(), Error> {
        if !self.descriptor.delegated {
            return Err(Error::NotDelegable(self.grant_id().map(|c| c.to_string()).unwrap_or_default()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RevokeDescriptor {
    pub interface: Interface,
    pub method: Method,
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: DateTime<Utc>,
    #[serde(rename = "permissionGrantId")]
    pub permission_grant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionsRevoke {
    pub descriptor: RevokeDescriptor,
    pub authorization: Authorization,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub interface: Interface,
    pub method: Method,
    #[serde(rename = "messageTimestamp")]
    pub message_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub scope: PermissionScope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionsRequest {
    pub descriptor: RequestDescriptor,
    pub authorization: Authorization,
}

/// Stores and resolves grants/revocations the way any other message is
/// stored, keyed by `grantee`/`interface`/`method` so a candidate
/// message's authorization step can look up its covering grant without
/// scanning every grant a tenant has ever issued.
pub struct PermissionsEngine<KVS: simple_database::KeyValueStore + 'static> {
    pub messages: std::sync::Arc<crate::store::message_store::MessageStore<KVS>>,
}

impl<KVS: simple_database::KeyValueStore + 'static> PermissionsEngine<KVS> {
    pub async fn store_grant(&self, tenant: &str, grant: &PermissionsGrant) -> Result<Cid, Error> {
        let grant_id = grant.grant_id()?;
        let index = crate::store::message_store::index(vec![
            ("grantee", grant.descriptor.grantee.clone().into()),
            ("interface", grant.descriptor.interface.to_string().into()),
            ("method", grant.descriptor.method.to_string().into()),
            ("messageTimestamp", grant.descriptor.message_timestamp.timestamp().into()),
            ("grantId", grant_id.to_string().into()),
        ])
        .map_err(crate::store::Error::from)?;
        self.messages
            .put(tenant, &grant_id, "Permissions", "Grant", serde_json::to_value(&grant.descriptor)?, Some(grant.authorization.signature.clone()), None, index)
            .await
            .map_err(crate::store::Error::from)?;
        Ok(grant_id)
    }

    pub async fn store_revoke(&self, tenant: &str, revoke: &PermissionsRevoke) -> Result<Cid, Error> {
        let revoke_cid = crate::message::message_cid(&revoke.descriptor, Some(&revoke.authorization))?;
        let index = crate::store::message_store::index(vec![
            ("permissionGrantId", revoke.descriptor.permission_grant_id.clone().into()),
            ("messageTimestamp", revoke.descriptor.message_timestamp.timestamp().into()),
        ])
        .map_err(crate::store::Error::from)?;
        self.messages
            .put(tenant, &revoke_cid, "Permissions", "Revoke", serde_json::to_value(&revoke.descriptor)?, Some(revoke.authorization.signature.clone()), None, index)
            .await
            .map_err(crate::store::Error::from)?;
        Ok(revoke_cid)
    }

    /// `PermissionsRequest`: stored like any other message so a grantor
    /// can discover it via `MessagesQuery`/`MessagesGet`, the same way a
    /// `PermissionsGrant` is stored. A request carries no scope match of
    /// its own to perform -- it is a proposal the grantor reads and acts
    /// on by issuing (or declining to issue) a `PermissionsGrant`.
    pub async fn store_request(&self, tenant: &str, request: &PermissionsRequest) -> Result<Cid, Error> {
        let request_cid = crate::message::message_cid(&request.descriptor, Some(&request.authorization))?;
        let index = crate::store::message_store::index(vec![
            ("interface", request.descriptor.interface.to_string().into()),
            ("method", request.descriptor.method.to_string().into()),
            ("messageTimestamp", request.descriptor.message_timestamp.timestamp().into()),
        ])
        .map_err(crate::store::Error::from)?;
        self.messages
            .put(tenant, &request_cid, "Permissions", "Request", serde_json::to_value(&request.descriptor)?, Some(request.authorization.signature.clone()), None, index)
            .await
            .map_err(crate::store::Error::from)?;
        Ok(request_cid)
    }

    /// Fetches a grant by its own `messageCid` (the `permissionGrantId`
    /// a `delegatedGrantId`/`PermissionsRevoke` references), for callers
    /// that already know which grant they mean rather than searching by
    /// grantee (4.B's delegated-grant path).
    pub async fn get_grant(&self, tenant: &str, grant_id: &str) -> Result<Option<PermissionsGrant>, Error> {
        let Ok(cid) = grant_id.parse() else { return Ok(None) };
        let Some(row) = self.messages.get(tenant, &cid).await.map_err(crate::store::Error::from)? else { return Ok(None) };
        if row.interface != "Permissions" || row.method != "Grant" {
            return Ok(None);
        }
        let descriptor: GrantDescriptor = serde_json::from_value(row.descriptor)?;
        Ok(Some(PermissionsGrant {
            descriptor,
            authorization: Authorization { signature: row.authorization.unwrap_or_default(), owner_signature: None },
        }))
    }

    pub async fn grant_is_revoked(&self, tenant: &str, grant_id: &str) -> Result<bool, Error> {
        self.is_revoked(tenant, grant_id).await
    }

    async fn is_revoked(&self, tenant: &str, grant_id: &str) -> Result<bool, Error> {
        use simple_database::database::{Filter, FiltersBuilder, SortOptions};
        let filters = FiltersBuilder::build(vec![
            ("interface", Filter::equal("Permissions".to_string())),
            ("method", Filter::equal("Revoke".to_string())),
            ("permissionGrantId", Filter::equal(grant_id.to_string())),
        ]);
        let (rows, _) = self.messages.query(tenant, &filters, SortOptions::new("messageTimestamp")).await.map_err(crate::store::Error::from)?;
        Ok(!rows.is_empty())
    }

    /// Finds the latest non-expired, non-revoked grant authorizing
    /// `grantee` to invoke `interface`/`method` (optionally scoped to
    /// `protocol`), the lookup 4.G's authorization step needs before it
    /// can call `PermissionsGrant::permits`.
    pub async fn find_active_grant(
        &self,
        tenant: &str,
        grantee: &str,
        interface: Interface,
        method: Method,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionsGrant>, Error> {
        use simple_database::database::{Filter, FiltersBuilder, SortOptions};
        let filters = FiltersBuilder::build(vec![
            ("interface", Filter::equal("Permissions".to_string())),
            ("method", Filter::equal("Grant".to_string())),
            ("grantee", Filter::equal(grantee.to_string())),
        ]);
        let (mut rows, _) = self
            .messages
            .query(tenant, &filters, SortOptions::new("messageTimestamp"))
            .await
            .map_err(crate::store::Error::from)?;
        rows.sort_by(|a, b| {
            let a_ts = a.index.get("messageTimestamp").and_then(|v| v.as_u64()).copied().unwrap_or(0);
            let b_ts = b.index.get("messageTimestamp").and_then(|v| v.as_u64()).copied().unwrap_or(0);
            b_ts.cmp(&a_ts)
        });

        for row in rows {
            let descriptor: GrantDescriptor = serde_json::from_value(row.descriptor.clone())?;
            if descriptor.interface != interface || descriptor.method != method {
                continue;
            }
            let grant = PermissionsGrant {
                descriptor,
                authorization: crate::message::Authorization { signature: row.authorization.clone().unwrap_or_default(), owner_signature: None },
            };
            if grant.is_expired(now) {
                continue;
            }
            if self.is_revoked(tenant, &grant.grant_id()?.to_string()).await? {
                continue;
            }
            return Ok(Some(grant));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(scope: PermissionScope, expires_in: Duration) -> PermissionsGrant {
        PermissionsGrant {
            descriptor: GrantDescriptor {
                interface: Interface::Records,
                method: Method::Grant,
                message_timestamp: Utc::now(),
                grantee: "did:example:bob".to_string(),
                date_expires: Utc::now() + expires_in,
                delegated: false,
                description: None,
                scope,
                conditions: None,
            },
            authorization: Authorization::default(),
        }
    }

    #[test]
    fn permits_matching_scope() {
        let g = grant(
            PermissionScope {
                interface: Some(Interface::Records),
                method: Some(Method::Write),
                protocol: Some("https://example.com/proto".to_string()),
                ..Default::default()
            },
            Duration::days(1),
        );
        assert!(g
            .permits(Interface::Records, Method::Write, Some("https://example.com/proto"), None, None, None)
            .is_ok());
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let g = grant(
            PermissionScope {
                interface: Some(Interface::Records),
                method: Some(Method::Write),
                protocol: Some("https://example.com/proto".to_string()),
                ..Default::default()
            },
            Duration::days(1),
        );
        assert!(g.permits(Interface::Records, Method::Write, Some("https://example.com/other"), None, None, None).is_err());
    }

    #[test]
    fn expiry_is_checked_separately() {
        let g = grant(PermissionScope::default(), Duration::seconds(-1));
        assert!(g.check_not_expired(Utc::now()).is_err());
    }

    #[test]
    fn non_delegated_grant_rejects_delegation() {
        let g = grant(PermissionScope::default(), Duration::days(1));
        assert!(g.check_delegable().is_err());
    }
}
