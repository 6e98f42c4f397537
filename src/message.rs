//! Shared message envelope: the `interface`/`method` vocabulary, the
//! authorization wrapper every message carries, and the CID bindings
//! (`descriptorCid`, `messageCid`) that tie a signature to its
//! descriptor. Grounded in the teacher's `dwn/records_write.rs`
//! (`DwnInterfaceName`, `DwnMethodName`, `AuthorizationModel`,
//! `EntryIdInput`).

use serde::{Deserialize, Serialize};

use crate::cid::{Cid, Error};
use crate::jws::{GeneralJws, SignaturePayload};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interface {
    Records,
    Protocols,
    Permissions,
    Messages,
    Events,
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Interface::Records => "Records",
            Interface::Protocols => "Protocols",
            Interface::Permissions => "Permissions",
            Interface::Messages => "Messages",
            Interface::Events => "Events",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Write,
    Query,
    Read,
    Delete,
    Subscribe,
    Configure,
    Grant,
    Request,
    Revoke,
    Get,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The signature envelope attached to a message: the author's signature
/// over `descriptorCid` (plus whichever optional context fields apply),
/// an optional owner "co-signature" asserting tenant custody, and an
/// optional attestation -- a signature that is verified but never
/// consulted for authorization, per 4.B.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Authorization {
    pub signature: GeneralJws,
    #[serde(rename = "ownerSignature", skip_serializing_if = "Option::is_none")]
    pub owner_signature: Option<GeneralJws>,
}

impl Authorization {
    pub fn payload(&self) -> Result<SignaturePayload, crate::jws::Error> {
        self.signature.payload()
    }

    pub fn author_kid(&self) -> Result<String, crate::jws::Error> {
        self.signature.signer_kid()
    }
}

/// CID of a descriptor, encoded canonically as DAG-CBOR.
pub fn descriptor_cid<T: Serialize>(descriptor: &T) -> Result<Cid, Error> {
    Ok(Cid::of_dag_cbor(descriptor)?)
}

/// CID of the whole message (descriptor + authorization), used as the
/// `messageCid` identifying an entry in the message store and event
/// log.
pub fn message_cid<T: Serialize>(descriptor: &T, authorization: Option<&Authorization>) -> Result<Cid, Error> {
    #[derive(Serialize)]
    struct Envelope<'a, T> {
        descriptor: &'a T,
        #[serde(skip_serializing_if = "Option::is_none")]
        authorization: Option<&'a Authorization>,
    }
    Ok(Cid::of_dag_cbor(&Envelope { descriptor, authorization })?)
}

/// Derives a `recordId` from the author and descriptor of an *initial*
/// write, mirroring the teacher's `EntryIdInput` (author prepended to
/// the descriptor before hashing, so two authors writing bit-identical
/// descriptors never collide on `recordId`).
pub fn entry_id<T: Serialize>(author: &str, descriptor: &T) -> Result<Cid, Error> {
    #[derive(Serialize)]
    struct EntryIdInput<'a, T> {
        author: &'a str,
        descriptor: &'a T,
    }
    Ok(Cid::of_dag_cbor(&EntryIdInput { author, descriptor })?)
}
