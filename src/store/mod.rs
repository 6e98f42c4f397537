//! Tenant-scoped persistence: the message store (C), data store (D), and
//! event log (E). All three are thin, DWN-specific layers over
//! `simple_database::Database`, the teacher's own indexed key/value
//! store abstraction (`dwn.rs`'s `private_database`/`public_database`
//! fields, `dwn/structs.rs`'s `Indexable` impls).

pub mod data_store;
pub mod event_log;
pub mod message_store;

use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] simple_database::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Cid(#[from] crate::cid::Error),
    #[error("malformed cursor")]
    BadCursor,
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::BadCursor => 400,
            _ => 500,
        }
    }
}

/// Encodes a store-native opaque cursor (itself the primary key of the
/// last row returned) as a URL-safe base64 string suitable for a reply's
/// `cursor` field.
pub fn encode_cursor(raw: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

pub fn decode_cursor(cursor: &str) -> Result<Vec<u8>, Error> {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| Error::BadCursor)
}
