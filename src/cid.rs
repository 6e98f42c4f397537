//! Content addressing: canonical DAG-CBOR encoding and CIDv1/SHA-256
//! derivation, grounded in the teacher's `Cid::dagcbor_cid` (which builds
//! a `libipld::cid::Cid::new_v1(0x71, multihash::Code::Sha2_256.digest(..))`
//! over the same descriptor/payload shapes we bind here).

use cid::Cid as Cidv1;
use multihash::Multihash;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error as ThisError;

/// Multicodec for dag-cbor.
const DAG_CBOR_CODEC: u64 = 0x71;
/// Multicodec for raw binary.
const RAW_CODEC: u64 = 0x55;
/// Multihash function code for sha2-256.
const SHA2_256: u64 = 0x12;

/// Errors from canonical encoding and content-address derivation --
/// the leaf error every other component's own `Cid` variant wraps
/// (`message.rs`'s `descriptor_cid`/`message_cid`/`entry_id` return
/// this directly, since they are thin wrappers over this module).
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("{0}")]
    Cid(String),
}

/// A content identifier, rendered in its canonical string form.
///
/// Every message descriptor, and every record's associated data, is
/// bound to one of these: `descriptorCid` over the canonical CBOR
/// encoding of a `Descriptor`, `dataCid` over the raw data bytes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid(String);

impl Cid {
    fn from_digest(codec: u64, digest: &[u8]) -> Result<Self, Error> {
        let mh = Multihash::<64>::wrap(SHA2_256, digest)
            .map_err(|e| Error::Cid(format!("multihash: {e}")))?;
        Ok(Cid(Cidv1::new_v1(codec, mh).to_string()))
    }

    /// Canonical CID of a serializable value, encoded as DAG-CBOR with
    /// map keys sorted by their CBOR byte-string encoding.
    pub fn of_dag_cbor<T: Serialize>(value: &T) -> Result<Self, Error> {
        let bytes = serde_ipld_dagcbor::to_vec(value)
            .map_err(|e| Error::Cid(format!("dag-cbor encode: {e}")))?;
        let digest = Sha256::digest(&bytes);
        Self::from_digest(DAG_CBOR_CODEC, &digest)
    }

    /// Canonical CID of a raw byte blob (record data), used as `dataCid`.
    pub fn of_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let digest = Sha256::digest(bytes);
        Self::from_digest(RAW_CODEC, &digest)
    }

    /// Incrementally hash a byte stream into a `dataCid`, used by the
    /// data store so large payloads never need to be buffered twice.
    pub fn of_reader(mut r: impl std::io::Read) -> Result<(Self, u64), Error> {
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut len = 0u64;
        loop {
            let n = r.read(&mut buf).map_err(|e| Error::Cid(format!("read: {e}")))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            len += n as u64;
        }
        let cid = Self::from_digest(RAW_CODEC, &hasher.finalize())?;
        Ok((cid, len))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Cid {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        Cidv1::try_from(s).map_err(|e| Error::Cid(format!("parse cid: {e}")))?;
        Ok(Cid(s.to_string()))
    }
}

impl Serialize for Cid {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Cid {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Descriptor {
        interface: &'static str,
        method: &'static str,
    }

    #[test]
    fn dag_cbor_cid_is_stable_under_key_order() {
        let a = Cid::of_dag_cbor(&Descriptor { interface: "Records", method: "Write" }).unwrap();
        #[derive(Serialize)]
        struct Reordered {
            method: &'static str,
            interface: &'static str,
        }
        let b = Cid::of_dag_cbor(&Reordered { method: "Write", interface: "Records" }).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bytes_cid_differs_from_dag_cbor_cid() {
        let raw = Cid::of_bytes(b"hello").unwrap();
        let boxed = Cid::of_dag_cbor(&"hello").unwrap();
        assert_ne!(raw.as_str(), boxed.as_str());
    }

    #[test]
    fn reader_hash_matches_slice_hash() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let (streamed, len) = Cid::of_reader(&data[..]).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(streamed, Cid::of_bytes(data).unwrap());
    }

    #[test]
    fn roundtrips_through_display_and_parse() {
        let cid = Cid::of_bytes(b"hello world").unwrap();
        let parsed: Cid = cid.to_string().parse().unwrap();
        assert_eq!(cid, parsed);
    }
}
