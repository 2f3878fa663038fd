//! Typed identifiers.
//!
//! An identifier is a Base-62 encoded UUID with a short prefix naming what it identifies:
//! ```text
//! "ll_8iCDGZ8pK9fAGxySBWh79A"   (a lease on a lock)
//! "h_QCar3LwOwBPIeKonywpCpB"    (a generated holder token)
//! ```
//!
//! Every successful lock acquisition mints a fresh lease id and writes it into Redis next to the
//! lock key. The prefix makes these values easy to spot with `redis-cli` or in the logs.

use std::collections::HashMap;
use std::fmt;

use base_62::base62;
use enum_iterator::IntoEnumIterator;
use lazy_static::lazy_static;
use uuid::Uuid;

/// The type of object an identifier identifies.
#[derive(Clone, Copy, Debug, IntoEnumIterator, PartialEq, Eq, Hash)]
pub enum IdType {
    Holder,
    LockLease,
}

/// An identifier with a type. Example:
/// ```
/// use redislock::ids::{Id, IdType};
///
/// let id = Id::new(IdType::LockLease);
/// assert!(id.as_str().starts_with("ll_"));
///
/// let parsed = Id::parse(id.as_str()).unwrap();
/// assert_eq!(parsed.id_type, IdType::LockLease);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Id {
    pub id_type: IdType,
    id_str: String,
}

impl Id {
    pub fn new(id_type: IdType) -> Self {
        let encoded = encode_uuid(&Uuid::new_v4());
        let id_str = format!("{}_{}", id_type.as_str(), encoded);
        Self { id_type, id_str }
    }

    /// Parse the id, if we can.
    pub fn parse(id_str: &str) -> Option<Self> {
        let idx = id_str.find('_')?;
        let (prefix, suffix) = id_str.split_at(idx);
        let suffix = &suffix[1..]; // start after '_'

        let id_type = IdType::from_prefix(prefix)?;
        decode_uuid(suffix)?;

        Some(Self {
            id_type,
            id_str: String::from(id_str),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.id_str
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.id_str)
    }
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            IdType::Holder => "h",
            IdType::LockLease => "ll",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<IdType> {
        ID_PREFIX_TO_TYPE.get(prefix).copied()
    }
}

lazy_static! {
    static ref ID_PREFIX_TO_TYPE: HashMap<&'static str, IdType> = IdType::into_enum_iter()
        .map(|id_type| (id_type.as_str(), id_type))
        .collect();
}

fn encode_uuid(uuid: &Uuid) -> String {
    base62::encode(uuid.as_bytes())
}

fn decode_uuid(encoded: &str) -> Option<Uuid> {
    let decoded = base62::decode(encoded).ok()?;
    if decoded.is_empty() || decoded.len() > 16 {
        return None;
    }
    // Leading zero bytes do not survive the round trip through Base-62.
    let mut bytes = [0u8; 16];
    bytes[16 - decoded.len()..].copy_from_slice(&decoded);
    Some(Uuid::from_bytes(bytes))
}
