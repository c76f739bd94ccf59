//! Information capability
//!
//! A gather call fills in a caller-owned information object: the caller
//! supplies how its parameters serialize and how a reply deserializes back
//! into it. The session only sees this trait; the payload schema belongs
//! to the caller.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Caller-supplied capability consumed by
/// [`Session::gather_information`](crate::session::Session::gather_information).
pub trait Information: Send {
    /// Kind identifier transmitted with the request so the remote side
    /// knows which information object to produce.
    fn kind(&self) -> &str;

    /// True if only the root participant's value is meaningful. A
    /// root-only gather that was satisfied locally skips the remote step.
    fn root_only(&self) -> bool;

    /// Serialize the request parameters.
    fn serialize_parameters(&self) -> Result<Vec<u8>>;

    /// Fill this object in from a reply payload.
    fn deserialize_reply(&mut self, bytes: &[u8]) -> Result<()>;
}

/// [`Information`] adapter for any serde-representable value: parameters
/// and reply are JSON documents.
pub struct JsonInformation<P, V> {
    kind: String,
    root_only: bool,
    pub parameters: P,
    pub value: Option<V>,
}

impl<P, V> JsonInformation<P, V> {
    pub fn new(kind: impl Into<String>, parameters: P) -> Self {
        JsonInformation {
            kind: kind.into(),
            root_only: false,
            parameters,
            value: None,
        }
    }

    /// Mark the information as produced solely by a group's root.
    pub fn with_root_only(mut self) -> Self {
        self.root_only = true;
        self
    }
}

impl<P, V> Information for JsonInformation<P, V>
where
    P: Serialize + Send,
    V: DeserializeOwned + Send,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn root_only(&self) -> bool {
        self.root_only
    }

    fn serialize_parameters(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.parameters)?)
    }

    fn deserialize_reply(&mut self, bytes: &[u8]) -> Result<()> {
        self.value = Some(serde_json::from_slice(bytes)?);
        Ok(())
    }
}
