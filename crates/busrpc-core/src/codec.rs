//! Type-erased message encoding.
//!
//! Messages are bincode-encoded and wrapped in an [`AnyPayload`] carrying the
//! message's type name, so a receiver can either check the tag against the
//! type it expects ([`deserialize_as`]) or rebuild the concrete type from the
//! tag alone through a [`TypeRegistry`].
//!
//! When the tag already travels out of band (inside a larger envelope such
//! as a request), [`serialize_payload`] hands back the raw bytes separately
//! and [`deserialize_payload`] accepts either form.

use crate::error::{RpcError, RpcResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;

/// A value that can travel over the bus.
///
/// `TYPE_NAME` must be unique among the types a process exchanges.
pub trait Message: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// Encoded message plus its type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnyPayload {
    /// `Message::TYPE_NAME` of the encoded value.
    pub type_name: String,
    pub value: Vec<u8>,
}

impl AnyPayload {
    /// Encode `msg` and tag it with its type name.
    pub fn pack<M: Message>(msg: &M) -> RpcResult<Self> {
        Ok(Self {
            type_name: M::TYPE_NAME.to_string(),
            value: bincode::serialize(msg)?,
        })
    }

    /// Decode into `M`, failing if the tag names a different type.
    pub fn unpack<M: Message>(&self) -> RpcResult<M> {
        if self.type_name != M::TYPE_NAME {
            return Err(RpcError::Codec(format!(
                "type mismatch: expected {}, got {}",
                M::TYPE_NAME,
                self.type_name
            )));
        }
        Ok(bincode::deserialize(&self.value)?)
    }
}

/// Encode a message together with its type tag.
pub fn serialize<M: Message>(msg: &M) -> RpcResult<Vec<u8>> {
    let any = AnyPayload::pack(msg)?;
    Ok(bincode::serialize(&any)?)
}

/// Decode bytes produced by [`serialize`] into a known type.
pub fn deserialize_as<M: Message>(bytes: &[u8]) -> RpcResult<M> {
    let any: AnyPayload = bincode::deserialize(bytes)?;
    any.unpack()
}

/// Encode a message, returning the raw bytes and the tagged envelope.
pub fn serialize_payload<M: Message>(msg: &M) -> RpcResult<(Vec<u8>, AnyPayload)> {
    let any = AnyPayload::pack(msg)?;
    Ok((any.value.clone(), any))
}

/// Decode a payload given either raw bytes or a tagged envelope.
///
/// The envelope wins when both are present.
pub fn deserialize_payload<M: Message>(raw: &[u8], any: Option<&AnyPayload>) -> RpcResult<M> {
    match any {
        Some(any) => any.unpack(),
        None => Ok(bincode::deserialize(raw)?),
    }
}

/// A decoded message whose concrete type is only known at runtime.
pub trait DynMessage: Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync>;
}

impl<M: Message> DynMessage for M {
    fn type_name(&self) -> &'static str {
        M::TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send + Sync> {
        self
    }
}

impl dyn DynMessage {
    /// Borrow as `M` if that is the concrete type.
    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.as_any().downcast_ref()
    }
}

/// Take ownership of a dynamic message as a concrete type.
pub fn downcast<M: Message>(msg: Box<dyn DynMessage>) -> Option<M> {
    msg.into_any().downcast::<M>().ok().map(|b| *b)
}

type Decoder = fn(&[u8]) -> RpcResult<Box<dyn DynMessage>>;

fn decode_boxed<M: Message>(value: &[u8]) -> RpcResult<Box<dyn DynMessage>> {
    let msg: M = bincode::deserialize(value)?;
    Ok(Box::new(msg))
}

/// Maps type names to decoders for [`TypeRegistry::deserialize`].
#[derive(Default)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `M` decodable by [`Self::deserialize`]. Chainable.
    ///
    /// # Example
    ///
    /// ```rust
    /// use busrpc_core::codec::TypeRegistry;
    /// use busrpc_core::wire::{ClaimRequest, ClaimResponse};
    ///
    /// let mut registry = TypeRegistry::new();
    /// registry.register::<ClaimRequest>().register::<ClaimResponse>();
    /// assert!(registry.contains("busrpc.ClaimResponse"));
    /// assert_eq!(registry.len(), 2);
    /// ```
    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.decoders.insert(M::TYPE_NAME, decode_boxed::<M>);
        self
    }

    /// Whether a decoder for `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decode bytes produced by [`serialize`] without naming the type.
    pub fn deserialize(&self, bytes: &[u8]) -> RpcResult<Box<dyn DynMessage>> {
        let any: AnyPayload = bincode::deserialize(bytes)?;
        let decoder = self
            .decoders
            .get(any.type_name.as_str())
            .ok_or_else(|| RpcError::Codec(format!("unknown message type {}", any.type_name)))?;
        decoder(&any.value)
    }
}

impl Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    impl Message for Greeting {
        const TYPE_NAME: &'static str = "test.Greeting";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Count(u64);

    impl Message for Count {
        const TYPE_NAME: &'static str = "test.Count";
    }

    #[test]
    fn test_registry_rebuilds_concrete_type() {
        let mut registry = TypeRegistry::new();
        registry.register::<Greeting>().register::<Count>();

        let bytes = serialize(&Count(9)).unwrap();
        let msg = registry.deserialize(&bytes).unwrap();
        assert_eq!(msg.type_name(), "test.Count");
        assert_eq!(msg.downcast_ref::<Count>(), Some(&Count(9)));
        assert!(msg.downcast_ref::<Greeting>().is_none());
        assert_eq!(downcast::<Count>(msg), Some(Count(9)));
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = TypeRegistry::new();
        let bytes = serialize(&Count(1)).unwrap();
        assert!(matches!(registry.deserialize(&bytes), Err(RpcError::Codec(_))));
    }

    #[test]
    fn test_deserialize_as_checks_tag() {
        let bytes = serialize(&Count(3)).unwrap();
        assert_eq!(deserialize_as::<Count>(&bytes).unwrap(), Count(3));
        assert!(deserialize_as::<Greeting>(&bytes).is_err());
    }

    #[test]
    fn test_payload_accepts_raw_or_tagged() {
        let msg = Greeting {
            text: "hello".into(),
        };
        let (raw, any) = serialize_payload(&msg).unwrap();

        let from_raw: Greeting = deserialize_payload(&raw, None).unwrap();
        let from_any: Greeting = deserialize_payload(&[], Some(&any)).unwrap();
        assert_eq!(from_raw, msg);
        assert_eq!(from_any, msg);
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let err = deserialize_as::<Count>(&[0xff, 0x01]).unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
