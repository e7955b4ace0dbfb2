//! Type registry for envelope dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use lanlink_core::{WireError, WireMessage};

/// A decoded payload, shared with every subscriber.
pub type DynObject = Arc<dyn Any + Send + Sync>;

type DecodeFn = Arc<dyn Fn(Bytes) -> Result<DynObject, WireError> + Send + Sync>;

/// Maps wire-visible type tags to decode functions.
///
/// Registration happens while a layer is constructed; lookups run on the
/// dispatch path. Tags without a decoder are reported as unknown and the
/// envelope is dropped without closing the connection.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: RwLock<HashMap<&'static str, DecodeFn>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type under its wire tag. Re-registering a tag
    /// replaces the previous decoder.
    pub fn register<T: WireMessage>(&self) {
        let decode: DecodeFn = Arc::new(|mut payload: Bytes| {
            let msg = T::decode(&mut payload)?;
            Ok(Arc::new(msg) as DynObject)
        });
        self.decoders.write().unwrap().insert(T::TYPE_TAG, decode);
    }

    /// Decode `payload` using the decoder registered for `tag`. Returns
    /// `None` when the tag is unknown.
    pub fn decode(&self, tag: &str, payload: Bytes) -> Option<Result<DynObject, WireError>> {
        let decoder = self.decoders.read().unwrap().get(tag).cloned();
        decoder.map(|decode| decode(payload))
    }

    /// Whether a decoder is registered for `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.read().unwrap().contains_key(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_core::{wire::encode_to_bytes, FileReqAck};

    #[test]
    fn test_register_and_decode() {
        let registry = TypeRegistry::new();
        registry.register::<FileReqAck>();
        assert!(registry.contains("FileReqAck"));

        let payload = encode_to_bytes(&FileReqAck { accepted: true }).unwrap();
        let object = registry
            .decode("FileReqAck", payload)
            .expect("tag registered")
            .expect("payload decodes");

        let ack = object.downcast::<FileReqAck>().unwrap();
        assert!(ack.accepted);
    }

    #[test]
    fn test_unknown_tag() {
        let registry = TypeRegistry::new();
        assert!(registry.decode("Mystery", Bytes::new()).is_none());
    }

    #[test]
    fn test_malformed_payload_is_error() {
        let registry = TypeRegistry::new();
        registry.register::<FileReqAck>();
        let result = registry.decode("FileReqAck", Bytes::new()).unwrap();
        assert!(result.is_err());
    }
}
