//! Service and message abstractions.
//!
//! A service is a named group of methods; each method has a request and a
//! response message type. The dispatcher only sees services through the
//! [Service] trait and messages through the [Message] trait, so user code
//! stays free of framework types beyond these two.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;

use crate::codec::{decode_msg, encode_msg};
use crate::controller::XrpcController;
use crate::error::CodecError;

/// Completion signal passed to a method invocation. The dispatcher invokes
/// methods synchronously and passes `None`.
pub type Done = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a service by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDesc {
    pub name: &'static str,
}

/// Identifies one method of a service; the routing key of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDesc {
    pub service: ServiceDesc,
    pub name: &'static str,
}

impl MethodDesc {
    pub const fn new(service: &'static str, name: &'static str) -> Self {
        Self { service: ServiceDesc { name: service }, name }
    }
}

/// A wire-serializable message, object-safe so prototypes can be built and
/// filled without knowing the concrete type.
///
/// Blanket-implemented for every `Serialize + DeserializeOwned + Default`
/// type; user messages need no manual impl.
pub trait Message: Send + 'static {
    /// Replace the contents with the decoded form of `buf`.
    fn merge(&mut self, buf: &[u8]) -> Result<(), CodecError>;

    fn to_vec(&self) -> Result<Vec<u8>, CodecError>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Message for T
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    fn merge(&mut self, buf: &[u8]) -> Result<(), CodecError> {
        *self = decode_msg(buf)?;
        Ok(())
    }

    fn to_vec(&self) -> Result<Vec<u8>, CodecError> {
        encode_msg(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// User-supplied service object: a set of named methods with request and
/// response prototypes.
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// All method names, in a fixed order.
    fn methods(&self) -> Vec<&'static str>;

    /// Fresh request message for `method`, `None` for unknown methods.
    fn request_prototype(&self, method: &str) -> Option<Box<dyn Message>>;

    /// Fresh response message for `method`, `None` for unknown methods.
    fn response_prototype(&self, method: &str) -> Option<Box<dyn Message>>;

    /// Invoke `method`. Failures are reported through `controller`; `done`
    /// (when present) must run exactly once after the response is filled.
    fn call(
        &self,
        method: &str,
        controller: &XrpcController,
        request: &dyn Message,
        response: &mut dyn Message,
        done: Option<Done>,
    );
}
