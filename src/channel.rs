//! Client-side call engine.
//!
//! A channel owns a registry client (started on construction) and a
//! transport; one channel corresponds to one logical client pool. Every
//! per-call failure is reported through the caller's
//! [XrpcController], never as a return value.

use log::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::{decode_msg, XrpcCodec};
use crate::config::XrpcConfig;
use crate::controller::XrpcController;
use crate::error::{
    XrpcError, ERR_CANCELLED, ERR_CANCELLED_BEFORE_SEND, ERR_DECODE_RESPONSE,
    ERR_INSTANCE_NOT_FOUND, ERR_NO_RESPONSE, ERR_SEND_ASYNC,
};
use crate::net::{parse_addr, Transport};
use crate::proto::RpcHeader;
use crate::registry::{Coordination, RegistryClient};
use crate::service::MethodDesc;

/// Completion callback of an asynchronous call; runs exactly once on the
/// transport's event-loop thread.
pub type CallDone = Box<dyn FnOnce() + Send + 'static>;

pub struct XrpcChannel<C: Coordination> {
    transport: Transport,
    registry: RegistryClient<C>,
    codec: XrpcCodec,
    next_request_id: AtomicU64,
    compress: bool,
}

impl<C: Coordination> XrpcChannel<C> {
    /// Build a channel from a configuration file and a coordination
    /// session handle. The registry client is started here; a dead
    /// coordination service fails construction.
    pub fn new<P: AsRef<Path>>(config_path: P, coord: C) -> Result<Self, XrpcError> {
        let cfg = XrpcConfig::load(config_path)?;
        Self::with_config(&cfg, coord)
    }

    pub fn with_config(cfg: &XrpcConfig, coord: C) -> Result<Self, XrpcError> {
        let registry = RegistryClient::new(coord);
        registry.start()?;
        let transport = Transport::new()?;
        info!("channel ready, coordination at {}", cfg.coord_host());
        Ok(Self {
            transport,
            registry,
            codec: XrpcCodec::default(),
            next_request_id: AtomicU64::new(1),
            compress: true,
        })
    }

    pub fn registry(&self) -> &RegistryClient<C> {
        &self.registry
    }

    /// Synchronous call: blocks until the response arrives or the call
    /// fails. Success or failure lands in `controller`; on success
    /// `response` holds the parsed response message.
    pub fn call<Req, Resp>(
        &self, method: &MethodDesc, controller: &XrpcController, request: &Req,
        response: &mut Resp,
    ) where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let Some(frame) = self.prepare(method, controller, request) else {
            return;
        };
        match self.transport.send_and_wait(frame) {
            Err(e) => {
                debug!("{}.{}: {}", method.service.name, method.name, e);
                controller.set_failed(format!("{}: {}", ERR_NO_RESPONSE, e));
            }
            // cancellation is observed again once the response is in
            Ok(_) if controller.is_cancelled() => controller.set_failed(ERR_CANCELLED),
            Ok(bytes) => complete(&self.codec, controller, &bytes, response),
        }
    }

    /// Asynchronous call: returns immediately, `done` runs exactly once
    /// after `controller` and `response` are filled — on the event-loop
    /// thread for dispatched calls, on the calling thread when the call
    /// fails before dispatch.
    pub fn call_async<Req, Resp>(
        &self, method: &MethodDesc, controller: Arc<XrpcController>, request: &Req,
        response: Arc<Mutex<Resp>>, done: CallDone,
    ) where
        Req: Serialize,
        Resp: DeserializeOwned + Send + 'static,
    {
        let Some(frame) = self.prepare(method, &controller, request) else {
            done();
            return;
        };
        self.transport.send_async(frame, move |bytes, ok| {
            if !ok {
                controller.set_failed(ERR_SEND_ASYNC);
            } else if controller.is_cancelled() {
                controller.set_failed(ERR_CANCELLED);
            } else {
                let codec = XrpcCodec::default();
                complete(&codec, &controller, &bytes, &mut *response.lock().unwrap());
            }
            done();
        });
    }

    /// Steps shared by both paths: resolve an instance, honor a
    /// pre-dispatch cancel, connect, and encode the request frame.
    /// `None` means the call already failed (or was cancelled) and the
    /// controller carries the outcome.
    fn prepare<Req: Serialize>(
        &self, method: &MethodDesc, controller: &XrpcController, request: &Req,
    ) -> Option<Vec<u8>> {
        let service = method.service.name;
        let addr = self.resolve(service, method.name, controller)?;

        if controller.is_cancelled() {
            controller.set_failed(ERR_CANCELLED_BEFORE_SEND);
            return None;
        }

        if let Err(e) = self.transport.connect(addr) {
            controller.set_failed(format!("Failed to send request: {}", e));
            return None;
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let header = RpcHeader::request(service, method.name, request_id, self.compress);
        match self.codec.encode(&header, request) {
            Ok(frame) => {
                debug!("dispatching {}", header);
                Some(frame)
            }
            Err(e) => {
                controller.set_failed(format!("Failed to encode request: {}", e));
                None
            }
        }
    }

    /// Pick the first instance advertising the method. Ordering is
    /// deterministic (registry paths are listed sorted).
    fn resolve(
        &self, service: &str, method: &str, controller: &XrpcController,
    ) -> Option<SocketAddr> {
        let instances = match self.registry.find_instances_by_method(service, method) {
            Ok(list) => list,
            Err(e) => {
                debug!("discovery of {}.{} failed: {}", service, method, e);
                controller.set_failed(ERR_INSTANCE_NOT_FOUND);
                return None;
            }
        };
        let Some((path, _)) = instances.first() else {
            controller.set_failed(ERR_INSTANCE_NOT_FOUND);
            return None;
        };
        let instance = path.rsplit('/').next().unwrap_or_default();
        match parse_addr(instance) {
            Ok(addr) => Some(addr),
            Err(_) => {
                controller.set_failed(format!("Malformed instance address {:?}", instance));
                None
            }
        }
    }
}

impl<C: Coordination> Drop for XrpcChannel<C> {
    fn drop(&mut self) {
        self.transport.stop();
        self.registry.stop();
    }
}

/// Decode a response frame into the controller and response message.
/// Exactly one failure source wins: the transport already reported, a
/// non-zero server status, or a local decode failure.
fn complete<Resp: DeserializeOwned>(
    codec: &XrpcCodec, controller: &XrpcController, bytes: &[u8], response: &mut Resp,
) {
    match codec.decode(bytes) {
        Err(e) => {
            debug!("response decode failed: {}", e);
            controller.set_failed(ERR_DECODE_RESPONSE);
        }
        Ok((header, payload)) => {
            if header.status != 0 {
                controller.set_failed(header.error_message());
                // an error frame may still carry a partially-filled response
                if !payload.is_empty() {
                    if let Ok(partial) = decode_msg::<Resp>(&payload) {
                        *response = partial;
                    }
                }
                return;
            }
            match decode_msg::<Resp>(&payload) {
                Ok(parsed) => *response = parsed,
                Err(_) => controller.set_failed(ERR_DECODE_RESPONSE),
            }
        }
    }
}
