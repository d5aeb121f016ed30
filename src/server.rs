//! Server dispatcher: binds the transport, publishes services in the
//! registry, and routes framed requests to user service objects.

use log::*;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::codec::XrpcCodec;
use crate::config::XrpcConfig;
use crate::controller::XrpcController;
use crate::error::{WireErr, XrpcError};
use crate::net::{parse_addr, FrameHandler, Transport};
use crate::proto::RpcHeader;
use crate::registry::{Coordination, RegistryClient};
use crate::service::Service;

type ServiceMap = RwLock<HashMap<String, Arc<dyn Service>>>;

pub struct XrpcServer<C: Coordination> {
    transport: Transport,
    registry: RegistryClient<C>,
    services: Arc<ServiceMap>,
    local_addr: String,
}

impl<C: Coordination> XrpcServer<C> {
    /// Build a server from a configuration file and a coordination session
    /// handle: starts the registry client and binds the transport on the
    /// configured `server_ip:server_port`.
    pub fn new<P: AsRef<Path>>(config_path: P, coord: C) -> Result<Self, XrpcError> {
        let cfg = XrpcConfig::load(config_path)?;
        Self::with_config(&cfg, coord)
    }

    pub fn with_config(cfg: &XrpcConfig, coord: C) -> Result<Self, XrpcError> {
        let registry = RegistryClient::new(coord);
        registry.start()?;
        let transport = Transport::new()?;
        let bind = cfg.server_addr();
        let addr = parse_addr(&bind).map_err(|_| XrpcError::BadAddress(bind))?;
        let local_addr = transport.bind(addr)?;
        info!("server bound at {}", local_addr);
        Ok(Self { transport, registry, services: Arc::new(RwLock::new(HashMap::new())), local_addr })
    }

    /// The actually-bound `ip:port`; this is the address published in the
    /// registry (a configured port 0 is resolved here).
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Record the service and publish it as an ephemeral registry node at
    /// `/<service>/<ip:port>` with data `methods=<comma-joined names>`.
    /// Registration failure is fatal for the server.
    pub fn register_service(&self, service: Arc<dyn Service>) -> Result<(), XrpcError> {
        let name = service.name();
        let methods = service.methods().join(",");
        self.services.write().unwrap().insert(name.to_string(), service);
        let path = format!("/{}/{}", name, self.local_addr);
        self.registry.register(&path, &format!("methods={}", methods), true)?;
        info!("service {} published at {}", name, path);
        Ok(())
    }

    /// Start serving: every complete request frame is decoded, routed, and
    /// answered with a response frame on the same connection.
    pub fn start(&self) -> Result<(), XrpcError> {
        let services = self.services.clone();
        let handler: FrameHandler = Arc::new(move |req| dispatch(&services, &req));
        self.transport.start_server(handler)?;
        info!("server started at {}", self.local_addr);
        Ok(())
    }

    pub fn stop(&self) {
        self.transport.stop();
        self.registry.stop();
    }
}

impl<C: Coordination> Drop for XrpcServer<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle one request frame. Every outcome, including routing failures,
/// is answered with a framed response; the error detail rides in the
/// header and the codes are stable on the wire.
fn dispatch(services: &ServiceMap, data: &[u8]) -> Vec<u8> {
    let codec = XrpcCodec::default();
    let (header, payload) = match codec.decode(data) {
        Err(e) => {
            error!("fail to decode request frame: {}", e);
            return error_frame(&codec, 0, WireErr::DecodeRequest, None);
        }
        Ok(x) => x,
    };
    debug!("request {}", header);
    let request_id = header.request_id;

    let Some(service) = services.read().unwrap().get(&header.service_name).cloned() else {
        warn!("service {:?} not found", header.service_name);
        return error_frame(&codec, request_id, WireErr::ServiceNotFound, None);
    };

    let Some(method) = service.methods().into_iter().find(|m| *m == header.method_name) else {
        warn!("method {:?} not found in {}", header.method_name, header.service_name);
        return error_frame(&codec, request_id, WireErr::MethodNotFound, None);
    };
    // prototypes exist for every advertised method
    let (Some(mut request), Some(mut response)) =
        (service.request_prototype(method), service.response_prototype(method))
    else {
        return error_frame(&codec, request_id, WireErr::MethodNotFound, None);
    };

    if request.merge(&payload).is_err() {
        warn!("fail to parse request for {}.{}", header.service_name, method);
        return error_frame(&codec, request_id, WireErr::ParseRequest, None);
    }

    let controller = XrpcController::new();
    let invoked = catch_unwind(AssertUnwindSafe(|| {
        service.call(method, &controller, request.as_ref(), response.as_mut(), None);
    }));
    if invoked.is_err() {
        error!("handler for {}.{} panicked", header.service_name, method);
        return error_frame(&codec, request_id, WireErr::Internal, None);
    }

    let mut reply = RpcHeader::reply(request_id, header.compressed);
    if controller.failed() {
        // user-reported failure: error text in the header, the (possibly
        // partially-filled) response still ships as payload
        reply.set_error(WireErr::Handler.code(), controller.error_text());
    }
    let payload = match response.to_vec() {
        Ok(p) => p,
        Err(e) => {
            error!("fail to serialize response for {}.{}: {}", header.service_name, method, e);
            return error_frame(&codec, request_id, WireErr::Internal, None);
        }
    };
    match codec.encode_raw(&reply, &payload) {
        Ok(frame) => frame,
        Err(e) => {
            error!("fail to encode response frame: {}", e);
            error_frame(&codec, request_id, WireErr::Internal, None)
        }
    }
}

/// A response frame carrying only a structured error header.
fn error_frame(codec: &XrpcCodec, request_id: u64, err: WireErr, text: Option<String>) -> Vec<u8> {
    let mut header = RpcHeader::reply(request_id, false);
    header.set_error(err.code(), text.unwrap_or_else(|| err.to_string()));
    match codec.encode_raw(&header, &[]) {
        Ok(frame) => frame,
        // a plain header cannot fail to serialize; an empty return
        // suppresses the reply rather than poisoning the connection
        Err(e) => {
            error!("fail to encode error frame: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_msg, encode_msg};
    use crate::service::{Done, Message};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
    struct EchoReq {
        text: String,
    }

    #[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
    struct EchoResp {
        text: String,
    }

    struct EchoService;

    impl Service for EchoService {
        fn name(&self) -> &'static str {
            "EchoService"
        }

        fn methods(&self) -> Vec<&'static str> {
            vec!["Echo", "Boom"]
        }

        fn request_prototype(&self, method: &str) -> Option<Box<dyn Message>> {
            match method {
                "Echo" | "Boom" => Some(Box::new(EchoReq::default())),
                _ => None,
            }
        }

        fn response_prototype(&self, method: &str) -> Option<Box<dyn Message>> {
            match method {
                "Echo" | "Boom" => Some(Box::new(EchoResp::default())),
                _ => None,
            }
        }

        fn call(
            &self, method: &str, controller: &XrpcController, request: &dyn Message,
            response: &mut dyn Message, done: Option<Done>,
        ) {
            let req = request.as_any().downcast_ref::<EchoReq>().unwrap();
            let resp = response.as_any_mut().downcast_mut::<EchoResp>().unwrap();
            match method {
                "Echo" => {
                    if req.text == "fail" {
                        controller.set_failed("refused");
                    } else {
                        resp.text = req.text.clone();
                    }
                }
                "Boom" => panic!("boom"),
                _ => unreachable!(),
            }
            if let Some(done) = done {
                done();
            }
        }
    }

    fn service_map() -> Arc<ServiceMap> {
        let map: Arc<ServiceMap> = Arc::new(RwLock::new(HashMap::new()));
        map.write().unwrap().insert("EchoService".to_string(), Arc::new(EchoService));
        map
    }

    fn request_frame(service: &str, method: &str, text: &str) -> Vec<u8> {
        let codec = XrpcCodec::default();
        let header = RpcHeader::request(service, method, 9, false);
        codec.encode(&header, &EchoReq { text: text.to_string() }).unwrap()
    }

    fn unpack(frame: &[u8]) -> (RpcHeader, Vec<u8>) {
        XrpcCodec::default().decode(frame).unwrap()
    }

    #[test]
    fn test_dispatch_success() {
        let map = service_map();
        let resp = dispatch(&map, &request_frame("EchoService", "Echo", "hi"));
        let (header, payload) = unpack(&resp);
        assert_eq!(header.status, 0);
        assert_eq!(header.request_id, 9);
        let body: EchoResp = decode_msg(&payload).unwrap();
        assert_eq!(body.text, "hi");
    }

    #[test]
    fn test_dispatch_handler_failure() {
        let map = service_map();
        let resp = dispatch(&map, &request_frame("EchoService", "Echo", "fail"));
        let (header, payload) = unpack(&resp);
        assert_eq!(header.status, WireErr::Handler.code());
        assert_eq!(header.error.unwrap().message, "refused");
        // the partially-filled response still parses
        let body: EchoResp = decode_msg(&payload).unwrap();
        assert_eq!(body.text, "");
    }

    #[test]
    fn test_dispatch_unknown_service() {
        let map = service_map();
        let resp = dispatch(&map, &request_frame("NoSuchService", "Echo", "hi"));
        let (header, _) = unpack(&resp);
        assert_eq!(header.status, WireErr::ServiceNotFound.code());
        assert_eq!(header.error.unwrap().message, "Service not found");
    }

    #[test]
    fn test_dispatch_unknown_method() {
        let map = service_map();
        let resp = dispatch(&map, &request_frame("EchoService", "NoSuchMethod", "hi"));
        let (header, _) = unpack(&resp);
        assert_eq!(header.status, WireErr::MethodNotFound.code());
    }

    #[test]
    fn test_dispatch_bad_request_payload() {
        let codec = XrpcCodec::default();
        let header = RpcHeader::request("EchoService", "Echo", 3, false);
        // a payload that is not an EchoReq
        let frame = codec.encode(&header, &42u64).unwrap();
        let map = service_map();
        let resp = dispatch(&map, &frame);
        let (header, _) = unpack(&resp);
        assert_eq!(header.status, WireErr::ParseRequest.code());
    }

    #[test]
    fn test_dispatch_garbage_frame() {
        let map = service_map();
        let resp = dispatch(&map, &[0x05, 1, 2, 3, 4, 5]);
        let (header, _) = unpack(&resp);
        assert_eq!(header.status, WireErr::DecodeRequest.code());
        assert_eq!(header.request_id, 0);
    }

    #[test]
    fn test_dispatch_panicking_handler() {
        let map = service_map();
        let resp = dispatch(&map, &request_frame("EchoService", "Boom", "hi"));
        let (header, _) = unpack(&resp);
        assert_eq!(header.status, WireErr::Internal.code());
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let codec = XrpcCodec::default();
        let frame = error_frame(&codec, 7, WireErr::ServiceNotFound, None);
        let (header, payload) = codec.decode(&frame).unwrap();
        assert_eq!(header.request_id, 7);
        assert_eq!(header.status, 2);
        assert!(payload.is_empty());
        let _ = encode_msg(&header).unwrap();
    }
}
