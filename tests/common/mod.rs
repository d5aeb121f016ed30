//! Shared fixtures: the mock user service and a runner that owns logger
//! setup.
#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use xrpc::controller::XrpcController;
use xrpc::service::{Done, Message, MethodDesc, Service};
use xrpc::{MemCoord, XrpcChannel, XrpcConfig, XrpcServer};

pub const LOGIN: MethodDesc = MethodDesc::new("UserService", "Login");

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub error_message: String,
}

/// Mock authentication backend: one known credential pair.
pub struct UserServiceImpl;

impl Service for UserServiceImpl {
    fn name(&self) -> &'static str {
        "UserService"
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["Login"]
    }

    fn request_prototype(&self, method: &str) -> Option<Box<dyn Message>> {
        (method == "Login").then(|| Box::new(LoginRequest::default()) as Box<dyn Message>)
    }

    fn response_prototype(&self, method: &str) -> Option<Box<dyn Message>> {
        (method == "Login").then(|| Box::new(LoginResponse::default()) as Box<dyn Message>)
    }

    fn call(
        &self, _method: &str, controller: &XrpcController, request: &dyn Message,
        response: &mut dyn Message, done: Option<Done>,
    ) {
        let req = request.as_any().downcast_ref::<LoginRequest>().unwrap();
        let resp = response.as_any_mut().downcast_mut::<LoginResponse>().unwrap();
        if req.username == "test_user" && req.password == "test_pass" {
            resp.success = true;
            resp.token = "mock_token".to_string();
        } else {
            resp.success = false;
            resp.error_message = "Invalid credentials".to_string();
            controller.set_failed("Invalid credentials");
        }
        if let Some(done) = done {
            done();
        }
    }
}

pub fn init_test_logger() {
    xrpc::logger::init_test_logger();
}

/// A server bound on an ephemeral loopback port with `UserService`
/// registered, plus a channel on the same coordination store.
pub fn login_fixture() -> (MemCoord, XrpcServer<xrpc::MemSession>, XrpcChannel<xrpc::MemSession>) {
    init_test_logger();
    let coord = MemCoord::new();
    let server_cfg = XrpcConfig::parse("server_ip = 127.0.0.1\nserver_port = 0\n");
    let server = XrpcServer::with_config(&server_cfg, coord.session()).expect("server");
    server.register_service(Arc::new(UserServiceImpl)).expect("register");
    server.start().expect("start");

    let client_cfg = XrpcConfig::parse("");
    let channel = XrpcChannel::with_config(&client_cfg, coord.session()).expect("channel");
    (coord, server, channel)
}
