//! Login walkthrough: a `UserService` server and a client channel in one
//! process, sharing an in-process coordination store.
//!
//! Usage: `login_demo [config-file]`. Without a config file the defaults
//! apply except the server binds an ephemeral loopback port.

use log::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xrpc::controller::XrpcController;
use xrpc::service::{Done, Message, MethodDesc, Service};
use xrpc::{logger, MemCoord, XrpcChannel, XrpcConfig, XrpcServer};

const LOGIN: MethodDesc = MethodDesc::new("UserService", "Login");

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
struct LoginResponse {
    success: bool,
    token: String,
    error_message: String,
}

struct UserServiceImpl;

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

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match std::env::args().nth(1) {
        Some(path) => XrpcConfig::load(path)?,
        None => XrpcConfig::parse("server_ip = 127.0.0.1\nserver_port = 0\n"),
    };
    logger::init_from_config(&cfg)?;

    let coord = MemCoord::new();
    let server = XrpcServer::with_config(&cfg, coord.session())?;
    server.register_service(Arc::new(UserServiceImpl))?;
    server.start()?;
    println!("UserService serving at {}", server.local_addr());

    let channel = XrpcChannel::with_config(&cfg, coord.session())?;

    // synchronous call, good credentials
    let controller = XrpcController::new();
    let mut response = LoginResponse::default();
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };
    channel.call(&LOGIN, &controller, &request, &mut response);
    if controller.failed() {
        println!("sync login failed: {}", controller.error_text());
    } else {
        println!("sync login ok, token {:?}", response.token);
    }

    // synchronous call, bad credentials
    let controller = XrpcController::new();
    let mut response = LoginResponse::default();
    let request = LoginRequest { username: "someone".into(), password: "guess".into() };
    channel.call(&LOGIN, &controller, &request, &mut response);
    println!(
        "bad-credential login failed as expected: {}",
        if controller.failed() { controller.error_text() } else { "unexpected success".into() }
    );

    // asynchronous call with a completion callback
    let controller = Arc::new(XrpcController::new());
    let response = Arc::new(Mutex::new(LoginResponse::default()));
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let ctrl = controller.clone();
    let resp = response.clone();
    channel.call_async(
        &LOGIN,
        controller.clone(),
        &request,
        response.clone(),
        Box::new(move || {
            if ctrl.failed() {
                println!("async login failed: {}", ctrl.error_text());
            } else {
                println!("async login ok, token {:?}", resp.lock().unwrap().token);
            }
            let _ = tx.send(());
        }),
    );
    rx.recv_timeout(Duration::from_secs(5))?;

    info!("demo finished");
    Ok(())
}
