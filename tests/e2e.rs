//! End-to-end call scenarios over loopback TCP with an in-process
//! coordination store shared by server and client.

mod common;

use common::*;
use rstest::rstest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xrpc::{MemCoord, XrpcChannel, XrpcConfig, XrpcController};

#[rstest]
#[case("test_user", "test_pass", true, "mock_token", "")]
#[case("wrong", "wrong", false, "", "Invalid credentials")]
fn test_sync_login(
    #[case] username: &str, #[case] password: &str, #[case] success: bool, #[case] token: &str,
    #[case] error_text: &str,
) {
    let (_coord, _server, channel) = login_fixture();

    let controller = XrpcController::new();
    let request = LoginRequest { username: username.into(), password: password.into() };
    let mut response = LoginResponse::default();
    channel.call(&LOGIN, &controller, &request, &mut response);

    assert_eq!(controller.failed(), !success, "unexpected: {}", controller.error_text());
    if !success {
        assert_eq!(controller.error_text(), error_text);
    }
    assert_eq!(response.success, success);
    assert_eq!(response.token, token);
}

#[test]
fn test_call_without_server() {
    init_test_logger();
    let coord = MemCoord::new();
    let channel =
        XrpcChannel::with_config(&XrpcConfig::parse(""), coord.session()).expect("channel");

    let controller = XrpcController::new();
    let request = LoginRequest { username: "x".into(), password: "y".into() };
    let mut response = LoginResponse::default();
    channel.call(&LOGIN, &controller, &request, &mut response);

    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Service instance not found");
    assert!(!response.success);
}

#[test]
fn test_async_login_success() {
    let (_coord, _server, channel) = login_fixture();

    let controller = Arc::new(XrpcController::new());
    let response = Arc::new(Mutex::new(LoginResponse::default()));
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let calls2 = calls.clone();
    channel.call_async(
        &LOGIN,
        controller.clone(),
        &request,
        response.clone(),
        Box::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }),
    );

    rx.recv_timeout(Duration::from_secs(5)).expect("callback");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!controller.failed(), "unexpected failure: {}", controller.error_text());
    let response = response.lock().unwrap();
    assert!(response.success);
    assert_eq!(response.token, "mock_token");
}

#[test]
fn test_async_login_bad_credentials() {
    let (_coord, _server, channel) = login_fixture();

    let controller = Arc::new(XrpcController::new());
    let response = Arc::new(Mutex::new(LoginResponse::default()));
    let request = LoginRequest { username: "wrong".into(), password: "wrong".into() };

    let (tx, rx) = std::sync::mpsc::channel::<()>();
    channel.call_async(
        &LOGIN,
        controller.clone(),
        &request,
        response.clone(),
        Box::new(move || {
            let _ = tx.send(());
        }),
    );

    rx.recv_timeout(Duration::from_secs(5)).expect("callback");
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Invalid credentials");
    assert!(!response.lock().unwrap().success);
}

#[test]
fn test_cancel_before_send() {
    let (_coord, _server, channel) = login_fixture();

    let controller = Arc::new(XrpcController::new());
    controller.start_cancel();

    let response = Arc::new(Mutex::new(LoginResponse::default()));
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let calls2 = calls.clone();
    channel.call_async(
        &LOGIN,
        controller.clone(),
        &request,
        response.clone(),
        Box::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }),
    );

    rx.recv_timeout(Duration::from_secs(5)).expect("callback");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(controller.failed());
    assert_eq!(controller.error_text(), "Request was canceled before sending");
    assert!(!response.lock().unwrap().success);
}

#[test]
fn test_controller_reset_allows_retry() {
    let (_coord, _server, channel) = login_fixture();

    let controller = XrpcController::new();
    controller.start_cancel();
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };
    let mut response = LoginResponse::default();
    channel.call(&LOGIN, &controller, &request, &mut response);
    assert!(controller.failed());

    controller.reset();
    channel.call(&LOGIN, &controller, &request, &mut response);
    assert!(!controller.failed(), "unexpected failure: {}", controller.error_text());
    assert!(response.success);
}

#[test]
fn test_sequential_calls_reuse_connection() {
    let (_coord, _server, channel) = login_fixture();
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };

    for _ in 0..5 {
        let controller = XrpcController::new();
        let mut response = LoginResponse::default();
        channel.call(&LOGIN, &controller, &request, &mut response);
        assert!(!controller.failed(), "unexpected failure: {}", controller.error_text());
        assert!(response.success);
    }
}

#[test]
fn test_concurrent_callers_on_one_channel() {
    let (_coord, _server, channel) = login_fixture();
    let channel = Arc::new(channel);

    let mut handles = Vec::new();
    for i in 0..4 {
        let channel = channel.clone();
        handles.push(std::thread::spawn(move || {
            let request =
                LoginRequest { username: "test_user".into(), password: "test_pass".into() };
            let controller = XrpcController::new();
            let mut response = LoginResponse::default();
            channel.call(&LOGIN, &controller, &request, &mut response);
            assert!(!controller.failed(), "caller {} failed: {}", i, controller.error_text());
            assert!(response.success);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_server_stop_unregisters_instances() {
    let (coord, server, channel) = login_fixture();

    // the ephemeral node disappears with the server's session
    server.stop();
    drop(server);

    let controller = XrpcController::new();
    let request = LoginRequest { username: "test_user".into(), password: "test_pass".into() };
    let mut response = LoginResponse::default();

    // wait out the channel's cache invalidation, then the call must fail
    // with a discovery error
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        controller.reset();
        channel.call(&LOGIN, &controller, &request, &mut response);
        if controller.failed() && controller.error_text() == "Service instance not found" {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "stale instance never pruned");
        std::thread::sleep(Duration::from_millis(50));
    }
    drop(coord);
}
