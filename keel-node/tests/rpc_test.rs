// Tests for the RPC server and client
//
// These tests run a manager with its reactor and RPC server on an ephemeral port,
// expose the WiFi fixture through it and drive it from an RpcClient of the same
// manager, the way a remote process would.

use keel_common::types::FunctionValue;
use keel_node::config::{ManagerStartConfig, RpcClientConfig, RpcServerConfig};
use keel_node::rpc::protocol::{ERROR_CONNECTION_NOT_FOUND, ERROR_INVALID_PARAMS, ERROR_PARSE};
use keel_node::rpc::Response;
use keel_node::{ServiceFactoryTable, ServiceManager};
use keel_test_utils::{
    create_test_manager_config, init_test_logging, WifiService, CONNECT_AP_CHANGED_EVENT,
    WIFI_SERVICE_NAME,
};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(2);

fn started_manager(node_id: &str) -> (Arc<ServiceManager>, Arc<WifiService>, u16) {
    init_test_logging();
    let wifi = WifiService::new();
    let manager = ServiceManager::new(ServiceFactoryTable::new(), create_test_manager_config(node_id));
    assert!(manager.add_service(wifi.clone()));
    assert!(manager.start(ManagerStartConfig::default().with_poll_interval(Duration::from_millis(5))));
    assert!(manager.start_rpc_server(RpcServerConfig::default().with_listen_port(0), TIMEOUT));
    assert!(manager.connect_rpc_server_to_services(&[WIFI_SERVICE_NAME]));

    let port = manager
        .rpc_server()
        .and_then(|server| server.local_addr())
        .map(|addr| addr.port())
        .unwrap();
    (manager, wifi, port)
}

/// Test a full remote session against the WiFi fixture
///
/// INTENTION: A client subscribes to `connect_ap_changed`, sets an access point and
/// reads it back. The change must arrive as a notification carrying the new SSID,
/// and the fixture must hold what the client sent.
#[test]
fn test_wifi_over_rpc() {
    let (manager, wifi, port) = started_manager("rpc-wifi");
    let binding = manager.bind(WIFI_SERVICE_NAME);
    assert!(binding.is_valid());

    let client = manager.new_rpc_client(RpcClientConfig::default()).unwrap();
    assert!(client.connect("127.0.0.1", port, TIMEOUT));
    assert!(client.is_connected());

    let (notified, notifications) = mpsc::sync_channel::<(String, Value)>(8);
    let subscription_id = client
        .subscribe_event(
            WIFI_SERVICE_NAME,
            CONNECT_AP_CHANGED_EVENT,
            move |event: &str, data: &Value| {
                let _ = notified.try_send((event.to_string(), data.clone()));
            },
            TIMEOUT,
        )
        .unwrap();

    let result = client.call_function(
        WIFI_SERVICE_NAME,
        "SetConnectAp",
        json!({"ssid": "office", "password": "secret"}),
        TIMEOUT,
    );
    assert!(result.is_ok(), "{}", result.error_message);

    let (event, data) = notifications.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event, CONNECT_AP_CHANGED_EVENT);
    assert_eq!(data, json!({"ssid": "office"}));
    assert_eq!(wifi.access_point().password, "secret");

    let result = client.call_function(WIFI_SERVICE_NAME, "GetConnectAp", Value::Null, TIMEOUT);
    assert_eq!(result.data, Some(FunctionValue::from("office")));

    let missing = client.call_function(WIFI_SERVICE_NAME, "SetConnectAp", json!({}), TIMEOUT);
    assert!(!missing.success);
    assert!(missing.error_message.contains("ssid"));

    let removed = client
        .unsubscribe_events(WIFI_SERVICE_NAME, &[subscription_id.clone()], TIMEOUT)
        .unwrap();
    assert_eq!(removed, vec![subscription_id]);

    assert!(client
        .call_function(WIFI_SERVICE_NAME, "SetConnectAp", json!({"ssid": "home"}), TIMEOUT)
        .is_ok());
    assert!(notifications.recv_timeout(Duration::from_millis(200)).is_err());

    client.disconnect();
    assert!(!client.is_connected());
    let offline = client.call_function(WIFI_SERVICE_NAME, "GetConnectAp", Value::Null, TIMEOUT);
    assert_eq!(offline.error_message, "Transport error: Not connected");
}

/// Test routing errors and the one-shot call helper
#[test]
fn test_rpc_routing_errors() {
    let (manager, _wifi, port) = started_manager("rpc-routing");
    let client = manager.new_rpc_client(RpcClientConfig::default()).unwrap();
    assert!(client.connect("127.0.0.1", port, TIMEOUT));

    // Exposed but not running
    let response = client
        .request(WIFI_SERVICE_NAME, "GetConnectAp", Value::Null, TIMEOUT)
        .unwrap();
    assert!(response.error.unwrap().message.contains("not active"));

    let response = client.request("Nope", "anything", Value::Null, TIMEOUT).unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, ERROR_CONNECTION_NOT_FOUND);
    assert_eq!(error.message, "Connection(`Nope`) not found");

    let response = client
        .request(WIFI_SERVICE_NAME, "GetConnectAp", json!([1, 2]), TIMEOUT)
        .unwrap();
    assert_eq!(response.error.unwrap().code, ERROR_INVALID_PARAMS);

    {
        let binding = manager.bind(WIFI_SERVICE_NAME);
        assert!(binding.is_valid());
        let set = client.call_function(WIFI_SERVICE_NAME, "SetConnectAp", json!({"ssid": "lab"}), TIMEOUT);
        assert!(set.is_ok(), "{}", set.error_message);

        let result = manager.call_rpc_function_sync(
            "127.0.0.1",
            WIFI_SERVICE_NAME,
            "GetConnectAp",
            json!({}),
            Duration::from_millis(500),
            port,
        );
        assert!(result.is_ok(), "{}", result.error_message);
        assert_eq!(result.data, Some(FunctionValue::from("lab")));
    }

    // The last binding stopped the service and took it off the server
    let server = manager.rpc_server().unwrap();
    assert!(!server.has_connection(WIFI_SERVICE_NAME));
    let response = client
        .request(WIFI_SERVICE_NAME, "GetConnectAp", Value::Null, TIMEOUT)
        .unwrap();
    assert_eq!(response.error.unwrap().code, ERROR_CONNECTION_NOT_FOUND);

    // Binding again puts it back
    let binding = manager.bind(WIFI_SERVICE_NAME);
    assert!(binding.is_valid());
    assert!(server.has_connection(WIFI_SERVICE_NAME));
}

/// Test the wire format with a plain socket
#[test]
fn test_rpc_wire_format() {
    let (manager, _wifi, port) = started_manager("rpc-wire");
    let _binding = manager.bind(WIFI_SERVICE_NAME);

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    let mut read_response = || -> Response {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    };

    writer.write_all(b"not json\n").unwrap();
    let response = read_response();
    assert_eq!(response.id, "");
    assert_eq!(response.error.unwrap().code, ERROR_PARSE);

    let request = json!({
        "id": "42",
        "service": WIFI_SERVICE_NAME,
        "method": "SetConnectAp",
        "params": {"ssid": "lab"},
    });
    writer.write_all(format!("{request}\n").as_bytes()).unwrap();
    let response = read_response();
    assert_eq!(response.id, "42");
    assert!(response.error.is_none());
    assert!(response.result.is_none());
}

/// Test that RPC needs a started manager
#[test]
fn test_rpc_requires_started_manager() {
    init_test_logging();
    let manager = ServiceManager::new(ServiceFactoryTable::new(), create_test_manager_config("rpc-idle"));
    assert!(!manager.start_rpc_server(RpcServerConfig::default().with_listen_port(0), TIMEOUT));
    assert!(manager.new_rpc_client(RpcClientConfig::default()).is_none());

    let result = manager.call_rpc_function_sync("127.0.0.1", WIFI_SERVICE_NAME, "GetConnectAp", Value::Null, TIMEOUT, 1);
    assert_eq!(result.error_message, "Manager is not started");
}

/// Test both deadline phases of the one-shot call helper
///
/// INTENTION: Nothing listening makes the connect phase fail. A peer that accepts
/// the connection but never answers uses up the remaining budget in the call phase.
#[test]
fn test_call_rpc_function_sync_deadlines() {
    init_test_logging();
    let manager = ServiceManager::new(ServiceFactoryTable::new(), create_test_manager_config("rpc-deadline"));
    assert!(manager.start(ManagerStartConfig::default().with_poll_interval(Duration::from_millis(5))));

    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = manager.call_rpc_function_sync(
        "127.0.0.1",
        WIFI_SERVICE_NAME,
        "GetConnectAp",
        json!({}),
        Duration::from_millis(500),
        closed_port,
    );
    assert!(!result.success);
    assert_eq!(
        result.error_message,
        format!("Failed to connect to RPC server: 127.0.0.1:{closed_port}")
    );

    // The kernel completes the handshake; nobody ever reads or replies
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let silent_port = silent.local_addr().unwrap().port();
    let begin = Instant::now();
    let result = manager.call_rpc_function_sync(
        "127.0.0.1",
        WIFI_SERVICE_NAME,
        "GetConnectAp",
        json!({}),
        Duration::from_millis(300),
        silent_port,
    );
    assert!(!result.success);
    assert!(result.error_message.starts_with("Timeout after"), "{}", result.error_message);
    assert!(begin.elapsed() < Duration::from_millis(1500));
    drop(silent);
}

/// Test that a rebind racing the last release keeps the service exposed
///
/// INTENTION: Releasing the last binding hides the service from the RPC server and
/// a new binding exposes it again. Whatever the interleaving, a live binding must
/// leave the service reachable.
#[test]
fn test_rebind_racing_release_keeps_connection() {
    let (manager, _wifi, _port) = started_manager("rpc-rebind-race");
    let server = manager.rpc_server().unwrap();

    let mut held = manager.bind(WIFI_SERVICE_NAME);
    assert!(held.is_valid());
    for _ in 0..25 {
        let barrier = Arc::new(Barrier::new(2));
        let release = {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                drop(held);
            })
        };
        barrier.wait();
        let next = manager.bind(WIFI_SERVICE_NAME);
        release.join().unwrap();

        assert!(next.is_valid());
        assert!(server.has_connection(WIFI_SERVICE_NAME));
        assert_eq!(manager.reference_count(WIFI_SERVICE_NAME), Some(1));
        held = next;
    }
    drop(held);
    assert!(!server.has_connection(WIFI_SERVICE_NAME));
}

/// Test that a client notices a peer that hangs up right after accepting
#[test]
fn test_client_reports_closed_link() {
    init_test_logging();
    let manager = ServiceManager::new(ServiceFactoryTable::new(), create_test_manager_config("rpc-hangup"));
    assert!(manager.start(ManagerStartConfig::default().with_poll_interval(Duration::from_millis(5))));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        drop(stream);
    });

    let client = manager.new_rpc_client(RpcClientConfig::default()).unwrap();
    assert!(client.connect("127.0.0.1", port, TIMEOUT));
    acceptor.join().unwrap();

    let deadline = Instant::now() + TIMEOUT;
    while client.is_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!client.is_connected());
    let result = client.call_function(WIFI_SERVICE_NAME, "GetConnectAp", Value::Null, TIMEOUT);
    assert_eq!(result.error_message, "Transport error: Not connected");
}
