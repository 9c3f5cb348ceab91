//! Integration tests for connection handling.
//!
//! Keep-alive, processor pooling, error paths, pause and resume, and AJP.

use portico::*;
use portico_testing::*;
use std::sync::Arc;

fn http11_with(
    config: ProtocolConfig,
    adapter: Arc<ScriptedAdapter>,
    script: &Arc<CodecScript>,
) -> ProtocolHandler {
    ProtocolHandler::http11()
        .config(config)
        .adapter(adapter)
        .codecs(script.factory())
        .build()
        .unwrap()
}

fn http11(adapter: Arc<ScriptedAdapter>, script: &Arc<CodecScript>) -> ProtocolHandler {
    http11_with(ProtocolConfig::default(), adapter, script)
}

fn attach() -> (Arc<MockSocket>, Arc<dyn SocketWrapper>) {
    let socket = Arc::new(MockSocket::new());
    let wrapper: Arc<dyn SocketWrapper> = socket.clone();
    (socket, wrapper)
}

// =============================================================================
// Keep-alive
// =============================================================================

#[test]
fn test_pipelined_requests_share_one_event() {
    let script = CodecScript::new();
    script
        .push_request(RequestHead::get("/one"))
        .push_request(RequestHead::get("/two"));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(
        adapter.calls()[..2],
        [
            AdapterCall::Service { uri: "/one".to_string() },
            AdapterCall::Service { uri: "/two".to_string() },
        ]
    );
    assert_eq!(script.statuses(), vec![200, 200]);
    assert_eq!(mock.request_count(), 2);
    assert_eq!(mock.read_interest_count(), 1);
    assert_eq!(protocol.recycled_count(), 1);
}

#[test]
fn test_keep_alive_limit_closes_connection() {
    let script = CodecScript::new();
    for uri in ["/1", "/2", "/3"] {
        script.push_request(RequestHead::get(uri));
    }

    let adapter = ScriptedAdapter::new().into_arc();
    let config = ProtocolConfig::new().max_keep_alive_requests(Some(2));
    let protocol = http11_with(config, adapter.clone(), &script);
    let (mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(script.statuses(), vec![200, 200]);
    assert_eq!(script.remaining(), 1);
    assert_eq!(mock.read_interest_count(), 0);
    assert_eq!(protocol.connection_count(), 0);
}

#[test]
fn test_single_request_connections() {
    let script = CodecScript::new();
    script
        .push_request(RequestHead::get("/only"))
        .push_request(RequestHead::get("/never"));

    let adapter = ScriptedAdapter::new().into_arc();
    let config = ProtocolConfig::new().max_keep_alive_requests(Some(1));
    let protocol = http11_with(config, adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(adapter.service_count(), 1);
}

#[test]
fn test_client_without_keep_alive() {
    let script = CodecScript::new();
    script.set_keep_alive(false);
    script
        .push_request(RequestHead::get("/a"))
        .push_request(RequestHead::get("/b"));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(adapter.service_count(), 1);
}

#[test]
fn test_error_status_drops_connection() {
    let script = CodecScript::new();
    script
        .push_request(RequestHead::get("/busy"))
        .push_request(RequestHead::get("/after"));

    let adapter = ScriptedAdapter::new()
        .on_service(|_request, response| {
            response.set_status(503);
            Ok(())
        })
        .into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(script.statuses(), vec![503]);
    assert_eq!(adapter.service_count(), 1);
    assert_eq!(protocol.stats().error_count, 1);
}

#[test]
fn test_incomplete_head_waits_for_more_data() {
    let script = CodecScript::new();
    script.push_status(ParseStatus::Incomplete);

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (mock, socket) = attach();

    // The processor stays with the socket until the rest of the head arrives
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Long);
    assert_eq!(protocol.connection_count(), 1);
    assert_eq!(protocol.waiting_count(), 0);
    assert_eq!(mock.read_interest_count(), 1);

    script.push_request(RequestHead::get("/late"));
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(adapter.service_count(), 1);
    assert_eq!(protocol.connection_count(), 0);
}

#[test]
fn test_failed_expectation_with_consumed_body_keeps_connection() {
    let script = CodecScript::new();
    script
        .push_request(RequestHead::post("/upload").expect_continue())
        .push_request(RequestHead::get("/next"));

    let adapter = ScriptedAdapter::new()
        .on_service(|_request, response| {
            response.set_status(417);
            Ok(())
        })
        .into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    // The scripted codec reports the body as fully read, so the connection survives
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(adapter.service_count(), 2);
    assert_eq!(script.count(&CodecCall::SwallowInput(false)), 0);
}

// =============================================================================
// Error paths
// =============================================================================

#[test]
fn test_malformed_request_answers_400() {
    let script = CodecScript::new();
    script.push(Parse::Malformed("bad request line".to_string()));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(script.statuses(), vec![400]);
    assert_eq!(adapter.service_count(), 0);
    assert_eq!(script.count(&CodecCall::SwallowInput(false)), 1);
}

#[test]
fn test_connection_reset_closes_silently() {
    let script = CodecScript::new();
    script.push(Parse::ConnectionReset);

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert!(script.statuses().is_empty());
    assert_eq!(adapter.service_count(), 0);
}

#[test]
fn test_adapter_failure_answers_500() {
    let script = CodecScript::new();
    script
        .push_request(RequestHead::get("/boom"))
        .push_request(RequestHead::get("/after"));

    let adapter = ScriptedAdapter::new()
        .on_service(|_request, _response| Err(Error::Adapter("handler panicked".to_string())))
        .into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(script.statuses(), vec![500]);
    assert_eq!(adapter.service_count(), 1);
    assert_eq!(script.remaining(), 1);
}

#[test]
fn test_end_of_stream_closes() {
    let script = CodecScript::new();
    script.push_status(ParseStatus::EndOfStream);

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert!(script.statuses().is_empty());
    assert_eq!(protocol.connection_count(), 0);
}

#[test]
fn test_disconnect_before_processing() {
    let script = CodecScript::new();
    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::Disconnect), SocketState::Closed);
    assert_eq!(protocol.process(&socket, SocketEvent::Error), SocketState::Closed);
    assert!(script.calls().is_empty());
    assert_eq!(protocol.recycled_count(), 0);
}

// =============================================================================
// Processor pool
// =============================================================================

#[test]
fn test_processor_reused_across_connections() {
    let script = CodecScript::new();
    script.push_request(RequestHead::get("/first"));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);

    let (_a, first) = attach();
    assert_eq!(protocol.process(&first, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(protocol.recycled_count(), 1);

    script.push_request(RequestHead::get("/second"));
    let (_b, second) = attach();
    assert_eq!(protocol.process(&second, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(protocol.recycled_count(), 1);
    assert_eq!(protocol.handler().global().live_count(), 1);
    assert_eq!(protocol.stats().request_count, 2);
}

#[test]
fn test_pool_capacity_is_respected() {
    let script = CodecScript::new();
    script
        .push_request(RequestHead::get("/a"))
        .push_request(RequestHead::get("/b"));

    let handles = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let slot = handles.clone();
    let callback = RecordingCallback::new();
    let adapter = ScriptedAdapter::new()
        .on_service(move |request, _response| {
            slot.lock().push(request.start_async(callback.clone())?);
            Ok(())
        })
        .into_arc();
    let config = ProtocolConfig::new().processor_cache(Some(1));
    let protocol = http11_with(config, adapter.clone(), &script);

    // Two connections suspended at once need two processors
    let (_a, first) = attach();
    let (_b, second) = attach();
    assert_eq!(protocol.process(&first, SocketEvent::OpenRead), SocketState::Long);
    assert_eq!(protocol.process(&second, SocketEvent::OpenRead), SocketState::Long);
    assert_eq!(protocol.connection_count(), 2);

    let handles: Vec<AsyncHandle> = std::mem::take(&mut *handles.lock());
    for (handle, socket) in handles.iter().zip([&first, &second]) {
        handle.complete().unwrap();
        assert_eq!(protocol.process(socket, SocketEvent::OpenRead), SocketState::Open);
    }

    // Only one fits back in the pool; the other's numbers stay in the totals
    assert_eq!(protocol.recycled_count(), 1);
    assert_eq!(protocol.handler().global().live_count(), 1);
    assert_eq!(protocol.stats().request_count, 2);
}

#[test]
fn test_disabled_pool_never_keeps_processors() {
    let script = CodecScript::new();
    script.push_request(RequestHead::get("/a"));

    let adapter = ScriptedAdapter::new().into_arc();
    let config = ProtocolConfig::new().processor_cache(Some(0));
    let protocol = http11_with(config, adapter, &script);
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(protocol.recycled_count(), 0);
    assert_eq!(protocol.stats().request_count, 1);
}

#[test]
fn test_release_socket_returns_processor() {
    let script = CodecScript::new();
    script.push_status(ParseStatus::Incomplete);

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    let (mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Long);
    protocol.release_socket(mock.id());

    assert_eq!(protocol.connection_count(), 0);
    assert_eq!(protocol.recycled_count(), 1);
    assert!(adapter.calls().contains(&AdapterCall::CheckRecycled));
}

#[test]
fn test_stop_empties_pool() {
    let script = CodecScript::new();
    script.push_request(RequestHead::get("/a"));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter, &script);
    protocol.init().unwrap();
    protocol.start().unwrap();

    let (_mock, socket) = attach();
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(protocol.recycled_count(), 1);

    protocol.stop();
    assert_eq!(protocol.recycled_count(), 0);
    assert_eq!(protocol.stats().request_count, 1);
}

// =============================================================================
// Pause
// =============================================================================

#[test]
fn test_paused_handler_refuses_new_requests() {
    let script = CodecScript::new();
    script.push_request(RequestHead::get("/later"));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = http11(adapter.clone(), &script);
    protocol.init().unwrap();
    protocol.start().unwrap();
    protocol.pause();
    assert!(protocol.is_paused());

    let (_mock, socket) = attach();
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(adapter.service_count(), 0);

    protocol.resume();
    assert!(!protocol.is_paused());
    let (_mock, socket) = attach();
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(adapter.service_count(), 1);

    protocol.stop();
    protocol.destroy();
    assert_eq!(protocol.state(), LifecycleState::Destroyed);
}

#[test]
fn test_pause_closes_after_async_dispatch() {
    let script = CodecScript::new();
    script.push_request(RequestHead::get("/slow"));

    let handles = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let slot = handles.clone();
    let callback = RecordingCallback::new();
    let adapter = ScriptedAdapter::new()
        .on_service(move |request, _response| {
            slot.lock().push(request.start_async(callback.clone())?);
            Ok(())
        })
        .into_arc();
    let protocol = http11(adapter, &script);
    protocol.init().unwrap();
    protocol.start().unwrap();

    let (_mock, socket) = attach();
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Long);

    // Suspended requests still finish, but the connection is not reused
    protocol.pause();
    let handle: AsyncHandle = handles.lock().remove(0);
    handle.complete().unwrap();
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    protocol.stop();
}

// =============================================================================
// AJP
// =============================================================================

#[test]
fn test_ajp_answers_ping_then_serves() {
    let script = CodecScript::new();
    script
        .push_status(ParseStatus::Ping)
        .push_request(RequestHead::get("/ajp"));

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = ProtocolHandler::ajp()
        .adapter(adapter.clone())
        .codecs(script.factory())
        .build()
        .unwrap();
    assert_eq!(protocol.name(), "ajp");

    let (_mock, socket) = attach();
    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Open);
    assert_eq!(adapter.service_count(), 1);
    assert_eq!(script.statuses(), vec![200]);
    assert!(script.count(&CodecCall::NextRequest) >= 2);
}

#[test]
fn test_ajp_unexpected_packet_closes() {
    let script = CodecScript::new();
    script.push_status(ParseStatus::Http2Preface);

    let adapter = ScriptedAdapter::new().into_arc();
    let protocol = ProtocolHandler::ajp()
        .adapter(adapter.clone())
        .codecs(script.factory())
        .build()
        .unwrap();
    let (_mock, socket) = attach();

    assert_eq!(protocol.process(&socket, SocketEvent::OpenRead), SocketState::Closed);
    assert_eq!(adapter.service_count(), 0);
}

#[test]
fn test_ajp_rejects_upgrade_protocols() {
    let script = CodecScript::new();
    let result = ProtocolHandler::ajp()
        .adapter(ScriptedAdapter::new().into_arc())
        .codecs(script.factory())
        .upgrade(MockUpgradeProtocol::new("h2c").into_arc())
        .build();

    assert!(matches!(result, Err(Error::Config(_))));
}
