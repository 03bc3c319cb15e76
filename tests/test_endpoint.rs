// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Endpoint lifecycle, handle tracking, child-death handling and the
// single-process (Both) request/response round trip.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use procipc::{
    ContBuf, FrameType, NodeHandler, NodeMsg, ProcConfig, ProcEndpoint, ProcSide, RpcDispatcher,
    RpcMsg, ShmOpenMode, ShmSegment, NODE_OFFLINE,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("procipc_{prefix}_ep_{}_{n}", std::process::id())
}

fn test_segment(prefix: &str, size: usize) -> ShmSegment {
    let name = unique_name(prefix);
    ShmSegment::clear_storage(&name);
    let seg = ShmSegment::acquire(&name, size, ShmOpenMode::CreateOrOpen).expect("acquire");
    seg.unlink();
    seg
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

// ---------------------------------------------------------------------------
// Mock collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingDispatcher {
    responses: Mutex<Vec<RpcMsg>>,
    registered: Mutex<Vec<u64>>,
    released: Mutex<Vec<(u64, i32)>>,
}

impl RecordingDispatcher {
    fn response_count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl RpcDispatcher for RecordingDispatcher {
    fn send_response(&self, msg: RpcMsg) {
        self.responses.lock().unwrap().push(msg);
    }

    fn register_broken_link(&self, msg: RpcMsg) {
        self.registered.lock().unwrap().push(msg.handle);
    }

    fn release_handle(&self, handle: u64, code: i32) {
        self.released.lock().unwrap().push((handle, code));
    }
}

/// Accepts every request.
#[derive(Default)]
struct OkHandler {
    calls: AtomicUsize,
}

impl NodeHandler for OkHandler {
    fn process(&self, _msg: &mut NodeMsg) -> Result<(), i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Rejects every request with a fixed code and echoes the request payload
/// back as the response payload.
struct RejectingHandler {
    code: i32,
}

impl NodeHandler for RejectingHandler {
    fn process(&self, msg: &mut NodeMsg) -> Result<(), i32> {
        msg.rsp = Some(ContBuf::from_slice(msg.rpc.cont_bytes()));
        Err(self.code)
    }
}

fn endpoint(
    prefix: &str,
    side: ProcSide,
    dispatcher: Arc<RecordingDispatcher>,
    handler: Arc<dyn NodeHandler>,
) -> (ShmSegment, ProcEndpoint) {
    let seg = test_segment(prefix, 64 * 1024);
    let ep = ProcEndpoint::init(ProcConfig {
        name: prefix.to_string(),
        side,
        region: seg.region(),
        dispatcher,
        handler,
    })
    .expect("init endpoint");
    (seg, ep)
}

fn req_frame(handle: u64, ref_id: u64, payload: &[u8]) -> (RpcMsg, Vec<u8>) {
    let msg = RpcMsg {
        handle,
        ahandle: handle ^ 0xFF,
        ref_id,
        code: 0,
        cont: Some(ContBuf::from_slice(payload)),
    };
    let head = msg.encode_head().to_vec();
    (msg, head)
}

// ---------------------------------------------------------------------------
// Handle tracking
// ---------------------------------------------------------------------------

#[test]
fn handle_register_then_remove() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, ep) = endpoint(
        "handles",
        ProcSide::Parent,
        Arc::clone(&dispatcher),
        Arc::new(OkHandler::default()),
    );

    let (msg, head) = req_frame(0xDEAD_BEEF, 0x42, b"payload");
    ep.put_to_child_queue(&head, msg.cont_bytes(), msg.handle, msg.ref_id, FrameType::Req)
        .expect("put req");
    assert_eq!(ep.rpc_handle_count().expect("count"), 1);

    assert_eq!(ep.remove_rpc_handle(0xDEAD_BEEF).expect("remove"), 0x42);
    assert_eq!(ep.remove_rpc_handle(0xDEAD_BEEF).expect("remove again"), 0);
    assert_eq!(ep.rpc_handle_count().expect("count"), 0);
}

#[test]
fn zero_handle_is_not_registered() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, ep) = endpoint(
        "handles_zero",
        ProcSide::Parent,
        Arc::clone(&dispatcher),
        Arc::new(OkHandler::default()),
    );

    let (msg, head) = req_frame(0, 7, b"no handle");
    ep.put_to_child_queue(&head, msg.cont_bytes(), 0, 7, FrameType::Req)
        .expect("put req");
    assert_eq!(ep.rpc_handle_count().expect("count"), 0);
}

#[test]
fn duplicate_handle_overwrites_ref() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, ep) = endpoint(
        "handles_dup",
        ProcSide::Parent,
        Arc::clone(&dispatcher),
        Arc::new(OkHandler::default()),
    );

    let (msg, head) = req_frame(0x99, 1, b"first");
    ep.put_to_child_queue(&head, msg.cont_bytes(), 0x99, 1, FrameType::Req)
        .expect("put");
    let (msg, head) = req_frame(0x99, 2, b"second");
    ep.put_to_child_queue(&head, msg.cont_bytes(), 0x99, 2, FrameType::Req)
        .expect("put");

    assert_eq!(ep.rpc_handle_count().expect("count"), 1);
    assert_eq!(ep.remove_rpc_handle(0x99).expect("remove"), 2);
}

// ---------------------------------------------------------------------------
// Child death
// ---------------------------------------------------------------------------

#[test]
fn close_rpc_handles_fails_outstanding_requests() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, ep) = endpoint(
        "child_death",
        ProcSide::Parent,
        Arc::clone(&dispatcher),
        Arc::new(OkHandler::default()),
    );

    for handle in [0x0A, 0x0B, 0x0C] {
        let (msg, head) = req_frame(handle, handle + 100, b"pending");
        ep.put_to_child_queue(&head, msg.cont_bytes(), handle, handle + 100, FrameType::Req)
            .expect("put");
    }
    assert_eq!(ep.rpc_handle_count().expect("count"), 3);

    ep.close_rpc_handles().expect("close");

    let responses = dispatcher.responses.lock().unwrap();
    assert_eq!(responses.len(), 3);
    let mut handles: Vec<u64> = responses.iter().map(|m| m.handle).collect();
    handles.sort_unstable();
    assert_eq!(handles, vec![0x0A, 0x0B, 0x0C]);
    for rsp in responses.iter() {
        assert_eq!(rsp.code, NODE_OFFLINE);
    }
    drop(responses);

    assert_eq!(ep.rpc_handle_count().expect("count"), 0);
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn stop_joins_consumers_promptly() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let handler = Arc::new(OkHandler::default());
    let (_seg, mut ep) = endpoint(
        "stop",
        ProcSide::Both,
        Arc::clone(&dispatcher),
        Arc::clone(&handler) as Arc<dyn NodeHandler>,
    );
    ep.run().expect("run");

    // One request through the child loop first, so the consumer is past
    // startup and parked on the semaphore when stop() wakes it.
    let (msg, head) = req_frame(0x1, 0x2, b"warmup");
    ep.put_to_child_queue(&head, msg.cont_bytes(), 0, 0, FrameType::Req)
        .expect("put");
    assert!(wait_until(Duration::from_secs(2), || {
        handler.calls.load(Ordering::SeqCst) == 1
    }));

    let start = Instant::now();
    ep.stop();
    assert!(
        start.elapsed() < Duration::from_millis(100),
        "stop took {:?}",
        start.elapsed()
    );
}

#[test]
fn run_twice_is_idempotent() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, mut ep) = endpoint(
        "run_twice",
        ProcSide::Both,
        Arc::clone(&dispatcher),
        Arc::new(OkHandler::default()),
    );
    ep.run().expect("run");
    ep.run().expect("run again");
    ep.stop();
}

// ---------------------------------------------------------------------------
// End-to-end dispatch (single-process Both mode)
// ---------------------------------------------------------------------------

#[test]
fn rejected_request_round_trips_as_response() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, mut ep) = endpoint(
        "round_trip",
        ProcSide::Both,
        Arc::clone(&dispatcher),
        Arc::new(RejectingHandler { code: 0x77 }),
    );
    ep.run().expect("run");

    let (msg, head) = req_frame(0xABC, 7, b"do the thing");
    ep.put_to_child_queue(&head, msg.cont_bytes(), msg.handle, msg.ref_id, FrameType::Req)
        .expect("put");

    assert!(wait_until(Duration::from_secs(2), || {
        dispatcher.response_count() == 1
    }));

    let responses = dispatcher.responses.lock().unwrap();
    let rsp = &responses[0];
    assert_eq!(rsp.handle, 0xABC);
    assert_eq!(rsp.ahandle, 0xABC ^ 0xFF);
    assert_eq!(rsp.ref_id, 7);
    assert_eq!(rsp.code, 0x77);
    assert_eq!(rsp.cont_bytes(), b"do the thing");
    drop(responses);

    // The parent loop removed the handle when the response came through.
    assert_eq!(ep.rpc_handle_count().expect("count"), 0);
}

#[test]
fn accepted_request_produces_no_response() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let handler = Arc::new(OkHandler::default());
    let (_seg, mut ep) = endpoint(
        "accepted",
        ProcSide::Both,
        Arc::clone(&dispatcher),
        Arc::clone(&handler) as Arc<dyn NodeHandler>,
    );
    ep.run().expect("run");

    let (msg, head) = req_frame(0x5, 0x6, b"fire and forget");
    ep.put_to_child_queue(&head, msg.cont_bytes(), 0, 0, FrameType::Req)
        .expect("put");

    assert!(wait_until(Duration::from_secs(2), || {
        handler.calls.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(dispatcher.response_count(), 0);
}

#[test]
fn regist_and_release_reach_the_dispatcher() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, mut ep) = endpoint(
        "regist_release",
        ProcSide::Both,
        Arc::clone(&dispatcher),
        Arc::new(OkHandler::default()),
    );
    ep.run().expect("run");

    // Register a handle so the RELEASE below has something to remove.
    let (msg, head) = req_frame(0x9, 0x90, b"held");
    ep.put_to_child_queue(&head, msg.cont_bytes(), 0x9, 0x90, FrameType::Req)
        .expect("put req");

    let regist = RpcMsg {
        handle: 0x5,
        ..Default::default()
    };
    ep.put_to_parent_queue(&regist.encode_head(), &[], FrameType::Regist)
        .expect("put regist");

    let release = RpcMsg {
        handle: 0x9,
        code: 3,
        ..Default::default()
    };
    ep.put_to_parent_queue(&release.encode_head(), &[], FrameType::Release)
        .expect("put release");

    assert!(wait_until(Duration::from_secs(2), || {
        !dispatcher.released.lock().unwrap().is_empty()
    }));

    assert_eq!(*dispatcher.registered.lock().unwrap(), vec![0x5]);
    assert_eq!(*dispatcher.released.lock().unwrap(), vec![(0x9, 3)]);
    assert_eq!(ep.rpc_handle_count().expect("count"), 0);
}

#[test]
fn many_requests_round_trip_in_order() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let (_seg, mut ep) = endpoint(
        "many",
        ProcSide::Both,
        Arc::clone(&dispatcher),
        Arc::new(RejectingHandler { code: 1 }),
    );
    ep.run().expect("run");

    let count = 50u64;
    for i in 0..count {
        let payload = format!("req-{i}");
        let (msg, head) = req_frame(0x1000 + i, i, payload.as_bytes());
        ep.put_to_child_queue(&head, msg.cont_bytes(), msg.handle, msg.ref_id, FrameType::Req)
            .expect("put");
    }

    assert!(wait_until(Duration::from_secs(5), || {
        dispatcher.response_count() == count as usize
    }));

    let responses = dispatcher.responses.lock().unwrap();
    for (i, rsp) in responses.iter().enumerate() {
        assert_eq!(rsp.handle, 0x1000 + i as u64);
        assert_eq!(rsp.cont_bytes(), format!("req-{i}").as_bytes());
    }
    drop(responses);

    assert_eq!(ep.rpc_handle_count().expect("count"), 0);
}
