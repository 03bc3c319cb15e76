// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-process conduit demo.
//
// Usage:
//   demo_conduit [num_requests]
//
// Runs a Both-side endpoint over a fresh shared segment, pushes a few
// requests from the "parent" side and lets the child loop reject each one,
// so the synthesized responses flow back through the parent loop and land
// in the dispatcher. Run with RUST_LOG=trace to watch the queues work.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use procipc::{
    ContBuf, FrameType, NodeHandler, NodeMsg, ProcConfig, ProcEndpoint, ProcSide, RpcDispatcher,
    RpcMsg, ShmOpenMode, ShmSegment,
};

struct PrintDispatcher;

impl RpcDispatcher for PrintDispatcher {
    fn send_response(&self, msg: RpcMsg) {
        println!(
            "rsp: handle={:#x} ref={} code={:#x} payload={:?}",
            msg.handle,
            msg.ref_id,
            msg.code,
            String::from_utf8_lossy(msg.cont_bytes()),
        );
    }

    fn register_broken_link(&self, msg: RpcMsg) {
        println!("regist broken link: handle={:#x}", msg.handle);
    }

    fn release_handle(&self, handle: u64, code: i32) {
        println!("release: handle={handle:#x} code={code:#x}");
    }
}

struct RejectingHandler;

impl NodeHandler for RejectingHandler {
    fn process(&self, msg: &mut NodeMsg) -> Result<(), i32> {
        let req = String::from_utf8_lossy(msg.rpc.cont_bytes()).into_owned();
        msg.rsp = Some(ContBuf::from_slice(
            format!("cannot handle: {req}").as_bytes(),
        ));
        Err(0x0201)
    }
}

fn main() {
    env_logger::init();

    let num_requests: u64 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);

    let seg_name = format!("demo_conduit_{}", std::process::id());
    ShmSegment::clear_storage(&seg_name);
    let seg = ShmSegment::acquire(&seg_name, 64 * 1024, ShmOpenMode::CreateOrOpen)
        .expect("acquire segment");

    let mut ep = ProcEndpoint::init(ProcConfig {
        name: "demo".to_string(),
        side: ProcSide::Both,
        region: seg.region(),
        dispatcher: Arc::new(PrintDispatcher),
        handler: Arc::new(RejectingHandler),
    })
    .expect("init endpoint");
    ep.run().expect("run endpoint");

    for i in 0..num_requests {
        let req = RpcMsg {
            handle: 0x1000 + i,
            ahandle: i,
            ref_id: 0x42,
            code: 0,
            cont: Some(ContBuf::from_slice(format!("query #{i}").as_bytes())),
        };
        ep.put_to_child_queue(
            &req.encode_head(),
            req.cont_bytes(),
            req.handle,
            req.ref_id,
            FrameType::Req,
        )
        .expect("put request");
    }

    // Give both loops time to drain before shutting down.
    thread::sleep(Duration::from_millis(200));

    ep.cleanup();
    seg.unlink();
}
