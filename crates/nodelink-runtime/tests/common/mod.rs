//! Shared helpers for the runtime integration tests.

#![allow(dead_code)]

use nodelink_core::{EndpointId, Message, Payload};
use nodelink_runtime::{logging, Endpoint, Node, NodeConfig};

use std::net::Ipv4Addr;
use std::sync::mpsc;
use std::time::Duration;

/// How long any single step may take before the test fails
pub const STEP: Duration = Duration::from_secs(10);

pub fn config() -> NodeConfig {
    NodeConfig::new().listen_ip(Ipv4Addr::LOCALHOST)
}

pub fn start_node() -> Node {
    start_with(config())
}

pub fn start_with(config: NodeConfig) -> Node {
    logging::init_for_tests();
    Node::start(config).expect("node start")
}

pub fn stop(node: Node) {
    node.shutdown();
    node.join().expect("node join");
}

/// Next message, failing the test on timeout
pub fn next(ep: &Endpoint) -> Message {
    ep.receive(STEP).expect("timed out waiting for a message")
}

/// Next message, which must carry `P`
pub fn expect<P: Payload>(ep: &Endpoint) -> P {
    let msg = next(ep);
    assert_eq!(msg.tag, P::TAG, "expected tag {} got {} from {}", P::TAG, msg.tag, msg.source);
    msg.decode::<P>().expect("decode")
}

/// Next message with tag `P::TAG`, skipping anything else
pub fn wait_for<P: Payload>(ep: &Endpoint) -> P {
    loop {
        let msg = next(ep);
        if msg.tag == P::TAG {
            return msg.decode::<P>().expect("decode");
        }
    }
}

/// Start an endpoint and hand its id back to the test thread
pub fn spawn<F>(node: &Node, kind: &str, body: F) -> EndpointId
where
    F: FnOnce(&Endpoint) + Send + 'static,
{
    node.add_thread(kind, body).expect("add_thread")
}

/// Endpoint that reports every message it receives until KILL
pub fn recorder(node: &Node) -> (EndpointId, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel();
    let id = spawn(node, "recorder", move |ep| {
        while let Some(msg) = ep.receive(STEP * 3) {
            if msg.tag == nodelink_core::tag::KILL {
                break;
            }
            if tx.send(msg).is_err() {
                break;
            }
        }
    });
    (id, rx)
}
