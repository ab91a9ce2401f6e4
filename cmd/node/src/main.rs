//! Standalone node
//!
//! Starts a node with only the IO and manager endpoints and waits. Connect
//! with any line-oriented client to get the console:
//!
//!     cargo run -p nodelink-node -- 7000
//!     nc localhost 7000
//!
//! `shutdown` in the console stops the node.
//!
//! # Environment Variables
//!
//! - `NODELINK_LISTEN_IP`, `NODELINK_PORT`, `NODELINK_ADVERTISE_IP` - addresses
//! - `NODELINK_MAX_OPENING`, `NODELINK_IO_CHUNK`, `NODELINK_BACKLOG` - limits
//! - `NODELINK_LOG=<directives>` or `NODELINK_LOG_LEVEL=<level>` - logging

use nodelink::{logging, Node, NodeConfig};
use tracing::{error, info};

fn main() {
    logging::init();

    let mut config = NodeConfig::from_env().console(true);
    if let Some(port) = std::env::args().nth(1).and_then(|a| a.parse().ok()) {
        config = config.listen_port(port);
    }

    let node = match Node::start(config) {
        Ok(node) => node,
        Err(e) => {
            error!("cannot start node: {}", e);
            std::process::exit(1);
        }
    };
    info!("node {} ready; connect for a console", node.addr());
    println!("listening on {}", node.addr());

    if let Err(e) = node.join() {
        error!("node stopped with error: {}", e);
        std::process::exit(1);
    }
}
