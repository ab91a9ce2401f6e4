//! Debug console
//!
//! A client that connects to the node's port without the node greeting
//! gets a console: one endpoint per session, reading lines over the
//! ordinary READ/WRITE protocol and answering with snapshots of the node.
//!
//! ```text
//!   > c          connections
//!   > l          listeners
//!   > r          endpoints ("threads")
//!   > v          admission table
//!   > k 7        KILL endpoint 7
//!   > s          shut the node down
//!   > q          close this session
//! ```

use crate::endpoint::Endpoint;
use crate::mailbox::Wait;
use crate::node::Node;
use crate::requests;

use nodelink_core::payload::{Kill, ReadResponse};
use nodelink_core::{tag, SocketId};

use std::fmt::Write as _;

use tracing::debug;

pub(crate) const PROMPT: &str = "\n> ";
const EOT: u8 = 4;

const HELP: &str = "\
Commands:
  connections, c     list connections
  listeners, l       list listeners
  threads, r         list endpoints
  servers, v         admission counters per remote IP
  kill, k <localid>  send KILL to an endpoint
  shutdown, s        stop the node
  quit, q, exit      close this session
  help, h, ?         this text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Empty,
    Connections,
    Listeners,
    Threads,
    Servers,
    Kill(Option<u32>),
    Shutdown,
    Quit,
    Help,
    Unknown(String),
}

pub(crate) fn parse(line: &str) -> Command {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Command::Empty;
    };
    match word {
        "connections" | "c" => Command::Connections,
        "listeners" | "l" => Command::Listeners,
        "threads" | "r" => Command::Threads,
        "servers" | "v" => Command::Servers,
        "kill" | "k" => Command::Kill(words.next().and_then(|w| w.parse().ok())),
        "shutdown" | "s" => Command::Shutdown,
        "quit" | "q" | "exit" => Command::Quit,
        "help" | "h" | "?" => Command::Help,
        other => Command::Unknown(other.to_string()),
    }
}

/// Text to send back for `command`
fn execute(endpoint: &Endpoint, command: &Command) -> String {
    let node = endpoint.node();
    let mut out = String::new();
    match command {
        Command::Empty => {}
        Command::Connections => render_connections(&node, &mut out),
        Command::Listeners => {
            for l in node.listeners() {
                let _ = writeln!(
                    out,
                    "{:>5}  {}:{:<6} owner {}{}  accepts {}",
                    l.sockid.serial,
                    l.ip,
                    l.port,
                    l.owner,
                    if l.main { " (node)" } else { "" },
                    l.pending_accepts
                );
            }
        }
        Command::Threads => {
            for e in node.endpoints() {
                let _ = writeln!(
                    out,
                    "{:>5}  {:<10} queued {:<4} links in {} out {}",
                    e.id.localid,
                    e.kind,
                    e.queued,
                    e.inlinks.len(),
                    e.outlinks.len()
                );
            }
        }
        Command::Servers => {
            for s in node.servers() {
                let _ = writeln!(
                    out,
                    "{:<16} waiting {:<3} opening {:<3} accepted {}",
                    s.ip, s.nwaiting, s.nopening, s.naccepted
                );
            }
        }
        Command::Kill(Some(localid)) => {
            let target = node.addr().endpoint(*localid);
            endpoint.send_payload(target, &Kill);
            let _ = writeln!(out, "Sent KILL to {}", target);
        }
        Command::Kill(None) => out.push_str("Usage: kill <localid>\n"),
        Command::Shutdown => {
            node.shutdown();
            out.push_str("Shutting down\n");
        }
        Command::Quit => out.push_str("Goodbye\n"),
        Command::Help => {
            out.push_str(HELP);
            out.push('\n');
        }
        Command::Unknown(word) => {
            let _ = writeln!(out, "Unknown command '{}'. Type help for a list.", word);
        }
    }
    out
}

fn render_connections(node: &Node, out: &mut String) {
    let stats = node.stats();
    let _ = writeln!(
        out,
        "{} connection(s), {} listener(s), {} endpoint(s)",
        stats.connections, stats.listeners, stats.endpoints
    );
    for c in node.connections() {
        let _ = writeln!(
            out,
            "{:>5}  {:<9} {}:{:<6} {:<22} owner {} send {} recv {} in {} out {}",
            c.sockid.serial,
            c.role,
            c.hostname,
            c.port,
            c.state.name(),
            c.owner,
            c.sendbuf,
            c.recvbuf,
            c.read,
            c.written
        );
    }
    let traffic = node.traffic();
    if !traffic.is_empty() {
        let _ = writeln!(out, "Traffic per destination:");
        for t in traffic {
            let _ = writeln!(out, "  {}:{:<6} read {} written {}", t.ip, t.port, t.read, t.written);
        }
    }
}

struct Session<'a> {
    endpoint: &'a Endpoint,
    sockid: SocketId,
    line: Vec<u8>,
    next_request: u32,
}

impl Session<'_> {
    fn request_id(&mut self) -> u32 {
        self.next_request = self.next_request.wrapping_add(1);
        self.next_request
    }

    fn read(&mut self) {
        let id = self.request_id();
        requests::send_read(self.endpoint, self.sockid, id);
    }

    fn write(&mut self, text: String) {
        let id = self.request_id();
        requests::send_write(self.endpoint, self.sockid, id, text.into_bytes());
    }

    fn close(&self) {
        requests::send_delete_connection(self.endpoint, self.sockid);
    }

    /// Feed received bytes; returns false once the session should end
    fn feed(&mut self, data: &[u8]) -> bool {
        for &byte in data {
            match byte {
                EOT => return false,
                b'\n' => {
                    let raw = std::mem::take(&mut self.line);
                    let text = String::from_utf8_lossy(&raw);
                    let command = parse(text.trim_end_matches('\r'));
                    debug!("console {}: {:?}", self.endpoint.id(), command);
                    let mut reply = execute(self.endpoint, &command);
                    if command == Command::Quit {
                        self.write(reply);
                        return false;
                    }
                    reply.push_str(PROMPT);
                    self.write(reply);
                }
                b => self.line.push(b),
            }
        }
        true
    }
}

/// Console endpoint body; `sockid` is the client connection
pub(crate) fn run(endpoint: &Endpoint, sockid: SocketId) {
    let mut session = Session { endpoint, sockid, line: Vec::new(), next_request: 0 };
    session.read();

    loop {
        let Some(msg) = endpoint.receive(Wait::Forever) else {
            continue;
        };
        match msg.tag {
            tag::READ_RESPONSE => {
                let Ok(response) = msg.decode::<ReadResponse>() else {
                    continue;
                };
                if response.is_eof() || !session.feed(&response.data) {
                    session.close();
                    continue;
                }
                session.read();
            }
            tag::CONNECTION_CLOSED => break,
            tag::KILL => {
                session.close();
                break;
            }
            _ => {}
        }
    }
    debug!("console {} closed", endpoint.id());
}
