//! Node configuration

use nodelink_core::constants::{DEFAULT_IO_CHUNK, LISTEN_BACKLOG, MAX_OPENING};
use nodelink_core::env::{parse_bool, parse_opt};
use nodelink_core::wire::MAX_FRAME_SIZE;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Configuration for a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the main listener binds (default: 0.0.0.0)
    pub listen_ip: Ipv4Addr,

    /// Port of the main listener; 0 lets the OS pick (default: 0)
    pub listen_port: u16,

    /// IP other nodes reach this node at. Defaults to `listen_ip`, or
    /// 127.0.0.1 when that is unspecified.
    pub advertise_ip: Option<Ipv4Addr>,

    /// Concurrently opening outbound connections per remote IP (default: 3)
    pub max_opening: usize,

    /// Read cap per socket per reactor pass, and the send-buffer level above
    /// which WRITE responses are withheld (default: 64 KiB)
    pub io_chunk: usize,

    /// Backlog for listen(2) (default: 10)
    pub listen_backlog: i32,

    /// Upper bound on one reactor poll; `None` blocks until an fd is ready
    pub poll_timeout: Option<Duration>,

    /// Hand non-peer clients of the main listener to the console (default: true)
    pub console: bool,

    /// Stack size for endpoint threads; `None` uses the std default
    pub worker_stack_size: Option<usize>,

    /// Local ports `lo..=hi` that outbound connects bind to; `None` lets the
    /// OS pick an ephemeral port
    pub client_ports: Option<(u16, u16)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
            advertise_ip: None,
            max_opening: MAX_OPENING,
            io_chunk: DEFAULT_IO_CHUNK,
            listen_backlog: LISTEN_BACKLOG,
            poll_timeout: None,
            console: true,
            worker_stack_size: None,
            client_ports: None,
        }
    }
}

impl NodeConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `NODELINK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `NODELINK_*` variables looked up through `var`
    ///
    /// Unset or malformed variables keep their default.
    pub fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            listen_ip: parse_opt(var("NODELINK_LISTEN_IP").as_deref()).unwrap_or(d.listen_ip),
            listen_port: parse_opt(var("NODELINK_PORT").as_deref()).unwrap_or(d.listen_port),
            advertise_ip: parse_opt(var("NODELINK_ADVERTISE_IP").as_deref()),
            max_opening: parse_opt(var("NODELINK_MAX_OPENING").as_deref()).unwrap_or(d.max_opening),
            io_chunk: parse_opt(var("NODELINK_IO_CHUNK").as_deref()).unwrap_or(d.io_chunk),
            listen_backlog: parse_opt(var("NODELINK_BACKLOG").as_deref()).unwrap_or(d.listen_backlog),
            poll_timeout: d.poll_timeout,
            console: parse_bool(var("NODELINK_CONSOLE").as_deref(), d.console),
            worker_stack_size: parse_opt(var("NODELINK_STACK_SIZE").as_deref()),
            client_ports: var("NODELINK_CLIENT_PORTS").as_deref().and_then(parse_port_range),
        }
    }

    pub fn listen_ip(mut self, ip: Ipv4Addr) -> Self {
        self.listen_ip = ip;
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn advertise_ip(mut self, ip: Ipv4Addr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }

    pub fn max_opening(mut self, n: usize) -> Self {
        self.max_opening = n;
        self
    }

    pub fn io_chunk(mut self, bytes: usize) -> Self {
        self.io_chunk = bytes;
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = Some(d);
        self
    }

    /// Enable or disable the console on the main listener
    pub fn console(mut self, enable: bool) -> Self {
        self.console = enable;
        self
    }

    pub fn worker_stack_size(mut self, bytes: usize) -> Self {
        self.worker_stack_size = Some(bytes);
        self
    }

    /// Bind outbound connects to local ports `lo..=hi`
    pub fn client_ports(mut self, lo: u16, hi: u16) -> Self {
        self.client_ports = Some((lo, hi));
        self
    }

    /// IP this node puts in its endpoint ids
    pub fn effective_ip(&self) -> Ipv4Addr {
        match self.advertise_ip {
            Some(ip) => ip,
            None if self.listen_ip.is_unspecified() => Ipv4Addr::LOCALHOST,
            None => self.listen_ip,
        }
    }

    /// Poll timeout in milliseconds, -1 for none
    pub(crate) fn poll_timeout_ms(&self) -> i32 {
        match self.poll_timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_opening == 0 {
            return Err("max_opening must be at least 1");
        }
        if self.io_chunk == 0 {
            return Err("io_chunk must be at least 1");
        }
        if self.io_chunk > MAX_FRAME_SIZE {
            return Err("io_chunk exceeds maximum frame size");
        }
        if self.listen_backlog <= 0 {
            return Err("listen_backlog must be positive");
        }
        if let Some((lo, hi)) = self.client_ports {
            if lo == 0 || lo > hi {
                return Err("client_ports must be a non-empty range above 0");
            }
        }
        Ok(())
    }
}

/// "lo-hi", or a single port
fn parse_port_range(s: &str) -> Option<(u16, u16)> {
    match s.trim().split_once('-') {
        Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
        None => {
            let port = s.trim().parse().ok()?;
            Some((port, port))
        }
    }
}
