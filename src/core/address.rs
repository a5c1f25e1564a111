//! Purpose: Allocate per-session server addresses that never collide.
//! Exports: `ServerAddress`, `AddressAllocator`, `prepare_namespace`, `NAMESPACE_ADDRESS`.
//! Role: Keeps the mock server and any bridge process on disjoint (ip, port) pairs.
//! Invariants: Every address handed out is recorded in the tried-set and never reissued.
//! Invariants: Retries are bounded; exhaustion is an error, not a spin.
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

/// Fixed address used inside a private network namespace, where nothing else can collide.
pub const NAMESPACE_ADDRESS: ServerAddress = ServerAddress {
    ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
    port: 12345,
};

const DEFAULT_PORTS: RangeInclusive<u16> = 10000..=65535;
const DEFAULT_MAX_ATTEMPTS: usize = 64;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.socket_addr())
    }
}

impl From<SocketAddr> for ServerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IpStrategy {
    /// Random `127.a.b.c`; Linux routes all of 127/8 to `lo`.
    RandomLoopback,
    Fixed(IpAddr),
}

#[derive(Debug)]
pub struct AddressAllocator {
    strategy: IpStrategy,
    ports: RangeInclusive<u16>,
    max_attempts: usize,
    check_bind: bool,
    preferred: Option<ServerAddress>,
    tried: HashSet<ServerAddress>,
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressAllocator {
    pub fn new() -> Self {
        Self {
            strategy: IpStrategy::RandomLoopback,
            ports: DEFAULT_PORTS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            check_bind: true,
            preferred: None,
            tried: HashSet::new(),
        }
    }

    /// Keep a single ip and randomize only the port.
    pub fn with_ip(ip: IpAddr) -> Self {
        Self {
            strategy: IpStrategy::Fixed(ip),
            ..Self::new()
        }
    }

    /// Inside an isolated namespace: first hand out `NAMESPACE_ADDRESS`, then random ports.
    pub fn for_namespace() -> Self {
        Self {
            strategy: IpStrategy::Fixed(NAMESPACE_ADDRESS.ip),
            preferred: Some(NAMESPACE_ADDRESS),
            ..Self::new()
        }
    }

    pub fn with_port_range(mut self, ports: RangeInclusive<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Skip the "can I bind it right now" check (for pure bookkeeping use).
    pub fn without_bind_check(mut self) -> Self {
        self.check_bind = false;
        self
    }

    /// Record an address used elsewhere in the session so it is never handed out.
    pub fn reserve(&mut self, address: ServerAddress) -> bool {
        self.tried.insert(address)
    }

    pub fn is_taken(&self, address: &ServerAddress) -> bool {
        self.tried.contains(address)
    }

    pub fn allocate(&mut self) -> Result<ServerAddress, Error> {
        if let Some(preferred) = self.preferred.take() {
            if self.accept(preferred) {
                return Ok(preferred);
            }
        }
        let strategy = self.strategy;
        self.allocate_with(|bytes| match strategy {
            IpStrategy::RandomLoopback => {
                IpAddr::V4(Ipv4Addr::new(127, bytes[0], bytes[1], bytes[2].clamp(1, 254)))
            }
            IpStrategy::Fixed(ip) => ip,
        })
    }

    /// Allocate on a caller-chosen ip, e.g. a launcher that ignores its host parameter.
    pub fn allocate_on(&mut self, ip: IpAddr) -> Result<ServerAddress, Error> {
        self.allocate_with(|_| ip)
    }

    fn allocate_with(
        &mut self,
        ip_for: impl Fn(&[u8; 5]) -> IpAddr,
    ) -> Result<ServerAddress, Error> {
        let span = u32::from(*self.ports.end()) - u32::from(*self.ports.start()) + 1;
        for attempt in 0..self.max_attempts {
            let mut bytes = [0u8; 5];
            getrandom::fill(&mut bytes).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message(format!("random source failed: {err}"))
            })?;
            let port_seed = u32::from(u16::from_le_bytes([bytes[3], bytes[4]]));
            let port = *self.ports.start() as u32 + port_seed % span;
            let candidate = ServerAddress::new(ip_for(&bytes), port as u16);
            if self.accept(candidate) {
                tracing::debug!(address = %candidate, attempt, "address allocated");
                return Ok(candidate);
            }
        }
        Err(Error::new(ErrorKind::Exhausted)
            .with_message(format!(
                "no free address after {} attempts ({} already used this session)",
                self.max_attempts,
                self.tried.len()
            ))
            .with_hint("Widen the port range or raise the attempt limit."))
    }

    fn accept(&mut self, candidate: ServerAddress) -> bool {
        if self.tried.contains(&candidate) {
            return false;
        }
        if self.check_bind && TcpListener::bind(candidate.socket_addr()).is_err() {
            return false;
        }
        self.tried.insert(candidate)
    }
}

/// Bring up `lo` after `unshare -rn`, which leaves it down.
pub fn prepare_namespace() -> Result<(), Error> {
    match run_checked("ip", &["link", "set", "lo", "up"]) {
        Err(err) if err.kind() == ErrorKind::Usage => {
            run_checked("/sbin/ifconfig", &["lo", "up"])
        }
        other => other,
    }
}

fn run_checked(program: &str, args: &[&str]) -> Result<(), Error> {
    let status = Command::new(program).args(args).status().map_err(|err| {
        let kind = if err.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::Usage
        } else {
            ErrorKind::Io
        };
        Error::new(kind)
            .with_message(format!("failed to run {program}"))
            .with_source(err)
    })?;
    if !status.success() {
        return Err(Error::new(ErrorKind::CommandFailed)
            .with_message(format!("`{program} {}` failed", args.join(" ")))
            .with_exit_code(status.code().unwrap_or(-1)));
    }
    Ok(())
}
