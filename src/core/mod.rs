pub mod aggregator;
pub mod pipeline;
pub mod preselect;
pub mod result;
pub mod stats;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Transport protocol of an exported flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Icmp,
    Tcp,
    Udp,
    Gre,
    Esp,
    Icmp6,
    Other(u8),
}

impl Protocol {
    /// IANA protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Gre => 47,
            Protocol::Esp => 50,
            Protocol::Icmp6 => 58,
            Protocol::Other(n) => *n,
        }
    }

    pub fn from_number(n: u8) -> Self {
        match n {
            1 => Protocol::Icmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            47 => Protocol::Gre,
            50 => Protocol::Esp,
            58 => Protocol::Icmp6,
            other => Protocol::Other(other),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Protocol::Icmp => "ICMP".into(),
            Protocol::Tcp => "TCP".into(),
            Protocol::Udp => "UDP".into(),
            Protocol::Gre => "GRE".into(),
            Protocol::Esp => "ESP".into(),
            Protocol::Icmp6 => "ICMP6".into(),
            Protocol::Other(n) => n.to_string(),
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    /// Accepts protocol names (any case) or decimal protocol numbers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Ok(Protocol::from_number(n));
        }
        match s.to_ascii_uppercase().as_str() {
            "ICMP" => Ok(Protocol::Icmp),
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            "GRE" => Ok(Protocol::Gre),
            "ESP" => Ok(Protocol::Esp),
            "ICMP6" | "IPV6-ICMP" => Ok(Protocol::Icmp6),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// One exported flow. Immutable once produced by a record source.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub packets: u64,
    pub bytes: u64,
    pub url: Option<String>,
}

impl FlowRecord {
    /// Flow duration in seconds, millisecond resolution.
    pub fn duration_secs(&self) -> f64 {
        seconds_between(self.start_time, self.end_time)
    }

    pub fn target(&self) -> TargetKey {
        TargetKey {
            ip: self.dst_ip,
            port: self.dst_port,
        }
    }
}

/// Destination of a flow: the key of a target aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
