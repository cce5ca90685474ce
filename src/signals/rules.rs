use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{FlowRecord, Protocol};
use crate::error::ConfigError;
use crate::signals::Signature;

/// A criterion value as written in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriterionValue {
    Integer(i64),
    Float(f64),
    Text(String),
    Pattern { pattern: String },
}

/// Quantities a bound criterion can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    // Per flow: checkable from a single record.
    Packets,
    Bytes,
    Duration,
    // Aggregated over a target.
    Flows,
    PacketsMean,
    PacketsStdev,
    BytesMean,
    BytesStdev,
    DurationMean,
    DurationStdev,
    TotalDuration,
    Activity,
    Urls,
}

impl Metric {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "packets" => Metric::Packets,
            "bytes" => Metric::Bytes,
            "duration" => Metric::Duration,
            "flows" => Metric::Flows,
            "packets_mean" => Metric::PacketsMean,
            "packets_stdev" => Metric::PacketsStdev,
            "bytes_mean" => Metric::BytesMean,
            "bytes_stdev" => Metric::BytesStdev,
            "duration_mean" => Metric::DurationMean,
            "duration_stdev" => Metric::DurationStdev,
            "total_duration" => Metric::TotalDuration,
            "activity" => Metric::Activity,
            "urls" => Metric::Urls,
            _ => return None,
        })
    }

    pub fn is_per_flow(&self) -> bool {
        matches!(self, Metric::Packets | Metric::Bytes | Metric::Duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub enum UrlMatch {
    Exact(String),
    Pattern(Regex),
}

impl UrlMatch {
    fn is_match(&self, url: &str) -> bool {
        match self {
            UrlMatch::Exact(s) => s == url,
            UrlMatch::Pattern(re) => re.is_match(url),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Check {
    Port(u16),
    Protocol(Protocol),
    Url(UrlMatch),
    Bound {
        metric: Metric,
        bound: Bound,
        threshold: f64,
    },
}

/// Anything a criterion can be evaluated against: a single record during
/// preselection, or a fully folded target during matching.
pub trait Observation {
    /// Whether the coarse criteria of `signature` held together on one flow.
    fn admitted(&self, signature: &Signature) -> bool;
    fn port(&self) -> u16;
    fn has_protocol(&self, protocol: Protocol) -> bool;
    fn any_url(&self, pred: &dyn Fn(&str) -> bool) -> bool;
    /// The value a `bound` on `metric` is compared with, `None` if this
    /// observation cannot provide it.
    fn bounded_value(&self, metric: Metric, bound: Bound) -> Option<f64>;
}

impl Observation for FlowRecord {
    fn admitted(&self, signature: &Signature) -> bool {
        signature.admits(self)
    }

    fn port(&self) -> u16 {
        self.dst_port
    }

    fn has_protocol(&self, protocol: Protocol) -> bool {
        self.protocol == protocol
    }

    fn any_url(&self, pred: &dyn Fn(&str) -> bool) -> bool {
        self.url.as_deref().is_some_and(pred)
    }

    fn bounded_value(&self, metric: Metric, _bound: Bound) -> Option<f64> {
        match metric {
            Metric::Packets => Some(self.packets as f64),
            Metric::Bytes => Some(self.bytes as f64),
            Metric::Duration => Some(self.duration_secs()),
            _ => None,
        }
    }
}

/// One parsed `key = value` pair of a signature.
#[derive(Debug, Clone)]
pub struct Criterion {
    pub key: String,
    pub check: Check,
}

impl Criterion {
    pub fn parse(signature: &str, key: &str, value: &CriterionValue) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidCriterion {
            signature: signature.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let check = match key {
            "port" => match value {
                CriterionValue::Integer(n) => {
                    Check::Port(u16::try_from(*n).map_err(|_| invalid("port out of range"))?)
                }
                _ => return Err(invalid("expected an integer port")),
            },
            "protocol" => match value {
                CriterionValue::Text(s) => Check::Protocol(
                    s.parse().map_err(|_| invalid("unknown protocol name"))?,
                ),
                CriterionValue::Integer(n) => Check::Protocol(Protocol::from_number(
                    u8::try_from(*n).map_err(|_| invalid("protocol number out of range"))?,
                )),
                _ => return Err(invalid("expected a protocol name or number")),
            },
            "url" => match value {
                CriterionValue::Text(s) => Check::Url(UrlMatch::Exact(s.clone())),
                CriterionValue::Pattern { pattern } => {
                    let re = Regex::new(pattern).map_err(|source| ConfigError::BadPattern {
                        signature: signature.to_string(),
                        key: key.to_string(),
                        source,
                    })?;
                    Check::Url(UrlMatch::Pattern(re))
                }
                _ => return Err(invalid("expected a url or { pattern = \"...\" }")),
            },
            _ => {
                let (bound, rest) = if let Some(rest) = key.strip_prefix("min_") {
                    (Bound::Min, rest)
                } else if let Some(rest) = key.strip_prefix("max_") {
                    (Bound::Max, rest)
                } else {
                    return Err(unknown(signature, key));
                };
                let metric = Metric::from_name(rest).ok_or_else(|| unknown(signature, key))?;
                let threshold = match value {
                    CriterionValue::Integer(n) => *n as f64,
                    CriterionValue::Float(f) if f.is_finite() => *f,
                    _ => return Err(invalid("expected a finite number")),
                };
                Check::Bound {
                    metric,
                    bound,
                    threshold,
                }
            }
        };

        Ok(Self {
            key: key.to_string(),
            check,
        })
    }

    /// Coarse criteria can be decided from one record.
    pub fn is_coarse(&self) -> bool {
        match &self.check {
            Check::Port(_) | Check::Protocol(_) | Check::Url(_) => true,
            Check::Bound { metric, .. } => metric.is_per_flow(),
        }
    }

    pub fn holds<O: Observation + ?Sized>(&self, obs: &O) -> bool {
        match &self.check {
            Check::Port(port) => obs.port() == *port,
            Check::Protocol(protocol) => obs.has_protocol(*protocol),
            Check::Url(m) => obs.any_url(&|url: &str| m.is_match(url)),
            Check::Bound {
                metric,
                bound,
                threshold,
            } => match obs.bounded_value(*metric, *bound) {
                Some(v) => match bound {
                    Bound::Min => v >= *threshold,
                    Bound::Max => v <= *threshold,
                },
                None => false,
            },
        }
    }
}

fn unknown(signature: &str, key: &str) -> ConfigError {
    ConfigError::UnknownCriterion {
        signature: signature.to_string(),
        key: key.to_string(),
    }
}
