//! TCP port reachability watcher

use crate::error::{OpsError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// `host:port` to probe
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PortTarget {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl FromStr for PortTarget {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| OpsError::InvalidArgument(format!("'{}' is not host:port", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(OpsError::InvalidArgument(format!("'{}' has no host", s)));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| OpsError::InvalidArgument(format!("'{}' has an invalid port", s)))?;
        if port == 0 {
            return Err(OpsError::InvalidArgument(format!("'{}': port 0 cannot be probed", s)));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for PortTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Reachability of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// Accepting connections
    Open,
    /// Refused, unreachable or timed out
    Closed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Checks whether a target accepts connections
pub trait PortProbe {
    /// Probe once
    fn probe(&self, target: &PortTarget) -> PortState;
}

/// TCP connect with a timeout
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// Probe with the given connect timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PortProbe for TcpProbe {
    fn probe(&self, target: &PortTarget) -> PortState {
        let addrs = match (target.host.as_str(), target.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!("Cannot resolve {}: {}", target, e);
                return PortState::Closed;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.timeout).is_ok() {
                return PortState::Open;
            }
        }
        PortState::Closed
    }
}

/// State change of one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortTransition {
    /// Target that changed
    pub target: PortTarget,
    /// Earlier state; `None` on the first observation
    pub previous: Option<PortState>,
    /// State now
    pub current: PortState,
    /// When the change was seen
    pub at: DateTime<Utc>,
}

impl fmt::Display for PortTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.previous {
            Some(prev) => write!(f, "{} {} -> {}", self.target, prev, self.current),
            None => write!(f, "{} {}", self.target, self.current),
        }
    }
}

/// Remembers the last state of each target and reports changes
pub struct PortWatcher<P: PortProbe> {
    probe: P,
    targets: Vec<PortTarget>,
    last: HashMap<PortTarget, PortState>,
}

impl<P: PortProbe> PortWatcher<P> {
    /// Watch `targets` with `probe`
    pub fn new(probe: P, targets: Vec<PortTarget>) -> Self {
        Self {
            probe,
            targets,
            last: HashMap::new(),
        }
    }

    /// Last known state of a target
    pub fn state(&self, target: &PortTarget) -> Option<PortState> {
        self.last.get(target).copied()
    }

    /// Probe every target; the first poll reports every target's initial state
    pub fn poll(&mut self) -> Vec<PortTransition> {
        let now = Utc::now();
        let mut transitions = Vec::new();
        for target in &self.targets {
            let current = self.probe.probe(target);
            let previous = self.last.insert(target.clone(), current);
            if previous != Some(current) {
                transitions.push(PortTransition {
                    target: target.clone(),
                    previous,
                    current,
                    at: now,
                });
            }
        }
        transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::net::TcpListener;

    struct Scripted(RefCell<VecDeque<PortState>>);

    impl PortProbe for Scripted {
        fn probe(&self, _target: &PortTarget) -> PortState {
            self.0.borrow_mut().pop_front().unwrap_or(PortState::Closed)
        }
    }

    #[test]
    fn test_parse_targets() {
        let t: PortTarget = "db01:5432".parse().unwrap();
        assert_eq!(t, PortTarget { host: "db01".into(), port: 5432 });
        let t: PortTarget = "[::1]:443".parse().unwrap();
        assert_eq!(t.host, "::1");
        assert_eq!(t.to_string(), "[::1]:443");
        assert!("db01".parse::<PortTarget>().is_err());
        assert!("db01:http".parse::<PortTarget>().is_err());
        assert!(":80".parse::<PortTarget>().is_err());
        assert!("db01:0".parse::<PortTarget>().is_err());
    }

    #[test]
    fn test_transitions_include_initial_state() {
        use PortState::*;
        let probe = Scripted(RefCell::new(VecDeque::from([Closed, Closed, Open, Closed])));
        let target: PortTarget = "web:443".parse().unwrap();
        let mut watcher = PortWatcher::new(probe, vec![target.clone()]);

        let first = watcher.poll();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].previous, None);
        assert_eq!(first[0].current, Closed);

        assert!(watcher.poll().is_empty());

        let up = watcher.poll();
        assert_eq!((up[0].previous, up[0].current), (Some(Closed), Open));
        assert_eq!(up[0].to_string(), "web:443 closed -> open");

        assert_eq!(watcher.poll()[0].current, Closed);
        assert_eq!(watcher.state(&target), Some(Closed));
    }

    #[test]
    fn test_tcp_probe_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(Duration::from_millis(500));
        let target = PortTarget { host: "127.0.0.1".into(), port };
        assert_eq!(probe.probe(&target), PortState::Open);

        drop(listener);
        assert_eq!(probe.probe(&target), PortState::Closed);
    }
}
