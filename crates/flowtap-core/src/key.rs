use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const KEY_SEPARATOR: char = ' ';

/// Directed identity of one TCP connection as seen from one of its
/// endpoints: local address, remote address, local port, remote port.
/// The same wire format is used for poll requests and for matching
/// trace records back to observers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local_addr: String,
    pub remote_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl ConnectionKey {
    pub fn new(
        local_addr: String,
        remote_addr: String,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            local_addr,
            remote_addr,
            local_port,
            remote_port,
        }
    }

    /// The same connection viewed from the opposite endpoint.
    pub fn reverse(&self) -> Self {
        Self {
            local_addr: self.remote_addr.clone(),
            remote_addr: self.local_addr.clone(),
            local_port: self.remote_port,
            remote_port: self.local_port,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = KEY_SEPARATOR;
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.local_addr, self.remote_addr, self.local_port, self.remote_port
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("expected 4 space-delimited fields, found {found}")]
    FieldCount { found: usize },
    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

impl FromStr for ConnectionKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(KEY_SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(KeyParseError::FieldCount { found: parts.len() });
        }
        let local_port = parts[2]
            .parse::<u16>()
            .map_err(|_| KeyParseError::InvalidPort(parts[2].to_string()))?;
        let remote_port = parts[3]
            .parse::<u16>()
            .map_err(|_| KeyParseError::InvalidPort(parts[3].to_string()))?;
        Ok(Self {
            local_addr: parts[0].to_string(),
            remote_addr: parts[1].to_string(),
            local_port,
            remote_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new("10.0.0.1".to_string(), "10.0.0.2".to_string(), 5000, 80)
    }

    #[test]
    fn reverse_swaps_address_and_port_pairs() {
        let reversed = key().reverse();
        assert_eq!(reversed.local_addr, "10.0.0.2");
        assert_eq!(reversed.remote_addr, "10.0.0.1");
        assert_eq!(reversed.local_port, 80);
        assert_eq!(reversed.remote_port, 5000);
    }

    #[test]
    fn reverse_twice_is_identity() {
        assert_eq!(key().reverse().reverse(), key());
    }

    #[test]
    fn display_is_a_space_delimited_quartet() {
        assert_eq!(key().to_string(), "10.0.0.1 10.0.0.2 5000 80");
    }

    #[test]
    fn parse_round_trips_display() {
        let parsed: ConnectionKey = key().to_string().parse().expect("parse key");
        assert_eq!(parsed, key());
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        let result = "10.0.0.1 10.0.0.2 5000".parse::<ConnectionKey>();
        assert!(matches!(result, Err(KeyParseError::FieldCount { found: 3 })));
    }

    #[test]
    fn parse_rejects_non_numeric_port() {
        let result = "10.0.0.1 10.0.0.2 http 80".parse::<ConnectionKey>();
        assert!(matches!(result, Err(KeyParseError::InvalidPort(_))));
    }
}
