//! Transport addresses.
//!
//! Addresses are written URL-style: `unix:///run/app.sock` (or a bare
//! path) for unix-domain sockets and `tcp://127.0.0.1:9000` for TCP.

use crate::config::IpcConfig;
use crate::error::{Result, TetherError};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// A listen or connect address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Address {
    /// Parse an address string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(invalid(input, "empty address"));
        }
        if !input.contains("://") {
            return Ok(Address::Unix(PathBuf::from(input)));
        }

        let url = Url::parse(input).map_err(|e| invalid(input, &e.to_string()))?;
        match url.scheme() {
            "unix" | "ipc" | "file" => {
                let path = url
                    .to_file_path()
                    .unwrap_or_else(|_| PathBuf::from(url.path()));
                if path.as_os_str().is_empty() || path == PathBuf::from("/") {
                    return Err(invalid(input, "missing socket path"));
                }
                Ok(Address::Unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| invalid(input, "missing host"))?;
                let port = url.port().ok_or_else(|| invalid(input, "missing port"))?;
                let addr = format!("{}:{}", host, port)
                    .to_socket_addrs()
                    .map_err(|e| invalid(input, &e.to_string()))?
                    .next()
                    .ok_or_else(|| invalid(input, "host did not resolve"))?;
                Ok(Address::Tcp(addr))
            }
            other => Err(invalid(input, &format!("unsupported scheme '{}'", other))),
        }
    }

    /// A fresh unix socket path under the temp directory, unique to this
    /// process.
    pub fn random_unix() -> Self {
        let suffix: [u8; 4] = rand::random();
        let name = format!(
            "{}-{}-{}.sock",
            IpcConfig::SOCKET_PREFIX,
            std::process::id(),
            hex::encode(suffix)
        );
        Address::Unix(std::env::temp_dir().join(name))
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

fn invalid(address: &str, message: &str) -> TetherError {
    TetherError::InvalidAddress {
        address: address.to_string(),
        message: message.to_string(),
    }
}

impl FromStr for Address {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
            Address::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_forms() {
        assert_eq!(
            Address::parse("unix:///tmp/app.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/app.sock"))
        );
        assert_eq!(
            Address::parse("/tmp/app.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/app.sock"))
        );
    }

    #[test]
    fn test_parse_tcp() {
        let addr = Address::parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(addr, Address::Tcp("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:9000");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Address::parse("tcp://127.0.0.1"),
            Err(TetherError::InvalidAddress { .. })
        ));
        assert!(Address::parse("http://example.com:80").is_err());
        assert!(Address::parse("").is_err());
    }

    #[test]
    fn test_random_unix_is_unique() {
        let a = Address::random_unix();
        let b = Address::random_unix();
        assert!(a.is_unix());
        assert_ne!(a, b);
        assert!(a.to_string().contains(IpcConfig::SOCKET_PREFIX));
    }
}
