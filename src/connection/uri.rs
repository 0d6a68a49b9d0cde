//! Broker endpoint parsing.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::error::ConnectError;

/// A parsed broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `local://<path>`: Unix-domain stream socket.
    Local(PathBuf),
    /// `fd://<n>`: already connected stream socket descriptor.
    Fd(RawFd),
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidUri(uri.to_string());

        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;

        match scheme {
            "local" => {
                if rest.is_empty() || !rest.starts_with('/') {
                    return Err(invalid());
                }
                Ok(Endpoint::Local(PathBuf::from(rest)))
            }
            "fd" => {
                let fd: RawFd = rest.parse().map_err(|_| invalid())?;
                if fd < 0 {
                    return Err(invalid());
                }
                Ok(Endpoint::Fd(fd))
            }
            _ => Err(invalid()),
        }
    }
}
