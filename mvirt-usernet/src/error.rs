//! Error types shared by the codec, the buffer pool and the relays.

use std::io;

use thiserror::Error;

/// Network stack errors.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Frame truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unsupported EtherType: {0:#06x}")]
    UnsupportedEtherType(u16),

    #[error("Not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("IP options are not supported (header length {0})")]
    IpOptions(usize),

    #[error("IP fragments are not supported")]
    Fragmented,

    #[error("Unsupported IP protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("Bad {0} checksum")]
    BadChecksum(&'static str),

    #[error("Invalid TCP header length: {0}")]
    BadTcpHeader(usize),

    #[error("Receive buffer too small: need {needed} bytes, have {available}")]
    RxBufferTooSmall { needed: usize, available: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("No relay for this flow")]
    NoRelay,

    #[error("Network stack is shutting down")]
    ShuttingDown,
}

impl NetError {
    /// Whether the error describes a guest frame that is simply dropped.
    ///
    /// Covers malformed input and checksum violations. Host socket failures
    /// and shutdown are not in this class.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            NetError::Truncated { .. }
                | NetError::UnsupportedEtherType(_)
                | NetError::NotIpv4(_)
                | NetError::IpOptions(_)
                | NetError::Fragmented
                | NetError::UnsupportedProtocol(_)
                | NetError::BadChecksum(_)
                | NetError::BadTcpHeader(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
