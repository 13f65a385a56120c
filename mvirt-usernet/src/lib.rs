//! User-mode network stack backend for a guest's virtio-net device.
//!
//! Guest Ethernet frames are terminated in-process: ARP and ICMP echo are
//! answered directly, UDP and TCP payloads are relayed over ordinary host
//! sockets. See [`NetStack`] for the device-facing entry points.

pub mod config;
pub mod dataplane;
pub mod error;
pub mod pool;
pub mod relay;
pub mod stack;
pub mod wire;

pub use config::{StackConfig, parse_mac};
pub use error::{NetError, Result};
pub use pool::{BufStatus, BufferPool, PoolBuffer, PoolCounts};
pub use relay::{FlowKey, IsnPolicy, TcpState};
pub use stack::NetStack;
