//! Peer-to-peer connection pool: the single authority over a node's
//! outbound and inbound TCP-level peer connections.
//!
//! Dials, authenticates, tracks, throttles, demotes, swaps and tears down
//! connections, while exposing a typed message channel to higher layers.
//! See each module for the component of the design it implements.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
mod handshake;
pub mod message;
pub mod persistence;
mod pool;
pub mod registry;
pub mod scheduler;
mod swap;
pub mod time;
pub mod transport;
mod worker;

pub use config::PoolConfig;
pub use connection::{Connection, ConnectionId, ConnectionInfo};
pub use error::{Error, Result};
pub use events::{EventStream, PoolEvent, Stopper, WatchItem};
pub use pool::Handle;
pub use scheduler::{AtomicScheduler, Scheduler, Stat};
pub use transport::{
    Authenticated, Authenticator, FrameReader, FrameWriter, PlaintextAuthenticator,
    PlaintextTransport, Transport,
};
