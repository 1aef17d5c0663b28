//! Transport adapter boundary.
//!
//! The game-protocol codec (framing, encryption, compression, login
//! handshake) is an external collaborator. Everything it hands us is a
//! [`Session`]: a duplex stream of named packets plus an end signal. The
//! other half of each pair is a [`Peer`], which is what a codec task — or a
//! scripted test double — drives.

pub mod connect;
pub mod session;

pub use connect::RemoteConnector;
pub use session::{EndKind, Identity, Peer, Session, SessionEvent};
