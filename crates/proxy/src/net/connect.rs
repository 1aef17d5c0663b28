//! The seam through which the upstream (remote server) session is produced.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::session::Session;
use crate::config::RemoteConfig;

/// Opens the single persistent connection to the backend server.
///
/// A production deployment implements this on top of the protocol codec
/// (TCP connect, encryption, login handshake) and resolves once the session
/// reaches the play state. The rehearsal harness and the integration tests
/// implement it with [`Session::pair`] and a scripted peer.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, remote: &RemoteConfig) -> Result<Arc<Session>>;
}
