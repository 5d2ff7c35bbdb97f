//! IMAP gateway: connection, folder state, batched prefetch, and flag ops.
//!
//! This module is split into:
//! - `mod.rs` - Gateway struct, session type, and construction
//! - `client.rs` - Connection and protocol operations

mod client;

use async_native_tls::TlsStream;
use tokio::net::TcpStream;
use tokio_util::compat::Compat;

use crate::config::ImapConfig;

pub(crate) type GatewaySession = async_imap::Session<TlsStream<Compat<TcpStream>>>;

/// A connection to an IMAPS endpoint.
///
/// Tracks the currently selected folder and the number of fetch batches
/// served since the last SELECT so the folder can be re-opened periodically,
/// bounding the client library's cached message content.
pub struct ImapGateway {
    pub(crate) session: Option<GatewaySession>,
    pub(crate) config: ImapConfig,
    /// Name of the folder currently selected read-write, if any.
    pub(crate) open_folder: Option<String>,
    pub(crate) batches_since_select: u32,
}

impl ImapGateway {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            session: None,
            config,
            open_folder: None,
            batches_since_select: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}
