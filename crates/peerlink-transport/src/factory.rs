//! Transport selection by [`TransportType`].

use crate::TransportConfig;
use crate::address::TransportType;
use crate::clear::ClearNetTransport;
use crate::overlay::OverlayTransport;
use crate::transport::Transport;
use std::sync::Arc;

/// Builds transport instances from configuration.
pub struct TransportFactory;

impl TransportFactory {
    /// Create a transport for `kind`.
    ///
    /// The returned transport is not initialized; the node calls
    /// [`Transport::initialize`] during startup so that failures surface there.
    #[must_use]
    pub fn create(kind: TransportType, config: &TransportConfig) -> Arc<dyn Transport> {
        match kind {
            TransportType::Clear => Arc::new(ClearNetTransport::new(config.clone())),
            TransportType::Tor => Arc::new(OverlayTransport::tor(
                config.tor.clone(),
                config.connect_timeout,
            )),
            TransportType::I2p => Arc::new(OverlayTransport::i2p(
                config.i2p.clone(),
                config.connect_timeout,
            )),
        }
    }

    /// Transport kinds this build can create
    #[must_use]
    pub fn available_transports() -> Vec<TransportType> {
        TransportType::ALL.to_vec()
    }
}
