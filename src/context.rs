//! Application context
//!
//! Bundles the pieces a running node shares: configuration, the router
//! directory, the transport and, when Tor is reachable, its control port.
//! Handed around explicitly instead of living in a global.

use crate::config::CommConfig;
use crate::control::{self, ControlPort};
use crate::directory::RouterDirectory;
use crate::error::{CommError, Result};
use crate::handshake::ConnectionMode;
use crate::transport::TransportProtocol;
use std::path::Path;
use std::sync::Arc;

pub struct AppContext {
    config: CommConfig,
    routers: Arc<RouterDirectory>,
    transport: Arc<TransportProtocol>,
    control: Option<Arc<dyn ControlPort>>,
}

impl AppContext {
    /// Build a context; fails if `config` does not validate
    pub fn new(config: CommConfig, mode: ConnectionMode) -> Result<Self> {
        let transport = Arc::new(TransportProtocol::with_config(mode, config.clone())?);
        Ok(Self {
            config,
            routers: Arc::new(RouterDirectory::new()),
            transport,
            control: None,
        })
    }

    /// Attach a Tor control port
    pub fn with_control(mut self, control: Arc<dyn ControlPort>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn routers(&self) -> &Arc<RouterDirectory> {
        &self.routers
    }

    pub fn transport(&self) -> &Arc<TransportProtocol> {
        &self.transport
    }

    pub fn control(&self) -> Option<&Arc<dyn ControlPort>> {
        self.control.as_ref()
    }

    /// Publish the transport's listening address as a hidden service.
    ///
    /// Requires a control port and a transport that has been bound.
    pub fn publish_service(&self, service_dir: &Path) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| CommError::ControlPort("No control port attached".into()))?;
        let address = self
            .transport
            .service_address()
            .ok_or_else(|| CommError::InvalidState("Transport is not listening".into()))?;

        control::publish_hidden_service(control.as_ref(), service_dir, address)
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("mode", &self.transport.mode())
            .field("state", &self.transport.state())
            .field("routers", &self.routers.len())
            .field("control", &self.control.is_some())
            .finish()
    }
}
