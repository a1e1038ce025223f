//! Shared entry point: one connection pool per endpoint, created on first use.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use clamwire_core::{ClamdError, ClientConfig, Endpoint};
use tracing::{debug, info};

use crate::manager::SocketManager;
use crate::service::ClamdService;
use crate::session::SessionSettings;
use crate::transport::{Connector, TcpConnector};

pub struct ClientFactory {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    services: RwLock<HashMap<Endpoint, Arc<ClamdService>>>,
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("config", &self.config)
            .field("endpoints", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl ClientFactory {
    /// Factory connecting over TCP with the configured timeouts.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    #[must_use]
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            services: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Service for `host:port`, creating its pool on first request. Every
    /// caller asking for the same endpoint shares one pool.
    ///
    /// # Errors
    ///
    /// Returns `Pool` if the configured pool size is zero.
    pub fn create_service(
        &self,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Arc<ClamdService>, ClamdError> {
        let endpoint = Endpoint::new(host, port);
        if let Some(service) = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&endpoint)
        {
            return Ok(Arc::clone(service));
        }

        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks.
        if let Some(service) = services.get(&endpoint) {
            return Ok(Arc::clone(service));
        }

        let manager = SocketManager::new(
            endpoint.clone(),
            Arc::clone(&self.connector),
            self.config.max_connections,
        )?;
        let service = Arc::new(ClamdService::new(
            Arc::new(manager),
            SessionSettings::from_config(&self.config),
        ));
        debug!(%endpoint, "service created");
        services.insert(endpoint, Arc::clone(&service));
        Ok(service)
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Tear down every pool and forget all services. Services still held by
    /// callers stop handing out connections.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if drained.is_empty() {
            return;
        }
        info!(pools = drained.len(), "shutting down client factory");
        for (_, service) in drained {
            service.manager().destruct();
        }
    }
}

impl Drop for ClientFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
