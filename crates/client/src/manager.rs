//! Per-endpoint connection management: one-shot sockets and the pool of
//! lazily connected handles.

use std::sync::Arc;
use std::time::Duration;

use clamwire_core::{ClamdError, Endpoint, PoolError};
use tracing::{debug, info, warn};

use crate::pool::{Checkout, Pool};
use crate::socket::LazySocket;
use crate::transport::{Connection, Connector};

pub struct SocketManager {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    pool: Pool<LazySocket>,
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("endpoint", &self.endpoint)
            .field("max_size", &self.pool.max_size())
            .field("available", &self.pool.available())
            .finish_non_exhaustive()
    }
}

impl SocketManager {
    /// Build the pool for `endpoint`. No connection is opened until a handle
    /// is first used.
    ///
    /// # Errors
    ///
    /// Returns `Pool(EmptyItem)` for a zero-sized pool.
    pub fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        max_connections: usize,
    ) -> Result<Self, ClamdError> {
        if max_connections == 0 {
            return Err(PoolError::EmptyItem.into());
        }
        let pool = Pool::init(max_connections, || {
            Some(LazySocket::new(endpoint.clone(), Arc::clone(&connector)))
        })?
        .with_validator(LazySocket::revalidated);
        info!(%endpoint, max_connections, "connection pool created");

        Ok(Self {
            endpoint,
            connector,
            pool,
        })
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open a fresh connection, run `f` on it and close it, whether `f`
    /// succeeded or not.
    ///
    /// # Errors
    ///
    /// Returns the connect error or the error from `f`. A close failure is
    /// only logged.
    pub fn run_on_single_use_socket<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> Result<R, ClamdError>,
    ) -> Result<R, ClamdError> {
        let mut conn = self.connector.connect(&self.endpoint)?;
        debug!(endpoint = %self.endpoint, "single-use connection opened");
        let result = f(conn.as_mut());
        if let Err(e) = conn.close() {
            warn!(endpoint = %self.endpoint, error = %e, "failed to close single-use connection");
        }
        result
    }

    /// Borrow a pooled handle, waiting as long as it takes.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnavailable` if the wait is interrupted or the pool
    /// has been torn down.
    pub fn take(&self) -> Result<Checkout<LazySocket>, ClamdError> {
        self.checkout(None)
    }

    /// Borrow a pooled handle, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionUnavailable` wrapping `Exhausted` on timeout.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Checkout<LazySocket>, ClamdError> {
        self.checkout(Some(timeout))
    }

    pub(crate) fn checkout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Checkout<LazySocket>, ClamdError> {
        let checkout = match timeout {
            Some(timeout) => self.pool.get_timeout(timeout),
            None => Ok(self.pool.get()),
        };
        match checkout {
            Ok(Some(socket)) => Ok(socket),
            Ok(None) => Err(self.unavailable(PoolError::Interrupted)),
            Err(e) => Err(self.unavailable(e)),
        }
    }

    fn unavailable(&self, source: PoolError) -> ClamdError {
        ClamdError::ConnectionUnavailable {
            endpoint: self.endpoint.clone(),
            source,
        }
    }

    /// Return a handle to the pool. A closed handle goes back too; it
    /// reconnects on its next checkout.
    ///
    /// # Errors
    ///
    /// Returns `Pool` if the pool rejects the checkout.
    pub fn release(&self, socket: Checkout<LazySocket>) -> Result<(), ClamdError> {
        if socket.is_closed() {
            warn!(
                endpoint = %self.endpoint,
                slot = socket.slot(),
                "returning closed connection to pool"
            );
        }
        self.put_back(socket)
    }

    /// Return a handle its holder closed on purpose, after `END` or a
    /// broken exchange.
    pub(crate) fn release_closed(&self, socket: Checkout<LazySocket>) -> Result<(), ClamdError> {
        debug!(
            endpoint = %self.endpoint,
            slot = socket.slot(),
            "returning ended connection to pool"
        );
        self.put_back(socket)
    }

    fn put_back(&self, socket: Checkout<LazySocket>) -> Result<(), ClamdError> {
        self.pool.put(socket)?;
        Ok(())
    }

    /// Wake every thread blocked in [`take`](Self::take).
    pub fn interrupt(&self) {
        self.pool.interrupt();
    }

    /// Close every pooled connection, including checked-out ones. Later calls
    /// are no-ops.
    pub fn destruct(&self) {
        self.pool.destruct(|socket| {
            if let Err(e) = socket.close() {
                warn!(endpoint = %self.endpoint, error = %e, "failed to close pooled connection");
            }
        });
        info!(endpoint = %self.endpoint, "connection pool destroyed");
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.pool.max_size()
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.pool.available()
    }

    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.pool.checked_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{capture_logs, Script, ScriptedConnector};
    use std::io;

    fn manager(connector: &Arc<ScriptedConnector>, max: usize) -> SocketManager {
        SocketManager::new(
            Endpoint::new("clamd", 3310),
            Arc::clone(connector) as Arc<dyn Connector>,
            max,
        )
        .unwrap()
    }

    #[test]
    fn pool_fill_does_not_connect() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = manager(&connector, 4);
        assert_eq!(manager.available(), 4);
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn zero_connections_rejected() {
        let connector = Arc::new(ScriptedConnector::default());
        let result = SocketManager::new(
            Endpoint::new("clamd", 3310),
            connector as Arc<dyn Connector>,
            0,
        );
        assert!(matches!(result, Err(ClamdError::Pool(PoolError::EmptyItem))));
    }

    #[test]
    fn single_use_socket_closed_after_success() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = manager(&connector, 1);
        let value = manager.run_on_single_use_socket(|_| Ok(7)).unwrap();
        assert_eq!(value, 7);
        assert!(connector.connection(0).is_closed());
    }

    #[test]
    fn single_use_socket_closed_after_failure() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = manager(&connector, 1);
        let result: Result<(), _> = manager.run_on_single_use_socket(|_| {
            Err(ClamdError::from(io::Error::from(io::ErrorKind::BrokenPipe)))
        });
        assert!(matches!(result, Err(ClamdError::BrokenPipe(_))));
        assert!(connector.connection(0).is_closed());
    }

    #[test]
    fn exhausted_pool_is_unavailable() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = manager(&connector, 1);
        let held = manager.take().unwrap();

        let err = manager.take_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err,
            ClamdError::ConnectionUnavailable {
                source: PoolError::Exhausted(_),
                ..
            }
        ));
        manager.release(held).unwrap();
        assert_eq!(manager.available(), 1);
    }

    #[test]
    fn closed_handle_is_returned_and_revalidated() {
        let connector = Arc::new(ScriptedConnector::default());
        let manager = manager(&connector, 1);

        let socket = manager.take().unwrap();
        socket.with_connection(|_| Ok(())).unwrap();
        socket.close().unwrap();
        let logs = capture_logs(|| manager.release(socket).unwrap());
        assert!(logs.contains("WARN"), "{logs}");
        assert_eq!(manager.available(), 1);

        let socket = manager.take().unwrap();
        assert!(!socket.is_closed());
        socket.with_connection(|_| Ok(())).unwrap();
        assert_eq!(connector.connects(), 2);
        manager.release(socket).unwrap();
    }

    #[test]
    fn destruct_closes_checked_out_handles() {
        let connector = Arc::new(ScriptedConnector::with_scripts(vec![Script::clamd()]));
        let manager = manager(&connector, 2);
        let socket = manager.take().unwrap();
        socket.with_connection(|_| Ok(())).unwrap();

        manager.destruct();
        manager.destruct();
        assert!(socket.is_closed());
        assert!(connector.connection(0).is_closed());

        manager.release(socket).unwrap();
        assert!(matches!(
            manager.take(),
            Err(ClamdError::ConnectionUnavailable {
                source: PoolError::Interrupted,
                ..
            })
        ));
    }
}
