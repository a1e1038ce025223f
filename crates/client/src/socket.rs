//! Pooled connection handle that connects on first use.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use clamwire_core::{ClamdError, Endpoint};
use tracing::{debug, trace};

use crate::transport::{Connection, Connector};

enum SocketState {
    Unconnected,
    Connected(Box<dyn Connection>),
    Closed,
}

impl SocketState {
    const fn name(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connected(_) => "connected",
            Self::Closed => "closed",
        }
    }
}

/// Deferred connection to one endpoint. Clones share the same underlying
/// connection, so the pool can tear down handles that are checked out.
#[derive(Clone)]
pub struct LazySocket {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    state: Arc<Mutex<SocketState>>,
}

impl fmt::Debug for LazySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySocket")
            .field("endpoint", &self.endpoint)
            .field("state", &self.lock().name())
            .finish_non_exhaustive()
    }
}

impl LazySocket {
    #[must_use]
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint,
            connector,
            state: Arc::new(Mutex::new(SocketState::Unconnected)),
        }
    }

    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run `f` on the live connection, connecting first if this handle has
    /// never been used.
    ///
    /// # Errors
    ///
    /// Returns the connect error, `Io(NotConnected)` on a closed handle, or
    /// whatever `f` returns.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut dyn Connection) -> Result<R, ClamdError>,
    ) -> Result<R, ClamdError> {
        let mut state = self.lock();
        if matches!(*state, SocketState::Unconnected) {
            trace!(endpoint = %self.endpoint, "materializing connection");
            *state = SocketState::Connected(self.connector.connect(&self.endpoint)?);
        }
        match &mut *state {
            SocketState::Connected(conn) => f(conn.as_mut()),
            _ => Err(ClamdError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection handle is closed",
            ))),
        }
    }

    /// True once the live connection has been closed. A handle that never
    /// connected is not closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.lock(), SocketState::Closed)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(*self.lock(), SocketState::Connected(_))
    }

    /// Close the live connection, if any. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `SocketState` if the OS close fails; the handle is still
    /// marked closed.
    pub fn close(&self) -> Result<(), ClamdError> {
        let previous = std::mem::replace(&mut *self.lock(), SocketState::Closed);
        if let SocketState::Connected(mut conn) = previous {
            debug!(endpoint = %self.endpoint, "closing connection");
            conn.close().map_err(ClamdError::SocketState)?;
        }
        Ok(())
    }

    /// Make a closed handle connectable again. Used when the pool hands it
    /// out, so a connection dropped by the daemon is replaced on next use.
    #[must_use]
    pub fn revalidated(self) -> Self {
        {
            let mut state = self.lock();
            if matches!(*state, SocketState::Closed) {
                trace!(endpoint = %self.endpoint, "resetting closed handle");
                *state = SocketState::Unconnected;
            }
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
