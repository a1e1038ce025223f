//! Blocking client for the clamd scanning protocol.
//!
//! [`ClientFactory`] keeps one pool of lazily connected sockets per daemon
//! endpoint. [`ClamdService`] runs stateless commands on single-use
//! connections and scans inside [`Session`]s, which reconnect and resend
//! after a broken pipe or reset while the command's retry budget lasts.

pub mod command;
pub mod factory;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod response;
pub mod service;
pub mod session;
pub mod socket;
pub mod source;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use clamwire_core::{
    Charset, ClamdError, ClientConfig, Endpoint, Failure, PoolError, ScanResult, Verdict,
    VersionInfo,
};
pub use command::{Command, CommandBuilder};
pub use factory::ClientFactory;
pub use manager::SocketManager;
pub use pool::{Checkout, Pool};
pub use protocol::{Operation, Termination};
pub use response::ResponseParser;
pub use service::ClamdService;
pub use session::{Session, SessionSettings, SessionState};
pub use socket::LazySocket;
pub use source::{BytesSource, PayloadSource, SeekSource, StreamSource};
pub use transport::{Connection, Connector, TcpConnector};
