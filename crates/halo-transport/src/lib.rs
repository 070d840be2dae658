//! Transport layer for the halo realtime stack: credential acquisition,
//! the single supervised connection, and the health monitor that probes it.

pub mod connection;
pub mod connector;
pub mod credentials;
pub mod health;
pub mod mock;

pub use connection::{ConnectionConfig, ConnectionService, ConnectionStatus};
pub use connector::{Connector, Link, WsConnector};
pub use credentials::{CredentialProvider, RefreshingCredentials, StaticCredentials};
pub use health::{HealthCallbacks, HealthConfig, HealthMonitor};
pub use mock::{MockConnector, MockLink};
