//! Device-control link for the SortHub dashboard.
//!
//! Maintains one WebSocket session to the scanner/printer server,
//! fans pushed events out to subscribers, and correlates commands
//! such as `print_qr` with their asynchronous replies.

pub mod device;
pub mod dispatcher;
pub mod error;
pub mod manager;
mod pumps;
pub(crate) mod reconnection;
pub mod tracker;
pub mod types;
pub mod ws_client;

#[cfg(test)]
pub(crate) mod test_server;

pub use device::DeviceClient;
pub use dispatcher::{Callback, EventDispatcher, ScopedSubscription, Subscription};
pub use error::{ConnectError, RequestError};
pub use manager::ConnectionManager;
pub use tracker::{ReplyRoute, RequestTracker};
pub use types::{
    ClientConfig, ConnectionEvent, ConnectionInfo, ConnectionState, DisconnectReason,
    ReconnectConfig, ReconnectPolicy,
};
