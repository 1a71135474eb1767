/// Core backend abstractions: transports, sessions and backend groups
pub mod backend;
pub mod connection;
pub mod session;

pub use backend::{BackendGroup, BackendGroupManager, BackendGroupSelector, WeightedRoundRobin};
pub use connection::{Connector, TcpConnector, TcpTransport, Transport};
pub use session::{BackendSession, CommandOutcome, ResultCallback, SessionState};
