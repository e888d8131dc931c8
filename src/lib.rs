pub mod cleaner;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod marker;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;

pub use config::{ConfigError, RelayConfig};
pub use connection::{ConnectOptions, SourceConnection};
pub use error::{RelayError, RelayResult};
pub use marker::{MarkerForwarder, MarkerOptions};
pub use registry::{Catalog, SourceRegistry};
pub use server::{create_router, RelayState};
pub use session::{
    run_session, Session, SessionConfig, SessionContext, SessionEnd, SessionState, SessionSummary,
};
pub use tracker::{SessionInfo, SessionTracker};
pub use transport::{BufferCapacity, Inlet, Transport, TransportKind};
pub use types::*;
