pub mod api;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod state;
pub mod store;
pub mod surface;
pub mod telemetry;
pub mod transport;


pub use api::{SessionSummary, SessionsClient, TurnRecord};
pub use auth::{AuthClient, AuthContext};
pub use config::{ClientConfig, ConfigError};
pub use connection::{BackoffPolicy, ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::ChatError;
pub use protocol::{ChatRequest, ContextMessage, SessionId, StreamEvent};
pub use provider::{Provider, ProviderSettings, ProviderTransport};
pub use state::{AccumulatorPhase, Author, Folded, MessageAccumulator, Turn, TurnChange};
pub use store::{CachedSession, CachedSessionSummary, SessionCache};
pub use surface::{ChatSurface, SurfaceUpdate};
pub use transport::{ChannelTransport, LinkHandle, MockTransport, TransportKind};
