pub mod channels;
pub mod config;
pub mod error;
pub mod keystore;
pub mod logging;
pub mod services;
pub mod state;

pub use channels::{CallEvent, EndReason};
pub use config::{CallTimeouts, ClientConfig};
pub use error::{CallError, ConfigError, SessionError};
pub use keystore::StrongholdKeychain;
pub use services::{CallController, CallDeps};
pub use state::{AppState, CallSession, CallStatus, SharedState, UserSession};
