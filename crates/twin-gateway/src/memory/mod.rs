//! In-memory collaborators for standalone runs and tests.

mod backend;
mod connection;
mod identity;

pub use backend::InMemoryBackend;
pub use connection::{LoopbackConnection, Responder};
pub use identity::LocalIdentityProvider;
