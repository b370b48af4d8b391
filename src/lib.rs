pub mod backends;
pub mod config;
pub mod context;
pub mod database;
pub mod error;
pub mod evaluation;
pub mod events;
pub mod lifecycle;
pub mod orchestrator;
pub mod persist;
pub mod ranking;
pub mod runtime;
pub mod tasks;

pub use error::{EngineError, PersistenceWarning};
pub use orchestrator::{AskRequest, AskResponse, Orchestrator, RememberRequest};
