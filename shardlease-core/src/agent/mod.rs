//! Agent rows and their owner-side persistence
//!
//! One agent row per coordination participant, written only by its owner.

pub mod model;
pub mod persister;
pub mod repository;

pub use model::{Agent, AgentDraft, AgentId, AgentReference, AgentState, AgentType};
pub use persister::AgentPersister;
pub use repository::AgentRepository;
