//! Lease store implementations
//!
//! The coordination protocol only needs [`crate::agent::AgentRepository`];
//! this module provides the in-process table.

pub mod memory;

pub use memory::InMemoryAgentRepository;
