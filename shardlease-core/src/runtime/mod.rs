//! Task lifecycle support for pulsers

pub mod shutdown;

pub use shutdown::ShutdownSignal;
