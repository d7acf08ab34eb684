//! duet infrastructure: concrete audio server backends

pub mod pulse;

pub use pulse::PactlBackend;
