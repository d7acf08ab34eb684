//! duet core: the routing and mix engine

pub mod domain;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use domain::*;
