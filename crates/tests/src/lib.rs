//! End-to-end tests of the duet engine against the in-memory backend

#[cfg(test)]
mod engine_integration;
