//! PulseAudio / pipewire-pulse backend driven through `pactl`
//!
//! `pactl` is available wherever either server runs, which keeps the daemon
//! free of native client bindings:
//! - Listings use its JSON output format
//! - Mutations are single commands with a bounded run time
//! - Notifications come from a long-running `pactl subscribe`

pub mod backend;
pub mod command;
pub mod json;
pub mod subscribe;

pub use backend::*;
pub use subscribe::parse_event_line;
