//! Built-in plugins shipped with the server.
//!
//! Each module exposes a `descriptor()` and a handler type; the gateway
//! registers them at boot. Builtins are also the handler factories
//! available to manifest-described plugins (`handler_ref`).

pub mod memory;
pub mod time;
pub mod weather;
