//! devpulse-state: the process registry for devpulse.
//!
//! Backed by [redb](https://docs.rs/redb), records which services of a
//! project are running: name → PID, port, lifecycle status, start/end
//! time, and exit code. Values are JSON-serialized into redb's `&[u8]`
//! value column, keyed by service name.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Status changes are published to
//! subscribers over a broadcast channel.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
