//! Change notification engine
//!
//! A subscription session moves through four states:
//!
//! ```text
//! Registering  per path: resolve, translate_subscribe, collect descriptors
//!     │
//! Priming      one key-space subscription per store index, then one Get-path snapshot per
//!     │        descriptor; the last snapshot carries sync_complete
//! Streaming    row events recompute the owning descriptors and emit only changed snapshots
//!     │
//! Stopped      caller stop, terminal backend error or engine shutdown; unsubscribes and
//!              drops the session from the lookup tables
//! ```
//!
//! Every session runs in its own task and owns its event channel. The handle → session
//! lookup lives behind one mutex that teardown also takes, so an event racing a stop signal
//! either sees the session fully registered or not at all.

mod engine;
mod session;


pub(crate) use engine::*;
