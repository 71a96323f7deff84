//! Request coordination: single writes, reads, actions and bulk batches.
//!
//! Every write path serializes behind one process-wide async lock and runs inside one
//! optimistic store transaction on CONFIG_DB. Reads and actions never take the lock.

mod bulk;
mod transaction;


pub(crate) use transaction::*;
