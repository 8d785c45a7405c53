// In-process synchronizers built on monitors, per-waiter condition
// variables and atomic state machines: rendezvous mailboxes, a keyed
// exchanger, a bounded worker pool, and the lock-free queue backing the
// optimistic mailbox.

mod errors;
mod exchanger;
mod mailbox;
mod pool;
mod queue;
mod signals;
mod timing;
mod waiters;

pub use errors::*;
pub use exchanger::*;
pub use mailbox::*;
pub use pool::*;
pub use queue::*;
pub use signals::*;
pub use timing::*;
