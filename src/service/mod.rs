//! Request dispatch: the composition root tying quota, limiters, cache,
//! pool and audit log together.

mod builder;
mod dispatcher;

pub use builder::{DEFAULT_CHECK_TIMEOUT, Skald, SkaldBuilder};
pub use dispatcher::Dispatcher;
