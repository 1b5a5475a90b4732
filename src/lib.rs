//! Master/worker job dispatch over an identity-addressed multipart
//! transport.
//!
//! A [`Master`] hub binds a router socket, hands opaque calls to
//! registered [`Worker`]s one at a time, and ships each worker the
//! environment values it has not seen yet. An optional [`Proxy`] tier
//! relays traffic for workers on networks the master cannot reach,
//! re-expanding directives from a local value cache.

pub mod env;
pub mod exec;
pub mod master;
pub mod net;
pub mod proxy;
pub mod trace;
pub mod wire;
pub mod worker;

#[doc(inline)]
pub use master::{Master, MasterError, WorkerInfo};

#[doc(inline)]
pub use proxy::{Proxy, ProxyConfig, ProxyError};

#[doc(inline)]
pub use worker::{Worker, WorkerError};

pub use exec::{Executor, Profile};
pub use wire::Status;
