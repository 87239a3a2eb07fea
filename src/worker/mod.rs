//! The worker that sits between the application and the network.
//!
//! The host delivers install, activate, fetch, sync and push events over a
//! channel; each worker version owns its context and cache generations and
//! moves through `installing -> installed -> activating -> active -> redundant`.

mod controller;
mod event;
mod lifecycle;
mod registration;

pub use controller::{Worker, WorkerContext};
pub use event::WorkerHandle;
pub use registration::Registration;
