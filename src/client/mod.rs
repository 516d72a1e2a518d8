//! Job creation: the public client and the factory behind it.

#[allow(clippy::module_inception)]
mod client;
mod context;
mod factory;

pub use client::BackgroundJobClient;
pub use context::CreateContext;
pub use factory::{BackgroundJobFactory, DEFAULT_CREATION_EXPIRATION};
