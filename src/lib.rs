//! Taskhive: durable background jobs.
//!
//! Jobs are method-call descriptors stored in a shared [`storage`] backend.
//! A [`client::BackgroundJobClient`] creates them and moves them between
//! [`states`]; a [`server::BackgroundJobServer`] performs them on worker
//! processes, enqueues scheduled jobs and triggers [`recurring`] ones.
//! [`filters`] hook into creation and every state transition.

pub mod client;
pub mod common;
pub mod config;
pub mod error;
pub mod filters;
pub mod recurring;
pub mod server;
pub mod states;
pub mod storage;

pub use client::BackgroundJobClient;
pub use common::{Job, JobRegistry, MethodInfo, PerformContext, TypeInfo};
pub use config::BackgroundJobServerOptions;
pub use error::{Error, Result};
pub use filters::FilterCollection;
pub use recurring::{RecurringJobManager, RecurringJobOptions};
pub use server::BackgroundJobServer;
pub use states::State;
pub use storage::{JobStorage, MemoryStorage};
