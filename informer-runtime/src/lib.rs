//! Informers: local caches of remote collections, kept in sync in the background
//!
//! This crate contains the building blocks of an informer, and the [`Informer`] that wires them together:
//!
//! - [`watcher()`] lists a collection, watches it for changes, resumes after disconnects
//!   and periodically starts over with a full list
//! - [`reflector()`] folds the events of a watcher into a [`Store`]
//! - [`WatchStreamExt`] applies a backoff between failed calls
//! - [`Informer`] runs all of the above on a tokio task with a one-shot start/stop lifecycle
//!
//! The remote collection is reached through the [`ListWatch`](informer_core::ListWatch) trait.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
// The error enums are re-exported under their module name
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod informer;
pub mod lifecycle;
pub mod reflector;
pub mod utils;
pub mod watcher;

pub use informer::{Informer, InformerGuard};
pub use lifecycle::LifecycleState;
pub use reflector::{reflector, Store};
pub use utils::WatchStreamExt;
pub use watcher::watcher;
