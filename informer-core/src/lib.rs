//! Types and traits shared by informers and the list/watch backends they mirror
//!
//! This crate is client-less: the remote store is reached only through the
//! [`ListWatch`] capability, which callers implement on top of whatever client they use.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]

pub mod api;
pub use api::ListWatch;

pub mod labels;

pub mod metadata;

pub mod object;
pub use object::ObjectList;

pub mod params;
pub use params::ListParams;

mod resource;
pub use resource::{Resource, ResourceExt};

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::{BoxError, Error, ErrorResponse};

/// Convient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
