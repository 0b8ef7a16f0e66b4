//! storyvault: story publishing on pluggable storage.
//!
//! A story is two things: a searchable metadata record held by a
//! [`index::MetadataIndex`] and its markdown text held by a
//! [`store::ContentStore`]. [`backends::connect`] picks one implementation of
//! each from configuration; [`services::story_service::StoryService`] composes
//! them and the HTTP layer in [`routes`] exposes the result.

pub mod backends;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod index;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;

use axum::Router;

use crate::backends::Backends;
use crate::services::story_service::StoryService;

/// The complete HTTP application over the given backends.
pub fn app(backends: Backends) -> Router {
    routes::routes::routes().with_state(StoryService::new(backends))
}
