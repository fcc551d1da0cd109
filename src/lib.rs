#[macro_use]
extern crate diesel;

pub mod access;
pub mod audit;
pub mod branch;
pub mod cache;
pub mod codec;
pub mod config;
pub mod db;
pub mod depgraph;
pub mod entity;
pub mod entity_store;
pub mod error;
pub mod event_bus;
pub mod expr;
#[allow(unused_imports)]
pub mod schema;
pub mod variables;
pub mod version_store;
pub mod worldtime;

pub use error::{BadRequestKind, ServiceError, ServiceResult};
