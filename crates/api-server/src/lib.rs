#![warn(clippy::unwrap_used)]

pub mod auth;
pub mod rest;
pub mod server;
pub mod swagger;

pub use auth::{AuthTenant, TenantAuth};
pub use server::{build_router, ApiServer};
pub use swagger::ApiDoc;
