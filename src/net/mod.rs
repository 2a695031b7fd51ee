//! Request/response model and network access.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Request, Response};
