//! Request/response model, the network client and the network-first
//! fetch interceptor.

pub mod cache;
pub mod client;
pub mod interceptor;
pub mod types;
