// Socket client: public API, request correlation, subscription hooks, the
// writer task and the keep-connected manager.
#![allow(clippy::module_inception)]
pub mod client;
pub(crate) mod correlation;
pub mod manager;
pub mod subscription;
pub(crate) mod writer;
