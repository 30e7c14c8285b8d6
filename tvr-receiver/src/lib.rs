//! # tvr-receiver: remote-control receiver service
//!
//! Listens for remotes, walks them through pairing or token
//! authentication, and dispatches their operations to the bound input
//! backend. Pairing records persist to a JSON file between runs.
//!
//! The console build logs pairing codes instead of showing them on
//! screen and logs operations instead of injecting them.

pub mod config;
pub mod service;
pub mod store;
pub mod surfaces;
