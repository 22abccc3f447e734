//! AlloyDB Admin API access and retry plumbing.

pub mod retry;

pub(crate) mod client;
