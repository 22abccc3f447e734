//! Async AlloyDB connector producing authenticated, mutually-TLS-encrypted
//! sockets — with proactive certificate refresh, singleflight coordination,
//! and automatic IAM database authentication.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod api;
pub mod token;

mod cache;
mod connector;
mod error;
mod exchange;
mod keys;
mod refresh;
mod uri;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};

	pub use crate::{Error, Result};
}
pub use crate::{
	connector::{AlloyDbStream, ConnectOptions, Connector, ConnectorBuilder, RefreshStrategy},
	error::{Error, Result},
	exchange::AuthType,
	refresh::IpType,
	token::{AccessToken, StaticTokenProvider, TokenProvider},
	uri::InstanceUri,
};
