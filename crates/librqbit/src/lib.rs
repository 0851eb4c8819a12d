//!
//! This crate provides everything necessary to download [torrents](https://en.wikipedia.org/wiki/BitTorrent).
//!
//! # Quick usage example
//!
//! ```no_run
//! use librqbit::*;
//!
//! tokio_test::block_on(async {
//!     let session = Session::new("/tmp/where-to-download".into()).await.unwrap();
//!     let managed_torrent_handle = session.add_torrent(
//!        AddTorrent::from_url("magnet:?xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862"),
//!        None // options
//!     ).await.unwrap().into_handle().unwrap();
//!     managed_torrent_handle.wait_until_completed().await.unwrap();
//! })
//! ```
//!
//! # Overview
//! The main type to start off with is [`Session`].
//!
//! It also proved useful to use the [`Api`] when building the rqbit desktop app, as it provides
//! a facade that works with simple serializable types.

mod allowlist;
pub mod api;
mod api_error;
mod bitv;
mod bitv_factory;
mod blocklist;
mod chunk_list;
mod chunk_tracker;
pub mod core_engine;
pub mod delegator;
mod dht_utils;
pub mod engine_config;
pub mod engine_error;
mod error;
mod file_info;
mod file_ops;
pub mod hash_pipeline;
#[cfg(feature = "http-api")]
pub mod http_api;
pub mod http_api_client;
#[cfg(feature = "http-api")]
mod http_api_types;
mod limits;
mod listen;
mod mem_region;
mod merge_streams;
mod peer_connection;
mod peer_info_reader;
mod peer_stats;
mod piece_tracker;
pub mod priority_ranges;
mod read_buf;
pub mod request_list;
mod session;
mod session_persistence;
mod session_stats;
mod spawn_utils;
pub mod storage;
mod stream_connect;
mod torrent_state;
pub mod tracing_subscriber_config_utils;
mod type_aliases;
#[cfg(feature = "upnp-serve-adapter")]
mod upnp_server_adapter;
mod vectored_traits;
#[cfg(feature = "watch")]
mod watch;

pub use api::Api;
pub use api_error::{ApiError, WithStatus};
pub use dht;
pub use engine_config::EngineConfig;
pub use engine_error::EngineError;
pub use error::Error;
pub use merge_streams::merge_streams;
pub use peer_connection::PeerConnectionOptions;
pub use session::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ListOnlyResponse, Session, SessionOptions,
    SUPPORTED_SCHEMES,
};
pub use spawn_utils::spawn as librqbit_spawn;
pub use torrent_state::{ManagedTorrent, ManagedTorrentState, TorrentStats, TorrentStatsState};
#[cfg(feature = "watch")]
pub use watch::*;

pub use buffers::*;
pub use clone_to_owned::CloneToOwned;
pub use librqbit_core::magnet::*;
pub use librqbit_core::peer_id::*;
pub use librqbit_core::torrent_metainfo::*;

#[cfg(test)]
mod tests;

/// The cargo version of librqbit.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn try_increase_nofile_limit() -> anyhow::Result<u64> {
    Ok(rlimit::increase_nofile_limit(1024 * 1024)?)
}
