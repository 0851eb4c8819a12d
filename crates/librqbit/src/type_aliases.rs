use std::net::SocketAddr;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Lsb0>;

pub type PeerHandle = SocketAddr;

pub type FileInfos = Vec<crate::file_info::FileInfo>;

pub type FileStorage = Box<dyn crate::storage::TorrentStorage>;

/// File indices in the order they should be prioritized for piece selection.
pub type FilePriorities = Vec<usize>;

#[cfg(feature = "sha1-openssl")]
pub type Sha1 = sha1w::Sha1Openssl;

#[cfg(feature = "sha1-crypto-hash")]
pub type Sha1 = sha1w::Sha1System;

#[cfg(feature = "sha1-ring")]
pub type Sha1 = sha1w::Sha1Ring;

#[cfg(feature = "sha1-rust")]
pub type Sha1 = sha1w::Sha1Rust;
