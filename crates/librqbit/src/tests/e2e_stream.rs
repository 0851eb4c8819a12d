use std::{net::Ipv4Addr, path::Path, time::Duration};

use anyhow::Context;
use buffers::ByteBufOwned;
use bytes::Bytes;
use librqbit_core::{
    hash_id::Id20,
    torrent_metainfo::{TorrentMetaV1, TorrentMetaV1Info},
};
use sha1w::{ISha1, Sha1};
use tempfile::TempDir;
use tokio::{io::AsyncReadExt, time::timeout};
use tracing::info;

use crate::{
    AddTorrent, Session,
    tests::test_util::{TestPeerMetadata, setup_test_logging},
};

use super::test_util::create_default_random_dir_with_torrents;

/// Bencodes a single-file v1 torrent for `filename` under `dir`, computing real piece hashes.
/// `create_torrent()` is deliberately not used here (torrent *creation* is out of scope).
fn make_single_file_torrent(dir: &Path, filename: &str, piece_length: u32) -> Bytes {
    let data = std::fs::read(dir.join(filename)).unwrap();
    let mut pieces = Vec::new();
    for chunk in data.chunks(piece_length as usize) {
        let mut h = Sha1::new();
        h.update(chunk);
        pieces.extend_from_slice(&h.finish());
    }
    let info = TorrentMetaV1Info::<ByteBufOwned> {
        name: Some(ByteBufOwned::from(filename.as_bytes().to_vec())),
        pieces: ByteBufOwned::from(pieces),
        piece_length,
        length: Some(data.len() as u64),
        md5sum: None,
        files: None,
        private: false,
    };
    let meta = TorrentMetaV1::<ByteBufOwned> {
        announce: None,
        announce_list: Vec::new(),
        info,
        comment: None,
        created_by: None,
        encoding: None,
        publisher: None,
        publisher_url: None,
        creation_date: None,
        info_hash: Id20::default(),
    };
    let mut buf = Vec::new();
    bencode::bencode_serialize_to_writer(&meta, &mut buf).unwrap();
    Bytes::from(buf)
}

async fn e2e_stream() -> anyhow::Result<()> {
    setup_test_logging();
    let files = create_default_random_dir_with_torrents(1, 8192, Some("test_e2e_stream"));
    let torrent = make_single_file_torrent(files.path(), "0.data", 1024);

    let orig_content = std::fs::read(files.path().join("0.data")).unwrap();
    let server_session = Session::new_with_opts(
        files.path().into(),
        crate::SessionOptions {
            disable_dht: true,
            peer_id: Some(TestPeerMetadata::good().as_peer_id()),
            persistence: None,
            listen: Some(crate::listen::ListenerOptions {
                listen_addr: (Ipv4Addr::LOCALHOST, 16001).into(),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
    .await
    .context("error creating server session")?;

    info!("created server session");

    timeout(
        Duration::from_secs(5),
        server_session
            .add_torrent(
                AddTorrent::from_bytes(torrent.to_vec()),
                Some(crate::AddTorrentOptions {
                    paused: false,
                    output_folder: Some(files.path().to_str().unwrap().to_owned()),
                    overwrite: true,
                    ..Default::default()
                }),
            )
            .await?
            .into_handle()
            .unwrap()
            .wait_until_completed(),
    )
    .await?
    .context("error adding torrent")?;

    info!("server torrent was completed");

    let peer = server_session
        .listen_addr()
        .context("expected listen_addr to be set")?;

    let client_dir = TempDir::with_prefix("test_e2e_stream_client")?;

    let client_session = Session::new_with_opts(
        client_dir.path().into(),
        crate::SessionOptions {
            disable_dht: true,
            persistence: None,
            peer_id: Some(TestPeerMetadata::good().as_peer_id()),
            ..Default::default()
        },
    )
    .await?;

    info!("created client session");

    let client_handle = client_session
        .add_torrent(
            AddTorrent::from_bytes(torrent.to_vec()),
            Some(crate::AddTorrentOptions {
                paused: false,
                initial_peers: Some(vec![peer]),
                ..Default::default()
            }),
        )
        .await?
        .into_handle()
        .unwrap();

    client_handle.wait_until_initialized().await?;

    info!("client torrent initialized, starting stream");

    let mut stream = client_handle.stream(0).await?;
    let mut buf = Vec::<u8>::with_capacity(8192);
    stream.read_to_end(&mut buf).await?;

    if buf != orig_content {
        panic!("contents differ")
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_e2e_stream() -> anyhow::Result<()> {
    timeout(Duration::from_secs(10), e2e_stream()).await?
}
