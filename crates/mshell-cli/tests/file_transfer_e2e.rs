//! End-to-end MFT transfers over the in-memory broker hub.

use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use tokio::sync::mpsc;

use mshell_client::CpClient;
use mshell_core::constants::{cp_reply_topic, cp_topic};
use mshell_core::protocol::mft::{Frame, FrameType, Progress};
use mshell_server::CpServer;
use mshell_test_utils::MockHub;

const NODE: &str = "N1";

async fn start_pair(hub: &Arc<MockHub>) -> (Arc<CpServer>, CpClient) {
    let server = CpServer::start(hub.broker(), cp_topic(NODE), cp_reply_topic(NODE))
        .await
        .unwrap();
    let client = CpClient::connect(hub.broker(), cp_reply_topic(NODE), cp_topic(NODE))
        .await
        .unwrap();
    (server, client)
}

/// Record every frame published on any MFT data topic.
async fn attach_frame_sniffer(hub: &Arc<MockHub>) -> Arc<Mutex<Vec<Vec<u8>>>> {
    let sniffer = hub.broker();
    use mshell_core::broker::Broker;
    sniffer.start().await.unwrap();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    sniffer
        .subscribe(
            "/mft/#",
            Arc::new(move |_topic, payload| {
                sink.lock().unwrap().push(payload.to_vec());
            }),
        )
        .await
        .unwrap();
    frames
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn local_to_remote_preserves_bytes_and_frames() {
    let hub = MockHub::new();
    let (_server, client) = start_pair(&hub).await;
    let frames = attach_frame_sniffer(&hub).await;

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let source = src_dir.path().join("payload.bin");
    let body = pattern_bytes(12_500);
    std::fs::write(&source, &body).unwrap();

    let dest = dst_dir.path().join("payload.bin");
    let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(64);
    let status = client
        .copy_local_to_remote(&source, dest.to_str().unwrap(), Some(progress_tx))
        .await
        .unwrap();
    assert!(status.contains("file received with success"));

    // Byte-for-byte preservation, no staging leftovers.
    let received = std::fs::read(&dest).unwrap();
    assert_eq!(received.len(), 12_500);
    assert_eq!(md5_hex(&received), md5_hex(&body));
    assert!(!dst_dir.path().join("payload.bin.tmp").exists());

    // 12,500 bytes = frames of 5000 + 5000 + 2500, numbered descending.
    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 5);
    let decoded: Vec<Frame> = frames.iter().map(|f| Frame::decode(f).unwrap()).collect();
    assert_eq!(decoded[0].frame_type(), FrameType::Start);
    assert_eq!(decoded[0].frame_no(), 3);
    let transmissions: Vec<(u16, usize)> = decoded[1..4]
        .iter()
        .map(|f| {
            assert_eq!(f.frame_type(), FrameType::Transmission);
            (f.frame_no(), f.body().len())
        })
        .collect();
    assert_eq!(transmissions, vec![(3, 5000), (2, 5000), (1, 2500)]);
    assert_eq!(decoded[4].frame_type(), FrameType::End);
    assert_eq!(decoded[4].frame_no(), 0);

    // Progress ran to completion.
    let mut last = None;
    while let Ok(p) = progress_rx.try_recv() {
        last = Some(p);
    }
    let last = last.expect("no progress events");
    assert_eq!(last.frame_total, 3);
    assert_eq!(last.frame_received, 3);
}

#[tokio::test]
async fn remote_to_local_round_trip() {
    let hub = MockHub::new();
    let (_server, client) = start_pair(&hub).await;

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let remote = src_dir.path().join("remote.bin");
    let body = pattern_bytes(7_321);
    std::fs::write(&remote, &body).unwrap();

    let dest = client
        .copy_remote_to_local(
            remote.to_str().unwrap(),
            &format!("{}/", dst_dir.path().display()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(dest, dst_dir.path().join("remote.bin"));
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn destination_into_directory_takes_source_basename() {
    let hub = MockHub::new();
    let (_server, client) = start_pair(&hub).await;

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let source = src_dir.path().join("named.bin");
    std::fs::write(&source, pattern_bytes(100)).unwrap();

    let status = client
        .copy_local_to_remote(&source, &format!("{}/", dst_dir.path().display()), None)
        .await
        .unwrap();
    assert!(status.contains("named.bin"));
    assert!(dst_dir.path().join("named.bin").exists());
}

#[tokio::test]
async fn relative_remote_path_is_refused() {
    let hub = MockHub::new();
    let (_server, client) = start_pair(&hub).await;

    let src_dir = tempfile::tempdir().unwrap();
    let source = src_dir.path().join("x.bin");
    std::fs::write(&source, b"abc").unwrap();

    let err = client
        .copy_local_to_remote(&source, "relative/dest.bin", None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("absolute"));
}

#[tokio::test]
async fn missing_remote_source_fails_handshake() {
    let hub = MockHub::new();
    let (_server, client) = start_pair(&hub).await;

    let dst_dir = tempfile::tempdir().unwrap();
    let err = client
        .copy_remote_to_local(
            "/definitely/not/here.bin",
            &format!("{}/", dst_dir.path().display()),
            None,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn existing_destination_is_refused() {
    let hub = MockHub::new();
    let (_server, client) = start_pair(&hub).await;

    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let source = src_dir.path().join("x.bin");
    std::fs::write(&source, b"abc").unwrap();
    let dest = dst_dir.path().join("x.bin");
    std::fs::write(&dest, b"already here").unwrap();

    let err = client
        .copy_local_to_remote(&source, dest.to_str().unwrap(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already exist"));
    // The pre-existing file is untouched.
    assert_eq!(std::fs::read(&dest).unwrap(), b"already here");
}
