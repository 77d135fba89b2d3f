//! Frame-level send and receive loops shared by both transfer directions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use md5::{Digest, Md5};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::broker::Broker;
use crate::constants::{MFT_FRAME_DELAY, MFT_FRAME_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::mft::{Frame, FrameType, Progress, MAX_BODY_LEN};

/// Largest file the 2-byte frame counter can describe.
pub const MAX_FILE_SIZE: u64 = u16::MAX as u64 * MAX_BODY_LEN as u64;

/// Size and lowercase-hex MD5 of a regular file.
pub async fn file_info(path: &Path) -> Result<(u64, String)> {
    let meta = tokio::fs::metadata(path).await.map_err(|_| Error::Transfer {
        message: format!("{}: not found", path.display()),
    })?;
    if meta.is_dir() {
        return Err(Error::Transfer {
            message: format!("{}: not found", path.display()),
        });
    }

    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok((meta.len(), hex::encode(hasher.finalize())))
}

/// Resolve the destination of a transfer.
///
/// The parent directory must exist. A destination naming a directory (or
/// ending in `/`) gets the source basename appended. An existing file is
/// refused rather than overwritten.
pub fn destination_path_check(destination: &str, source: &str) -> Result<PathBuf> {
    let mut dest = PathBuf::from(destination);

    let treat_as_dir = destination.ends_with('/') || dest.is_dir();
    let dir = if treat_as_dir {
        dest.clone()
    } else {
        dest.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    };

    let dir_probe = if dir.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        dir.clone()
    };
    match std::fs::metadata(&dir_probe) {
        Err(_) => {
            return Err(Error::Transfer {
                message: format!("{} dir not exist", dir_probe.display()),
            })
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(Error::Transfer {
                message: format!("{} is not dir", dir_probe.display()),
            })
        }
        Ok(_) => {}
    }

    if treat_as_dir {
        let base = Path::new(source)
            .file_name()
            .ok_or_else(|| Error::transfer("file name not valid"))?;
        dest = dir.join(base);
    }

    if dest.exists() {
        return Err(Error::Transfer {
            message: format!("{} already exist", dest.display()),
        });
    }
    Ok(dest)
}

fn push_progress(progress: Option<&mpsc::Sender<Progress>>, total: u32, done: u32) {
    if let Some(sink) = progress {
        let _ = sink.try_send(Progress::new(total, done));
    }
}

/// Transmit a file as MFT frames on `topic`.
///
/// START carries the total frame count, TRANSMISSION frames count down
/// N..1 with 50 ms pacing, END carries 0. Returns the bytes sent.
pub async fn send_file(
    broker: &Arc<dyn Broker>,
    path: &Path,
    topic: &str,
    progress: Option<&mpsc::Sender<Progress>>,
) -> Result<u64> {
    let meta = tokio::fs::metadata(path).await?;
    let size = meta.len();
    if size == 0 {
        return Err(Error::transfer("source file is empty"));
    }
    if size > MAX_FILE_SIZE {
        return Err(Error::Transfer {
            message: format!("size too large: {size} bytes (max {MAX_FILE_SIZE})"),
        });
    }
    let total = size.div_ceil(MAX_BODY_LEN as u64) as u16;

    trace!(topic, total, "send mft start");
    broker.publish(topic, Frame::start(total).encode()).await?;
    push_progress(progress, total as u32, 0);

    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; MAX_BODY_LEN];
    let mut sent_bytes = 0u64;
    for frame_no in (1..=total).rev() {
        tokio::time::sleep(MFT_FRAME_DELAY).await;
        let n = read_chunk(&mut file, &mut buf).await?;
        if n == 0 {
            return Err(Error::transfer("source file shrank during transfer"));
        }
        let frame = Frame::transmission(frame_no, Bytes::copy_from_slice(&buf[..n]))?;
        trace!(topic, frame_no, bytes = n, "send mft transmission");
        broker.publish(topic, frame.encode()).await?;
        sent_bytes += n as u64;
        push_progress(progress, total as u32, (total - frame_no + 1) as u32);
    }

    tokio::time::sleep(MFT_FRAME_DELAY).await;
    trace!(topic, "send mft end");
    broker.publish(topic, Frame::end(0).encode()).await?;
    Ok(sent_bytes)
}

async fn read_chunk(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Subscribe a data topic, funnelling raw frame payloads into a channel.
pub async fn subscribe_frames(
    broker: &Arc<dyn Broker>,
    topic: &str,
) -> Result<mpsc::Receiver<Bytes>> {
    let (tx, rx) = mpsc::channel(10_000);
    let handler = Arc::new(move |_topic: &str, payload: &[u8]| {
        if tx.try_send(Bytes::copy_from_slice(payload)).is_err() {
            debug!("inbound frame channel full, dropping frame");
        }
    });
    broker.subscribe(topic, handler).await?;
    Ok(rx)
}

/// Drain frames from `rx` into `file` until a valid END arrives.
///
/// Enforces the receiver invariants: nothing before START, strictly
/// decreasing frame numbers, END only at zero, and a bounded gap between
/// consecutive frames.
pub async fn receive_into(
    file: &mut File,
    rx: &mut mpsc::Receiver<Bytes>,
    progress: Option<&mpsc::Sender<Progress>>,
) -> Result<()> {
    let mut total: u32 = 0;
    let mut remaining: Option<u16> = None;

    loop {
        let raw = tokio::time::timeout(MFT_FRAME_TIMEOUT, rx.recv())
            .await
            .map_err(|_| Error::transfer("timeout on reception"))?
            .ok_or(Error::ChannelClosed)?;
        let frame = Frame::decode(&raw)?;

        match frame.frame_type() {
            FrameType::Start => {
                total = frame.frame_no() as u32;
                remaining = Some(frame.frame_no());
                push_progress(progress, total, 0);
            }
            FrameType::Transmission => {
                let expected = remaining.ok_or_else(|| Error::transfer("missing start frame"))?;
                if expected == 0 || frame.frame_no() != expected {
                    return Err(Error::transfer("wrong frame order"));
                }
                file.write_all(frame.body()).await?;
                remaining = Some(expected - 1);
                push_progress(progress, total, total - expected as u32 + 1);
            }
            FrameType::End => {
                let expected = remaining.ok_or_else(|| Error::transfer("missing start frame"))?;
                if expected != 0 || frame.frame_no() != 0 {
                    return Err(Error::transfer("wrong frame order"));
                }
                file.flush().await?;
                push_progress(progress, total, total);
                return Ok(());
            }
        }
    }
}

/// Receive a transfer into `<dest>.tmp`, verify size and digest against the
/// advertised values, then rename into place. Partial state is discarded on
/// any failure.
pub async fn receive_and_verify(
    dest: &Path,
    rx: &mut mpsc::Receiver<Bytes>,
    expected_md5: &str,
    expected_size: u64,
    progress: Option<&mpsc::Sender<Progress>>,
) -> Result<()> {
    let tmp = tmp_path(dest);

    let outcome = async {
        let mut file = File::create(&tmp).await?;
        receive_into(&mut file, rx, progress).await?;
        drop(file);

        let (size, md5) = file_info(&tmp).await?;
        if size != expected_size {
            return Err(Error::Transfer {
                message: format!("fail check actual size {size}, expected: {expected_size}"),
            });
        }
        if md5 != expected_md5 {
            return Err(Error::Transfer {
                message: format!("fail check actual md5 {md5}, expected: {expected_md5}"),
            });
        }
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }
    .await;

    if outcome.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    outcome
}

/// `<path>.tmp` staging name for an in-flight transfer.
pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(tmp_path(Path::new("/tmp/a.bin")), PathBuf::from("/tmp/a.bin.tmp"));
    }

    #[tokio::test]
    async fn file_info_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello mft").await.unwrap();
        let (size, md5) = file_info(&path).await.unwrap();
        assert_eq!(size, 9);
        assert_eq!(md5.len(), 32);
        assert!(md5.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn file_info_rejects_missing_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(file_info(&dir.path().join("nope")).await.is_err());
        assert!(file_info(dir.path()).await.is_err());
    }

    #[test]
    fn destination_check_appends_basename_for_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let dest = destination_path_check(
            &format!("{}/", dir.path().display()),
            "/remote/src.bin",
        )
        .unwrap();
        assert_eq!(dest, dir.path().join("src.bin"));
    }

    #[test]
    fn destination_check_rejects_existing_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("already.bin");
        std::fs::write(&existing, b"x").unwrap();
        assert!(destination_path_check(existing.to_str().unwrap(), "/r/s.bin").is_err());
        assert!(destination_path_check("/no/such/dir/file.bin", "/r/s.bin").is_err());
    }

    #[tokio::test]
    async fn receive_rejects_transmission_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.tmp")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        tx.try_send(Frame::transmission(1, vec![1, 2, 3]).unwrap().encode())
            .unwrap();
        let err = receive_into(&mut file, &mut rx, None).await.unwrap_err();
        assert!(err.to_string().contains("missing start frame"));
    }

    #[tokio::test]
    async fn receive_rejects_out_of_order_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.tmp")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(Frame::start(2).encode()).unwrap();
        tx.try_send(Frame::transmission(1, vec![9]).unwrap().encode())
            .unwrap();
        let err = receive_into(&mut file, &mut rx, None).await.unwrap_err();
        assert!(err.to_string().contains("wrong frame order"));
    }

    #[tokio::test]
    async fn receive_accepts_descending_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.bin");
        let mut file = File::create(&out).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(Frame::start(2).encode()).unwrap();
        tx.try_send(Frame::transmission(2, vec![b'a'; 4]).unwrap().encode())
            .unwrap();
        tx.try_send(Frame::transmission(1, vec![b'b'; 2]).unwrap().encode())
            .unwrap();
        tx.try_send(Frame::end(0).encode()).unwrap();
        receive_into(&mut file, &mut rx, None).await.unwrap();
        assert_eq!(tokio::fs::read(&out).await.unwrap(), b"aaaabb");
    }

    #[tokio::test]
    async fn receive_rejects_early_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.tmp")).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tx.try_send(Frame::start(2).encode()).unwrap();
        tx.try_send(Frame::end(0).encode()).unwrap();
        let err = receive_into(&mut file, &mut rx, None).await.unwrap_err();
        assert!(err.to_string().contains("wrong frame order"));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out_on_silence() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("out.tmp")).await.unwrap();
        let (_tx, mut rx) = mpsc::channel::<Bytes>(1);
        let err = receive_into(&mut file, &mut rx, None).await.unwrap_err();
        assert!(err.to_string().contains("timeout on reception"));
    }
}
