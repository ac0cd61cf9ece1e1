//! File transfer sub-protocol.
//!
//! A transfer is announced with `filename`, carried in `filedata` blocks
//! at block-aligned byte offsets, and acknowledged block by block with
//! `filedata_ok`. The receiver tracks which byte ranges are on disk and is
//! done when they merge into one range covering the file. The sender keeps
//! a fixed window of unacknowledged blocks in flight and refills it one
//! block per acknowledgement.

use crate::error::{Error, Result};
use crate::protocol::command::{format_line, Verb};
use crate::tor::{ConnectionHandle, Direction};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Failure reason for a block whose offset is not a multiple of the block size.
pub const REASON_UNALIGNED: &str = "Unaligned data segment";
/// Failure reason for a block larger than the negotiated block size.
pub const REASON_OVERSIZED: &str = "Data segment too large";
/// Failure reason for a block that runs past the declared length.
pub const REASON_PAST_EOF: &str = "Data segment beyond end of file";
/// Failure reason for a file name that would escape the download folder.
pub const REASON_UNSAFE_NAME: &str = "Unsafe filename";
/// Failure reason when too many blocks arrive before the download starts.
pub const REASON_BUFFER_FULL: &str = "Too many buffered blocks";

/// Transfer state as reported to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Announced but not confirmed (no block written or acknowledged yet).
    Unverified,
    /// Blocks are flowing.
    Active,
    /// All bytes accounted for.
    Done,
    /// Stopped; see the failure reason.
    Aborted,
}

impl TransferState {
    /// Whether the transfer can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Aborted)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Unverified => f.write_str("PENDING"),
            TransferState::Active => f.write_str("TRANSFERRING"),
            TransferState::Done => f.write_str("DONE"),
            TransferState::Aborted => f.write_str("ABORTED"),
        }
    }
}

/// Snapshot of a transfer, handed to event monitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Remote peer.
    pub buddy_id: String,
    /// Transfer id (the transfer cookie).
    pub transfer_id: String,
    /// File name as announced.
    pub name: String,
    /// Local path; empty until an inbound download is started.
    pub path: PathBuf,
    /// Declared length in bytes.
    pub length: u64,
    /// Bytes written (inbound) or acknowledged (outbound).
    pub transferred: u64,
    /// Inbound means we receive.
    pub direction: Direction,
    /// Current state.
    pub state: TransferState,
    /// Set once the transfer is aborted.
    pub failure_reason: Option<String>,
}

/// Half-open byte range `[start, end)` known to be on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First byte.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

/// Sorted, non-overlapping, non-adjacent segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentList {
    segments: Vec<Segment>,
}

impl SegmentList {
    /// Record `[start, end)`, merging with any overlapping or touching range.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = Segment { start, end };
        let mut out = Vec::with_capacity(self.segments.len() + 1);
        let mut placed = false;
        for seg in self.segments.drain(..) {
            if seg.end < merged.start {
                out.push(seg);
            } else if seg.start > merged.end {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(seg);
            } else {
                merged.start = merged.start.min(seg.start);
                merged.end = merged.end.max(seg.end);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.segments = out;
    }

    /// Total bytes covered.
    pub fn covered(&self) -> u64 {
        self.segments.iter().map(|s| s.end - s.start).sum()
    }

    /// Whether the list is exactly `[{0, length}]`.
    pub fn is_complete(&self, length: u64) -> bool {
        match self.segments.as_slice() {
            [] => length == 0,
            [only] => only.start == 0 && only.end == length,
            _ => false,
        }
    }

    /// The segments, in order.
    pub fn as_slice(&self) -> &[Segment] {
        &self.segments
    }
}

/// Hex MD5 of a block, as carried in `filedata`.
pub fn block_checksum(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Whether `name` is a plain file name that stays inside the download folder.
pub fn is_safe_filename(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!((components.next(), components.next()), (Some(Component::Normal(_)), None))
}

/// Human-readable reason for an error that aborts a transfer.
pub fn failure_reason(err: &Error) -> String {
    match err {
        Error::Transfer(reason) => reason.clone(),
        other => other.to_string(),
    }
}

fn transfer_error(reason: &str) -> Error {
    Error::Transfer(reason.to_string())
}

/// One file transfer attached to a peer.
pub struct FileTransfer {
    info: FileInfo,
    cookie: String,
    block_size: usize,
    file: Option<File>,

    segments: SegmentList,
    buffered: Vec<(u64, Vec<u8>)>,
    max_buffered: usize,

    outstanding: BTreeMap<u64, usize>,
    next_offset: u64,
    eof: bool,
    max_out_buffers: usize,
}

impl fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransfer")
            .field("info", &self.info)
            .field("block_size", &self.block_size)
            .field("outstanding", &self.outstanding.len())
            .field("segments", &self.segments.as_slice().len())
            .finish()
    }
}

impl FileTransfer {
    /// Inbound transfer from a `filename` announcement. Starts UNVERIFIED.
    pub fn incoming(
        buddy_id: &str,
        cookie: &str,
        name: &str,
        length: u64,
        block_size: usize,
        max_buffered: usize,
    ) -> Result<Self> {
        if cookie.is_empty() {
            return Err(Error::Protocol("empty transfer cookie".into()));
        }
        if block_size == 0 {
            return Err(Error::Protocol("zero block size".into()));
        }
        Ok(Self {
            info: FileInfo {
                buddy_id: buddy_id.to_string(),
                transfer_id: cookie.to_string(),
                name: name.to_string(),
                path: PathBuf::new(),
                length,
                transferred: 0,
                direction: Direction::Inbound,
                state: TransferState::Unverified,
                failure_reason: None,
            },
            cookie: cookie.to_string(),
            block_size,
            file: None,
            segments: SegmentList::default(),
            buffered: Vec::new(),
            max_buffered,
            outstanding: BTreeMap::new(),
            next_offset: 0,
            eof: true,
            max_out_buffers: 0,
        })
    }

    /// Outbound transfer of `path`. Opens the file; call
    /// [`start_sending`](Self::start_sending) to announce it.
    pub async fn outgoing(
        buddy_id: &str,
        path: &Path,
        block_size: usize,
        max_out_buffers: usize,
    ) -> Result<Self> {
        if block_size == 0 || max_out_buffers == 0 {
            return Err(Error::InvalidArgument("block size and window must be positive".into()));
        }
        let file = File::open(path).await?;
        let length = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidArgument("path has no file name".into()))?;
        let cookie = crate::protocol::random_cookie(32);

        Ok(Self {
            info: FileInfo {
                buddy_id: buddy_id.to_string(),
                transfer_id: cookie.clone(),
                name,
                path: path.to_path_buf(),
                length,
                transferred: 0,
                direction: Direction::Outbound,
                state: TransferState::Unverified,
                failure_reason: None,
            },
            cookie,
            block_size,
            file: Some(file),
            segments: SegmentList::default(),
            buffered: Vec::new(),
            max_buffered: 0,
            outstanding: BTreeMap::new(),
            next_offset: 0,
            eof: length == 0,
            max_out_buffers,
        })
    }

    /// Snapshot for monitors.
    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Transfer cookie (also the transfer id).
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Direction.
    pub fn direction(&self) -> Direction {
        self.info.direction
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        self.info.state
    }

    /// Unacknowledged blocks in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Whether every byte is accounted for.
    pub fn is_complete(&self) -> bool {
        match self.info.direction {
            Direction::Inbound => self.segments.is_complete(self.info.length),
            Direction::Outbound => self.eof && self.outstanding.is_empty(),
        }
    }

    // ---- receiving ----

    /// Open the destination under `folder` and flush buffered blocks.
    pub async fn start_download(&mut self, folder: &Path, out: &ConnectionHandle) -> Result<()> {
        if self.info.direction != Direction::Inbound || self.info.state != TransferState::Unverified {
            return Err(Error::Transfer("download already started".into()));
        }
        if !is_safe_filename(&self.info.name) {
            return Err(transfer_error(REASON_UNSAFE_NAME));
        }

        tokio::fs::create_dir_all(folder).await?;
        let (file, path) = create_unique(folder, &self.info.name).await?;
        info!(transfer = %self.cookie, path = ?path, length = self.info.length, "Download started");
        self.file = Some(file);
        self.info.path = path;
        self.info.state = TransferState::Active;

        for (offset, data) in std::mem::take(&mut self.buffered) {
            self.write_block(offset, &data, out).await?;
        }
        self.finish_if_complete().await?;
        Ok(())
    }

    /// Handle one received block at byte `offset`.
    pub async fn on_incoming_data(&mut self, offset: u64, data: &[u8], out: &ConnectionHandle) -> Result<()> {
        match self.info.state {
            TransferState::Unverified => {
                if self.buffered.len() >= self.max_buffered {
                    return Err(transfer_error(REASON_BUFFER_FULL));
                }
                debug!(transfer = %self.cookie, offset, "Buffering block until download starts");
                self.buffered.push((offset, data.to_vec()));
                Ok(())
            }
            TransferState::Active => {
                self.write_block(offset, data, out).await?;
                self.finish_if_complete().await
            }
            TransferState::Done | TransferState::Aborted => {
                debug!(transfer = %self.cookie, offset, "Block for finished transfer ignored");
                Ok(())
            }
        }
    }

    async fn write_block(&mut self, offset: u64, data: &[u8], out: &ConnectionHandle) -> Result<()> {
        if offset % self.block_size as u64 != 0 {
            return Err(transfer_error(REASON_UNALIGNED));
        }
        if data.len() > self.block_size {
            return Err(transfer_error(REASON_OVERSIZED));
        }
        let end = match offset.checked_add(data.len() as u64) {
            Some(end) if end <= self.info.length => end,
            _ => return Err(transfer_error(REASON_PAST_EOF)),
        };

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Transfer("destination not open".into()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        self.segments.insert(offset, end);
        self.info.transferred = self.segments.covered();
        out.send_line(format_line(
            Verb::FiledataOk,
            &[self.cookie.as_bytes(), offset.to_string().as_bytes()],
        ))?;
        Ok(())
    }

    async fn finish_if_complete(&mut self) -> Result<()> {
        if !self.is_complete() {
            return Ok(());
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        self.info.state = TransferState::Done;
        info!(transfer = %self.cookie, bytes = self.info.transferred, "Transfer complete");
        Ok(())
    }

    // ---- sending ----

    /// Announce the file and fill the send window.
    pub async fn start_sending(&mut self, out: &ConnectionHandle) -> Result<()> {
        if self.info.direction != Direction::Outbound {
            return Err(Error::Transfer("not an outbound transfer".into()));
        }
        out.send_line(format_line(
            Verb::Filename,
            &[
                self.cookie.as_bytes(),
                self.info.length.to_string().as_bytes(),
                self.block_size.to_string().as_bytes(),
                self.info.name.as_bytes(),
            ],
        ))?;
        info!(transfer = %self.cookie, length = self.info.length, block_size = self.block_size, "Offering file");

        while self.send_next_block(out).await? {}
        self.finish_if_sent();
        Ok(())
    }

    /// Handle `filedata_ok`: retire the block and send one more.
    pub async fn on_block_acknowledged(&mut self, offset: u64, out: &ConnectionHandle) -> Result<()> {
        if self.info.state.is_terminal() {
            return Ok(());
        }
        let Some(len) = self.outstanding.remove(&offset) else {
            debug!(transfer = %self.cookie, offset, "Acknowledgement for unknown block");
            return Ok(());
        };
        self.info.transferred += len as u64;
        if self.info.state == TransferState::Unverified {
            self.info.state = TransferState::Active;
        }
        self.send_next_block(out).await?;
        self.finish_if_sent();
        Ok(())
    }

    /// Handle `filedata_error`: resend the same block.
    pub async fn on_block_error(&mut self, offset: u64, out: &ConnectionHandle) -> Result<()> {
        if self.info.state.is_terminal() {
            return Ok(());
        }
        let Some(&len) = self.outstanding.get(&offset) else {
            debug!(transfer = %self.cookie, offset, "Resend requested for unknown block");
            return Ok(());
        };
        warn!(transfer = %self.cookie, offset, "Peer rejected block, resending");
        let data = self.read_block(offset, len).await?;
        if data.len() != len {
            return Err(Error::Transfer("source file changed during transfer".into()));
        }
        self.send_block(offset, &data, out)
    }

    async fn send_next_block(&mut self, out: &ConnectionHandle) -> Result<bool> {
        if self.eof || self.outstanding.len() >= self.max_out_buffers {
            return Ok(false);
        }
        let offset = self.next_offset;
        let data = self.read_block(offset, self.block_size).await?;
        if data.is_empty() {
            self.eof = true;
            return Ok(false);
        }

        self.next_offset += data.len() as u64;
        if data.len() < self.block_size || self.next_offset >= self.info.length {
            self.eof = true;
        }
        self.outstanding.insert(offset, data.len());
        self.send_block(offset, &data, out)?;
        Ok(!self.eof)
    }

    async fn read_block(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Transfer("source not open".into()))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut data[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        Ok(data)
    }

    fn send_block(&self, offset: u64, data: &[u8], out: &ConnectionHandle) -> Result<()> {
        let checksum = block_checksum(data);
        out.send_line(format_line(
            Verb::Filedata,
            &[
                self.cookie.as_bytes(),
                offset.to_string().as_bytes(),
                checksum.as_bytes(),
                data,
            ],
        ))
    }

    fn finish_if_sent(&mut self) {
        if self.is_complete() && !self.info.state.is_terminal() {
            self.file = None;
            self.info.state = TransferState::Done;
            info!(transfer = %self.cookie, bytes = self.info.transferred, "File sent");
        }
    }

    // ---- abort ----

    /// Abort the transfer. Returns `false` if it had already finished.
    ///
    /// Closes the file, deletes a partial download and, when `notify` is
    /// given, tells the peer to stop (`file_stop_sending` for inbound,
    /// `file_stop_receiving` for outbound transfers).
    pub async fn abort(&mut self, reason: &str, notify: Option<&ConnectionHandle>) -> bool {
        if self.info.state.is_terminal() {
            return false;
        }
        warn!(transfer = %self.cookie, reason, "Aborting transfer");
        self.info.state = TransferState::Aborted;
        self.info.failure_reason = Some(reason.to_string());
        self.buffered.clear();
        self.outstanding.clear();

        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        if self.info.direction == Direction::Inbound && !self.info.path.as_os_str().is_empty() {
            if let Err(e) = tokio::fs::remove_file(&self.info.path).await {
                debug!(transfer = %self.cookie, error = %e, "Could not remove partial file");
            }
        }

        if let Some(out) = notify {
            let verb = match self.info.direction {
                Direction::Inbound => Verb::FileStopSending,
                Direction::Outbound => Verb::FileStopReceiving,
            };
            if let Err(e) = out.send_line(format_line(verb, &[self.cookie.as_bytes()])) {
                debug!(transfer = %self.cookie, error = %e, "Could not notify peer of abort");
            }
        }
        true
    }
}

/// Create `name` in `folder` without clobbering an existing file; a
/// ` (n)` suffix is inserted before the extension on collision.
async fn create_unique(folder: &Path, name: &str) -> Result<(File, PathBuf)> {
    let original = Path::new(name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = original.extension().map(|e| e.to_string_lossy().into_owned());

    for n in 0..1000u32 {
        let candidate = match (n, &ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (n, None) => format!("{} ({})", stem, n),
        };
        let path = folder.join(candidate);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Transfer("no free destination name".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use tokio::sync::mpsc::Receiver;

    fn handle() -> (ConnectionHandle, Receiver<Vec<u8>>) {
        ConnectionHandle::new("test", Direction::Outbound)
    }

    fn drain(rx: &mut Receiver<Vec<u8>>) -> Vec<Request> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(Request::parse(&line).unwrap());
        }
        out
    }

    /// Split the `filedata` remainder into offset, checksum and data.
    fn filedata_parts(req: &Request) -> (u64, String, Vec<u8>) {
        let mut parts = req.arg(1).splitn(3, |&b| b == b' ');
        let offset = std::str::from_utf8(parts.next().unwrap()).unwrap().parse().unwrap();
        let md5 = String::from_utf8(parts.next().unwrap().to_vec()).unwrap();
        let data = parts.next().unwrap().to_vec();
        (offset, md5, data)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_segments_merge() {
        let mut list = SegmentList::default();
        list.insert(10, 20);
        list.insert(30, 40);
        assert_eq!(list.as_slice().len(), 2);
        list.insert(20, 30);
        assert_eq!(list.as_slice(), &[Segment { start: 10, end: 40 }]);
        list.insert(0, 5);
        list.insert(5, 10);
        assert!(list.is_complete(40));
        assert!(!list.is_complete(41));
    }

    #[test]
    fn test_duplicate_segment_not_double_counted() {
        let mut list = SegmentList::default();
        list.insert(0, 8);
        list.insert(0, 8);
        list.insert(4, 8);
        assert_eq!(list.covered(), 8);
        assert_eq!(list.as_slice().len(), 1);
    }

    #[test]
    fn test_segments_out_of_order() {
        let mut list = SegmentList::default();
        for start in [40u64, 0, 30, 10, 20] {
            list.insert(start, start + 10);
        }
        assert!(list.is_complete(50));
        assert_eq!(list.covered(), 50);
    }

    #[test]
    fn test_safe_filenames() {
        assert!(is_safe_filename("photo.jpg"));
        assert!(is_safe_filename("my file (1).tar.gz"));
        assert!(!is_safe_filename(""));
        assert!(!is_safe_filename(".."));
        assert!(!is_safe_filename("."));
        assert!(!is_safe_filename("../etc/passwd"));
        assert!(!is_safe_filename("/etc/passwd"));
        assert!(!is_safe_filename("dir\\evil"));
    }

    #[test]
    fn test_block_checksum() {
        assert_eq!(block_checksum(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(block_checksum(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[tokio::test]
    async fn test_receiver_out_of_order_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (out, mut rx) = handle();
        let data = pattern(20);
        let mut transfer = FileTransfer::incoming("bob", "ck", "f.bin", 20, 8, 42).unwrap();
        transfer.start_download(dir.path(), &out).await.unwrap();

        transfer.on_incoming_data(16, &data[16..], &out).await.unwrap();
        transfer.on_incoming_data(0, &data[..8], &out).await.unwrap();
        transfer.on_incoming_data(0, &data[..8], &out).await.unwrap();
        assert_eq!(transfer.info().transferred, 12);
        assert!(!transfer.is_complete());

        transfer.on_incoming_data(8, &data[8..16], &out).await.unwrap();
        assert_eq!(transfer.state(), TransferState::Done);
        assert_eq!(transfer.info().transferred, 20);

        let acks: Vec<u64> = drain(&mut rx)
            .iter()
            .map(|r| {
                assert_eq!(r.verb(), Verb::FiledataOk);
                r.arg_u64(1).unwrap()
            })
            .collect();
        assert_eq!(acks, vec![16, 0, 0, 8]);
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn test_unaligned_block_aborts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let (out, mut rx) = handle();
        let mut transfer = FileTransfer::incoming("bob", "ck", "part.bin", 100, 8, 42).unwrap();
        transfer.start_download(dir.path(), &out).await.unwrap();
        transfer.on_incoming_data(0, &[1; 8], &out).await.unwrap();

        let err = transfer.on_incoming_data(3, &[1; 8], &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_UNALIGNED);

        assert!(transfer.abort(&failure_reason(&err), Some(&out)).await);
        assert_eq!(transfer.state(), TransferState::Aborted);
        assert_eq!(transfer.info().failure_reason.as_deref(), Some(REASON_UNALIGNED));
        assert!(!dir.path().join("part.bin").exists());

        let sent = drain(&mut rx);
        let last = sent.last().unwrap();
        assert_eq!(last.verb(), Verb::FileStopSending);
        assert_eq!(last.arg(0), b"ck");

        assert!(!transfer.abort("again", Some(&out)).await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_and_past_eof_blocks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (out, _rx) = handle();
        let mut transfer = FileTransfer::incoming("bob", "ck", "x.bin", 20, 8, 42).unwrap();
        transfer.start_download(dir.path(), &out).await.unwrap();

        let err = transfer.on_incoming_data(0, &[0; 9], &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_OVERSIZED);
        let err = transfer.on_incoming_data(24, &[0; 1], &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_PAST_EOF);
        let err = transfer.on_incoming_data(16, &[0; 8], &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_PAST_EOF);
        let err = transfer.on_incoming_data(u64::MAX - 7, &[0; 8], &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_PAST_EOF);
    }

    #[tokio::test]
    async fn test_unsafe_filename_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (out, _rx) = handle();
        let mut transfer = FileTransfer::incoming("bob", "ck", "../escape", 4, 8, 42).unwrap();
        let err = transfer.start_download(dir.path(), &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_UNSAFE_NAME);
    }

    #[tokio::test]
    async fn test_existing_file_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"keep").unwrap();
        let (out, _rx) = handle();
        let mut transfer = FileTransfer::incoming("bob", "ck", "a.txt", 2, 8, 42).unwrap();
        transfer.start_download(dir.path(), &out).await.unwrap();
        transfer.on_incoming_data(0, b"hi", &out).await.unwrap();

        assert_eq!(transfer.info().path, dir.path().join("a (1).txt"));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"keep");
        assert_eq!(std::fs::read(dir.path().join("a (1).txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_blocks_buffered_until_download_starts() {
        let dir = tempfile::tempdir().unwrap();
        let (out, mut rx) = handle();
        let mut transfer = FileTransfer::incoming("bob", "ck", "b.bin", 16, 8, 2).unwrap();

        transfer.on_incoming_data(8, &[2; 8], &out).await.unwrap();
        transfer.on_incoming_data(0, &[1; 8], &out).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        let err = transfer.on_incoming_data(0, &[1; 8], &out).await.unwrap_err();
        assert_eq!(failure_reason(&err), REASON_BUFFER_FULL);

        transfer.start_download(dir.path(), &out).await.unwrap();
        assert_eq!(transfer.state(), TransferState::Done);
        let acks: Vec<u64> = drain(&mut rx).iter().map(|r| r.arg_u64(1).unwrap()).collect();
        assert_eq!(acks, vec![8, 0]);
    }

    #[tokio::test]
    async fn test_empty_file_completes_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let (out, _rx) = handle();
        let mut transfer = FileTransfer::incoming("bob", "ck", "empty", 0, 8, 42).unwrap();
        transfer.start_download(dir.path(), &out).await.unwrap();
        assert_eq!(transfer.state(), TransferState::Done);
    }

    #[tokio::test]
    async fn test_sender_window_discipline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, pattern(100_000)).unwrap();
        let (out, mut rx) = handle();

        let mut transfer = FileTransfer::outgoing("bob", &path, 8192, 12).await.unwrap();
        transfer.start_sending(&out).await.unwrap();

        let sent = drain(&mut rx);
        assert_eq!(sent[0].verb(), Verb::Filename);
        assert_eq!(sent[0].arg_u64(1).unwrap(), 100_000);
        assert_eq!(sent[0].arg_u64(2).unwrap(), 8192);
        assert_eq!(sent[0].arg(3), b"big.bin");
        assert_eq!(sent.len(), 1 + 12);
        assert_eq!(transfer.outstanding(), 12);
        assert_eq!(transfer.state(), TransferState::Unverified);

        let offsets: Vec<u64> = sent[1..].iter().map(|r| filedata_parts(r).0).collect();
        for offset in offsets.iter().rev() {
            transfer.on_block_acknowledged(*offset, &out).await.unwrap();
            assert!(transfer.outstanding() <= 12);
        }
        assert_eq!(transfer.state(), TransferState::Active);
        // 100000 bytes are 13 blocks: one more block goes out, then EOF
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(transfer.outstanding(), 1);
        assert!(!transfer.is_complete());

        transfer.on_block_acknowledged(12 * 8192, &out).await.unwrap();
        assert_eq!(transfer.state(), TransferState::Done);
        assert_eq!(transfer.info().transferred, 100_000);
    }

    #[tokio::test]
    async fn test_block_error_resends_same_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.bin");
        std::fs::write(&path, pattern(20)).unwrap();
        let (out, mut rx) = handle();

        let mut transfer = FileTransfer::outgoing("bob", &path, 8, 12).await.unwrap();
        transfer.start_sending(&out).await.unwrap();
        let first = drain(&mut rx);
        let original = first.iter().find(|r| r.verb() == Verb::Filedata && filedata_parts(r).0 == 8).unwrap();

        transfer.on_block_error(8, &out).await.unwrap();
        let resent = drain(&mut rx);
        assert_eq!(resent.len(), 1);
        assert_eq!(filedata_parts(&resent[0]), filedata_parts(original));
        assert_eq!(transfer.outstanding(), 3);
    }

    #[tokio::test]
    async fn test_transfer_with_reordered_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let downloads = dir.path().join("downloads");
        let content = pattern(100_000);
        std::fs::write(&src, &content).unwrap();

        let (to_receiver, mut sender_rx) = handle();
        let (to_sender, mut receiver_rx) = handle();

        let mut sender = FileTransfer::outgoing("bob", &src, 8192, 12).await.unwrap();
        sender.start_sending(&to_receiver).await.unwrap();

        let announce = drain(&mut sender_rx);
        let filename = &announce[0];
        let mut receiver = FileTransfer::incoming(
            "alice",
            filename.arg_str(0).unwrap(),
            filename.arg_str(3).unwrap(),
            filename.arg_u64(1).unwrap(),
            filename.arg_u64(2).unwrap() as usize,
            42,
        )
        .unwrap();
        receiver.start_download(&downloads, &to_sender).await.unwrap();

        let mut blocks: Vec<Request> = announce.into_iter().skip(1).collect();
        let mut rounds = 0;
        while !blocks.is_empty() {
            rounds += 1;
            assert!(rounds < 100);
            blocks.reverse();
            for block in &blocks {
                let (offset, md5, data) = filedata_parts(block);
                assert_eq!(block_checksum(&data), md5);
                receiver.on_incoming_data(offset, &data, &to_sender).await.unwrap();
            }
            let mut acks = drain(&mut receiver_rx);
            acks.reverse();
            for ack in acks {
                sender.on_block_acknowledged(ack.arg_u64(1).unwrap(), &to_receiver).await.unwrap();
            }
            blocks = drain(&mut sender_rx);
        }

        assert_eq!(sender.state(), TransferState::Done);
        assert_eq!(receiver.state(), TransferState::Done);
        assert_eq!(sender.info().transferred, 100_000);
        assert_eq!(receiver.info().transferred, 100_000);
        assert_eq!(std::fs::read(downloads.join("src.bin")).unwrap(), content);
    }

    #[tokio::test]
    async fn test_outbound_abort_notifies_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.bin");
        std::fs::write(&path, pattern(10)).unwrap();
        let (out, mut rx) = handle();
        let mut transfer = FileTransfer::outgoing("bob", &path, 8, 12).await.unwrap();
        transfer.start_sending(&out).await.unwrap();
        drain(&mut rx);

        assert!(transfer.abort("Cancelled", Some(&out)).await);
        let sent = drain(&mut rx);
        assert_eq!(sent[0].verb(), Verb::FileStopReceiving);
        assert!(path.exists());
    }
}
