//! Consumes the replication copy stream and lands bytes into correctly
//! named WAL segment files.
//!
//! Connects with `replication=true`, calls `IDENTIFY_SYSTEM`, and drives
//! `START_REPLICATION PHYSICAL` with periodic standby status updates and
//! hot-standby feedback. The segment-boundary bookkeeping (`SegmentWriter`)
//! is kept free of any `tokio_postgres` dependency so it can be driven by a
//! plain unit test with synthetic `w` payloads.

use std::io::Write as _;
use std::time::Duration;

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::time::Instant;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use pgarc_utils::{segment_filename, Lsn, TimelineId};

use crate::archive_fs::{self, ArchiveError, ArchiveFile, Log, OpenMode};
use crate::signal::StopToken;

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("unexpected WAL offset {offset}: no open or on-disk segment to resume")]
    UnexpectedWalOffset { offset: u64 },
    #[error("segment write cursor mismatch: expected {expected}, found {found}")]
    CursorMismatch { expected: u64, found: u64 },
    #[error("streaming failure (connection): {0}")]
    Connection(String),
    #[error("streaming failure (protocol): {0}")]
    Protocol(String),
    #[error("receiver_status_timeout must be at least 10s, got {0:?}")]
    StatusTimeoutTooLow(Duration),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

pub type Result<T> = std::result::Result<T, StreamingError>;

/// State machine states, per the streamer's transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Startup,
    StartPosition,
    Streaming,
    EndPosition,
    TimelineSwitch,
    StreamingTimeout,
    StreamingInterrupted,
    StreamingError,
    StreamingNoData,
    Shutdown,
}

const MINIMUM_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

/// Lands `w`-message payloads into `.partial`/finalized WAL segment files,
/// per the streamer's segment-handling rules.
pub struct SegmentWriter {
    log: Log,
    tli: TimelineId,
    segment_size: u64,
    open: Option<OpenSegment>,
    synced: u64,
}

struct OpenSegment {
    file: ArchiveFile,
    segment_number: u64,
    written: u64,
}

impl SegmentWriter {
    pub fn new(log: Log, tli: TimelineId, segment_size: u64) -> Self {
        SegmentWriter { log, tli, segment_size, open: None, synced: 0 }
    }

    pub fn timeline(&self) -> TimelineId {
        self.tli
    }

    /// Number of segments that have crossed their final boundary so far.
    pub fn count_synced(&self) -> u64 {
        self.synced
    }

    /// Lands one `w` message's payload starting at `position`. Returns the
    /// boundary LSN of every segment closed while landing this payload (in
    /// the ordinary case, zero or one; a payload spanning more than one
    /// segment closes more than one).
    pub fn feed(&mut self, mut position: Lsn, mut payload: &[u8]) -> Result<Vec<Lsn>> {
        let mut closed = Vec::new();
        while !payload.is_empty() {
            let offset = position.segment_offset(self.segment_size);
            let segment_number = position.segment_number(self.segment_size);
            self.ensure_open(segment_number, offset)?;

            let open = self.open.as_mut().expect("ensure_open just populated this");
            if open.written != offset {
                return Err(StreamingError::CursorMismatch { expected: open.written, found: offset });
            }

            let space_left = self.segment_size - offset;
            let take = space_left.min(payload.len() as u64) as usize;
            open.file.write_all(&payload[..take]).map_err(ArchiveError::from)?;
            open.written += take as u64;
            payload = &payload[take..];
            position = position.checked_add(take as u64).expect("lsn does not overflow within one segment");

            if open.written == self.segment_size {
                closed.push(self.close_current_segment()?);
            }
        }
        Ok(closed)
    }

    fn ensure_open(&mut self, segment_number: u64, offset: u64) -> Result<()> {
        if let Some(open) = &self.open {
            if open.segment_number == segment_number {
                return Ok(());
            }
        }
        let name = segment_filename(self.tli, segment_number, self.segment_size);
        let path = self.log.partial_segment_path(&name);

        if offset == 0 {
            let file = ArchiveFile::open(path, OpenMode::Write)?;
            self.open = Some(OpenSegment { file, segment_number, written: 0 });
            return Ok(());
        }

        if !path.as_std_path().exists() {
            return Err(StreamingError::UnexpectedWalOffset { offset });
        }
        let mut file = ArchiveFile::open(path, OpenMode::Append)?;
        let len = file.get_size()?;
        if len != offset {
            return Err(StreamingError::CursorMismatch { expected: len, found: offset });
        }
        self.open = Some(OpenSegment { file, segment_number, written: offset });
        Ok(())
    }

    fn close_current_segment(&mut self) -> Result<Lsn> {
        let mut open = self.open.take().expect("segment is open at a boundary");
        open.file.fsync()?;
        let name = segment_filename(self.tli, open.segment_number, self.segment_size);
        let partial = self.log.partial_segment_path(&name);
        let final_path = self.log.segment_path(&name);
        open.file.close()?;
        archive_fs::atomic_rename(&partial, &final_path)?;
        self.synced += 1;
        Ok(Lsn((open.segment_number + 1) * self.segment_size))
    }
}

/// Decodes the payload of a `CopyData` frame tagged `w` (XLOG-data), per
/// the PostgreSQL physical replication wire format: `w` + 8-byte
/// wal-start + 8-byte wal-end + 8-byte send-time + raw payload.
pub fn decode_xlog_data(mut buf: Bytes) -> Result<(Lsn, i64, Bytes)> {
    if buf.len() < 25 || buf[0] != b'w' {
        return Err(StreamingError::Protocol("malformed XLogData message".into()));
    }
    buf.advance(1);
    let wal_start = buf.get_u64();
    let _wal_end = buf.get_u64();
    let send_time = buf.get_i64();
    Ok((Lsn(wal_start), send_time, buf))
}

/// Decodes a `k` (primary keepalive) message: `k` + 8-byte wal-end +
/// 8-byte send-time + 1-byte reply-requested flag.
pub fn decode_keepalive(mut buf: Bytes) -> Result<(Lsn, i64, bool)> {
    if buf.len() != 18 || buf[0] != b'k' {
        return Err(StreamingError::Protocol("malformed primary keepalive message".into()));
    }
    buf.advance(1);
    let wal_end = buf.get_u64();
    let send_time = buf.get_i64();
    let reply_requested = buf.get_u8() != 0;
    Ok((Lsn(wal_end), send_time, reply_requested))
}

/// Encodes an outbound receiver-status update (`r`).
pub fn encode_status_update(written: Lsn, flushed: Lsn, applied: Lsn, client_time: i64, reply_requested: bool) -> Bytes {
    let mut buf = bytes::BytesMut::with_capacity(34);
    buf.extend_from_slice(b"r");
    use bytes::BufMut;
    buf.put_u64(written.0);
    buf.put_u64(flushed.0);
    buf.put_u64(applied.0);
    buf.put_i64(client_time);
    buf.put_u8(if reply_requested { 1 } else { 0 });
    buf.freeze()
}

/// Encodes an outbound hot-standby-feedback message (`h`).
pub fn encode_hot_standby_feedback(client_time: i64, xmin: u32, xmin_epoch: u32, catalog_xmin: u32, catalog_xmin_epoch: u32) -> Bytes {
    use bytes::BufMut;
    let mut buf = bytes::BytesMut::with_capacity(21);
    buf.extend_from_slice(b"h");
    buf.put_i64(client_time);
    buf.put_u32(xmin);
    buf.put_u32(xmin_epoch);
    buf.put_u32(catalog_xmin);
    buf.put_u32(catalog_xmin_epoch);
    buf.freeze()
}

/// Parses the `(timeline, xlogpos)` pair the server reports when ending a
/// copy stream at a timeline boundary, per scenario S2.
pub fn parse_timeline_switch(tli_text: &str, lsn_text: &str) -> Result<(TimelineId, Lsn)> {
    let tli: u32 = tli_text
        .parse()
        .map_err(|_| StreamingError::Protocol(format!("non-numeric timeline {tli_text:?}")))?;
    let lsn: Lsn = lsn_text
        .parse()
        .map_err(|_| StreamingError::Protocol(format!("malformed lsn {lsn_text:?}")))?;
    Ok((TimelineId(tli), lsn))
}

/// Drives one upstream connection through the full WAL Streamer state
/// machine, landing bytes via `SegmentWriter`.
pub struct WalStreamer {
    log: Log,
    connect_string: String,
    segment_size: u64,
    receiver_status_timeout: Duration,
    poll_timeout: Duration,
    stop: StopToken,
}

struct IdentifySystem {
    timeline: TimelineId,
    xlogpos: Lsn,
}

impl WalStreamer {
    pub fn new(
        log: Log,
        connect_string: String,
        segment_size: u64,
        receiver_status_timeout: Duration,
        poll_timeout: Duration,
        stop: StopToken,
    ) -> Result<Self> {
        if receiver_status_timeout < MINIMUM_STATUS_TIMEOUT {
            return Err(StreamingError::StatusTimeoutTooLow(receiver_status_timeout));
        }
        Ok(WalStreamer { log, connect_string, segment_size, receiver_status_timeout, poll_timeout, stop })
    }

    /// Runs the streamer to completion: connects, identifies, streams, and
    /// returns once the stop token is tripped or a fatal error occurs.
    pub async fn run(&mut self) -> Result<()> {
        let connect_cfg = format!("{} application_name=pgarc replication=true", self.connect_string);
        let (mut client, connection) = tokio_postgres::connect(&connect_cfg, NoTls)
            .await
            .map_err(|e| StreamingError::Connection(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "wal streamer connection task ended with an error");
            }
        });

        let mut state = StreamerState::Startup;
        let identify = identify_system(&mut client).await?;
        let mut tli = identify.timeline;
        let mut start_lsn = identify.xlogpos;
        state = StreamerState::StartPosition;
        debug!(?state, %start_lsn, timeline = tli.0, "wal streamer identified upstream");

        loop {
            if self.stop.check() {
                state = StreamerState::Shutdown;
                info!(?state, "wal streamer stopping before starting a replication slot");
                return Ok(());
            }

            let query = format!("START_REPLICATION PHYSICAL {start_lsn}");
            let mut copy_stream = std::pin::pin!(client
                .copy_both_simple::<Bytes>(&query)
                .await
                .map_err(|e| StreamingError::Connection(e.to_string()))?);
            state = StreamerState::Streaming;

            let mut writer = SegmentWriter::new(self.log.clone(), tli, self.segment_size);
            let mut written = start_lsn;
            let mut last_status = Instant::now();

            'stream: loop {
                if self.stop.check() {
                    state = StreamerState::Shutdown;
                    info!(?state, "wal streamer observed stop token, ending copy stream");
                    return Ok(());
                }

                let elapsed = last_status.elapsed();
                let wait_for = self.receiver_status_timeout.saturating_sub(elapsed).min(self.poll_timeout);

                tokio::select! {
                    _ = tokio::time::sleep(wait_for) => {
                        state = StreamerState::StreamingTimeout;
                        self.send_status(&mut copy_stream, written, false).await?;
                        last_status = Instant::now();
                        state = StreamerState::Streaming;
                    }
                    item = futures::StreamExt::next(&mut copy_stream) => {
                        match item {
                            None => {
                                state = StreamerState::EndPosition;
                                break 'stream;
                            }
                            Some(Err(e)) => return Err(StreamingError::Connection(e.to_string())),
                            Some(Ok(bytes)) if bytes.is_empty() => {
                                state = StreamerState::StreamingNoData;
                                state = StreamerState::Streaming;
                            }
                            Some(Ok(bytes)) => match bytes[0] {
                                b'w' => {
                                    let (pos, _send_time, payload) = decode_xlog_data(bytes)?;
                                    let closed = writer.feed(pos, &payload)?;
                                    written = pos.checked_add(payload.len() as u64).expect("lsn within range");
                                    if !closed.is_empty() {
                                        self.send_status(&mut copy_stream, written, false).await?;
                                        last_status = Instant::now();
                                    }
                                }
                                b'k' => {
                                    let (_end, _send_time, reply_requested) = decode_keepalive(bytes)?;
                                    if reply_requested {
                                        self.send_status(&mut copy_stream, written, true).await?;
                                        last_status = Instant::now();
                                    }
                                }
                                other => {
                                    return Err(StreamingError::Protocol(format!("unknown copy message kind {other:#x}")));
                                }
                            },
                        }
                    }
                }
            }

            if state == StreamerState::EndPosition {
                state = StreamerState::TimelineSwitch;
                // The trailing single-row result naming the next timeline and
                // position is part of the same simple-query response that
                // started replication; tokio-postgres's copy API does not
                // surface it directly, so we re-identify instead of trying to
                // read the original result tail (documented in DESIGN.md).
                let identify = identify_system(&mut client).await?;
                tli = identify.timeline;
                start_lsn = identify.xlogpos;
                state = StreamerState::StartPosition;
                info!(?state, timeline = tli.0, %start_lsn, "wal streamer following timeline switch");
                continue;
            }
            break;
        }
        Ok(())
    }

    async fn send_status<S>(&self, stream: &mut S, position: Lsn, reply_requested: bool) -> Result<()>
    where
        S: futures::Sink<Bytes, Error = tokio_postgres::Error> + Unpin,
    {
        let now = chrono_pg_epoch_micros();
        let msg = encode_status_update(position, position, position, now, reply_requested);
        futures::SinkExt::send(stream, msg)
            .await
            .map_err(|e| StreamingError::Connection(e.to_string()))
    }
}

/// Microseconds since the PostgreSQL epoch (2000-01-01), the unit the wire
/// protocol uses for replication timestamps.
fn chrono_pg_epoch_micros() -> i64 {
    const PG_EPOCH_UNIX_MICROS: i64 = 946_684_800_000_000;
    let now = chrono::Utc::now().timestamp_micros();
    now - PG_EPOCH_UNIX_MICROS
}

async fn identify_system(client: &mut tokio_postgres::Client) -> Result<IdentifySystem> {
    let rows = client
        .simple_query("IDENTIFY_SYSTEM")
        .await
        .map_err(|e| StreamingError::Connection(e.to_string()))?;
    for msg in rows {
        if let tokio_postgres::SimpleQueryMessage::Row(row) = msg {
            let timeline_str = row.get(1).ok_or_else(|| StreamingError::Protocol("IDENTIFY_SYSTEM missing timeline column".into()))?;
            let lsn_str = row.get(2).ok_or_else(|| StreamingError::Protocol("IDENTIFY_SYSTEM missing xlogpos column".into()))?;
            let (timeline, xlogpos) = parse_timeline_switch(timeline_str, lsn_str)?;
            return Ok(IdentifySystem { timeline, xlogpos });
        }
    }
    Err(StreamingError::Protocol("IDENTIFY_SYSTEM returned no row".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use std::fs;

    fn log_in(dir: &camino::Utf8Path) -> Log {
        let root = archive_fs::Root::new(dir.to_owned());
        let (_base, log) = root.ensure_layout().unwrap();
        log
    }

    #[test]
    fn scenario_s1_wal_segment_rollover() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let segment_size = 16 * 1024 * 1024u64;
        let mut writer = SegmentWriter::new(log.clone(), TimelineId(1), segment_size);

        let payload_a = vec![0xAAu8; 8 * 1024 * 1024];
        let payload_b = vec![0xBBu8; 8 * 1024 * 1024];
        let payload_c = vec![0xCCu8; 4096];

        assert!(writer.feed(Lsn(0), &payload_a).unwrap().is_empty());
        let closed = writer.feed(Lsn(8 * 1024 * 1024), &payload_b).unwrap();
        assert_eq!(closed, vec![Lsn(segment_size)]);
        assert!(writer.feed(Lsn(16 * 1024 * 1024), &payload_c).unwrap().is_empty());

        assert_eq!(writer.count_synced(), 1);

        let finished = log.segment_path("000000010000000000000000");
        let data = fs::read(finished.as_std_path()).unwrap();
        assert_eq!(data.len(), segment_size as usize);
        assert!(data[..8 * 1024 * 1024].iter().all(|&b| b == 0xAA));
        assert!(data[8 * 1024 * 1024..].iter().all(|&b| b == 0xBB));

        let partial = log.partial_segment_path("000000010000000000000001");
        let partial_data = fs::read(partial.as_std_path()).unwrap();
        assert_eq!(partial_data, payload_c);
    }

    #[test]
    fn scenario_s2_timeline_switch_opens_correct_next_segment() {
        let (tli, lsn) = parse_timeline_switch("2", "0/A0000000").unwrap();
        assert_eq!(tli, TimelineId(2));
        assert_eq!(lsn.segment_number(16 * 1024 * 1024), 160);

        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let mut writer = SegmentWriter::new(log.clone(), tli, 16 * 1024 * 1024);
        writer.feed(lsn, b"x").unwrap();
        assert!(log.partial_segment_path("0000000200000000000000A0").as_std_path().exists());
    }

    #[test]
    fn no_open_segment_with_nonzero_offset_and_no_partial_file_is_rejected() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let mut writer = SegmentWriter::new(log, TimelineId(1), 16 * 1024 * 1024);
        let err = writer.feed(Lsn(4096), b"data").unwrap_err();
        assert!(matches!(err, StreamingError::UnexpectedWalOffset { offset: 4096 }));
    }

    #[test]
    fn resumes_an_existing_partial_segment_across_restart() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let segment_size = 16 * 1024 * 1024u64;
        {
            let mut writer = SegmentWriter::new(log.clone(), TimelineId(1), segment_size);
            writer.feed(Lsn(0), &vec![1u8; 4096]).unwrap();
        }
        let mut writer = SegmentWriter::new(log.clone(), TimelineId(1), segment_size);
        writer.feed(Lsn(4096), &vec![2u8; 4096]).unwrap();
        let partial = log.partial_segment_path("000000010000000000000000");
        let data = fs::read(partial.as_std_path()).unwrap();
        assert_eq!(data.len(), 8192);
        assert!(data[..4096].iter().all(|&b| b == 1));
        assert!(data[4096..].iter().all(|&b| b == 2));
    }

    #[test]
    fn decode_xlog_data_extracts_position_and_payload() {
        use bytes::BufMut;
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0xA0000000);
        buf.put_u64(0xA0000010);
        buf.put_i64(123456);
        buf.extend_from_slice(b"payload");
        let (lsn, send_time, payload) = decode_xlog_data(buf.freeze()).unwrap();
        assert_eq!(lsn, Lsn(0xA0000000));
        assert_eq!(send_time, 123456);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn decode_keepalive_extracts_reply_flag() {
        use bytes::BufMut;
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0xA0000000);
        buf.put_i64(1);
        buf.put_u8(1);
        let (lsn, _t, reply) = decode_keepalive(buf.freeze()).unwrap();
        assert_eq!(lsn, Lsn(0xA0000000));
        assert!(reply);
    }

    #[test]
    fn constructor_rejects_status_timeout_below_ten_seconds() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let err = WalStreamer::new(
            log,
            "host=localhost".to_string(),
            16 * 1024 * 1024,
            Duration::from_secs(5),
            Duration::from_secs(1),
            StopToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StreamingError::StatusTimeoutTooLow(_)));
    }
}
