//! Replication stream message framing
//!
//! Parses the CopyData payloads of a START_REPLICATION session (XLogData and
//! primary keepalive messages) and encodes standby status updates back to the
//! server. See the streaming replication protocol:
//! https://www.postgresql.org/docs/current/protocol-replication.html

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{TapError, TapResult};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds from the Unix epoch (1970) to the PostgreSQL epoch (2000)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// WAL location pointer
pub type XLogRecPtr = u64;

/// Microseconds since the PostgreSQL epoch
pub type PgTimestamp = i64;

/// XLogData ('w'): a section of the WAL stream with its starting position
pub struct XLogDataMessage {
    pub data_start: XLogRecPtr,
    pub wal_end: XLogRecPtr,
    pub send_time: PgTimestamp,
    pub data: Vec<u8>,
}

/// Primary keepalive ('k'): server heartbeat, possibly demanding a reply
pub struct KeepaliveMessage {
    pub wal_end: XLogRecPtr,
    pub send_time: PgTimestamp,
    pub reply_requested: bool,
}

/// One CopyData payload received from the replication stream
pub enum StreamMessage {
    XLogData(XLogDataMessage),
    Keepalive(KeepaliveMessage),
}

impl StreamMessage {
    /// Decode a raw CopyData payload into a stream message
    pub fn parse(data: &[u8]) -> TapResult<Self> {
        if data.is_empty() {
            return Err(TapError::protocol("Empty replication message"));
        }
        match data[0] as char {
            'w' => Ok(StreamMessage::XLogData(XLogDataMessage::try_from(data)?)),
            'k' => Ok(StreamMessage::Keepalive(KeepaliveMessage::try_from(data)?)),
            other => Err(TapError::protocol(format!(
                "Unknown replication message type: {}",
                other
            ))),
        }
    }
}

impl TryFrom<&[u8]> for XLogDataMessage {
    type Error = TapError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        // 'w' + 8 bytes start + 8 bytes end + 8 bytes clock
        if data.len() < 25 {
            return Err(TapError::protocol("WAL message too short"));
        }

        let mut reader = BufferReader::new(data);
        let _message_type = reader.read_char()?;
        let data_start = reader.read_u64()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let data = reader.read_bytes(reader.remaining())?;

        Ok(XLogDataMessage {
            data_start,
            wal_end,
            send_time,
            data,
        })
    }
}

impl TryFrom<&[u8]> for KeepaliveMessage {
    type Error = TapError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        // 'k' + 8 bytes LSN + 8 bytes clock + 1 byte reply flag
        if data.len() < 18 {
            return Err(TapError::protocol("Keepalive message too short"));
        }

        let mut reader = BufferReader::new(data);
        let _message_type = reader.read_char()?;
        let wal_end = reader.read_u64()?;
        let send_time = reader.read_i64()?;
        let reply_requested = reader.read_u8()? != 0;

        Ok(KeepaliveMessage {
            wal_end,
            send_time,
            reply_requested,
        })
    }
}

/// Standby status update ('r'): confirms written/flushed/applied positions
pub struct StandbyStatusUpdate {
    pub write_lsn: XLogRecPtr,
    pub flush_lsn: XLogRecPtr,
    pub apply_lsn: XLogRecPtr,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    /// Encode into the 34-byte wire form with the current client clock
    pub fn encode(&self) -> TapResult<[u8; 34]> {
        let mut raw = [0u8; 34];
        let written = {
            let mut writer = BufferWriter::new(&mut raw);
            writer.write_u8(b'r')?;
            writer.write_u64(self.write_lsn)?;
            writer.write_u64(self.flush_lsn)?;
            writer.write_u64(self.apply_lsn)?;
            writer.write_i64(system_time_to_pg_timestamp(SystemTime::now()))?;
            writer.write_u8(if self.reply_requested { 1 } else { 0 })?;
            writer.bytes_written()
        };
        if written != raw.len() {
            return Err(TapError::protocol("Failed to encode standby status update"));
        }
        Ok(raw)
    }
}

/// Convert SystemTime to microseconds since the PostgreSQL epoch
pub fn system_time_to_pg_timestamp(time: SystemTime) -> PgTimestamp {
    let duration_since_unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let unix_micros = duration_since_unix.as_secs() as i64 * 1_000_000
        + duration_since_unix.subsec_micros() as i64;

    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xlogdata_frame(start: u64, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![b'w'];
        frame.extend_from_slice(&start.to_be_bytes());
        frame.extend_from_slice(&start.to_be_bytes());
        frame.extend_from_slice(&0i64.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn parses_xlogdata() {
        let frame = xlogdata_frame(0x1_0000_0002, b"{\"change\":[]}");
        match StreamMessage::parse(&frame).unwrap() {
            StreamMessage::XLogData(w) => {
                assert_eq!(w.data_start, 0x1_0000_0002);
                assert_eq!(w.data, b"{\"change\":[]}");
            }
            _ => panic!("expected XLogData"),
        }
    }

    #[test]
    fn parses_keepalive_reply_flag() {
        let mut frame = vec![b'k'];
        frame.extend_from_slice(&42u64.to_be_bytes());
        frame.extend_from_slice(&0i64.to_be_bytes());
        frame.push(1);
        match StreamMessage::parse(&frame).unwrap() {
            StreamMessage::Keepalive(k) => {
                assert_eq!(k.wal_end, 42);
                assert!(k.reply_requested);
            }
            _ => panic!("expected keepalive"),
        }
    }

    #[test]
    fn rejects_unknown_discriminator() {
        assert!(StreamMessage::parse(b"x123").is_err());
        assert!(StreamMessage::parse(b"").is_err());
    }

    #[test]
    fn status_update_encodes_34_bytes() {
        let update = StandbyStatusUpdate {
            write_lsn: 7,
            flush_lsn: 7,
            apply_lsn: 7,
            reply_requested: true,
        };
        let raw = update.encode().unwrap();
        assert_eq!(raw[0], b'r');
        assert_eq!(u64::from_be_bytes(raw[1..9].try_into().unwrap()), 7);
        assert_eq!(raw[33], 1);
    }
}
