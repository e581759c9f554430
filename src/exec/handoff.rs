// src/exec/handoff.rs

//! The single message a host writes to a helper over its pipe.
//!
//! Framing: a 4-byte little-endian payload length, then the payload. The
//! payload is a `u32` field count followed by typed fields:
//!
//! | tag | value                                        |
//! |-----|----------------------------------------------|
//! | 0   | null                                         |
//! | 1   | `i64`                                        |
//! | 2   | string: `u32` byte length + UTF-8            |
//! | 3   | string array: `u32` count + strings          |
//!
//! Integers are little-endian. Field order is fixed (see [`HandoffMessage`]).

use std::path::PathBuf;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::{LaunchFlags, SourceUnitId};

/// Upper bound for a payload, checked before allocating.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

const FIELD_COUNT: u32 = 9;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_STR: u8 = 2;
const TAG_STR_ARRAY: u8 = 3;

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("message truncated")]
    Truncated,

    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: u32, got: u32 },

    #[error("field '{field}' has unexpected type tag {tag}")]
    UnexpectedTag { field: &'static str, tag: u8 },

    #[error("field '{0}' is out of range")]
    OutOfRange(&'static str),

    #[error("field '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),

    #[error("message of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("pipe I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Run parameters handed to a helper, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffMessage {
    pub artifact_name: String,
    pub artifact_path: PathBuf,
    pub flags: LaunchFlags,
    pub args: Vec<String>,
    /// Pipe the task should write its result to, if the caller wants one.
    pub result_pipe: Option<String>,
    pub workspace_root: PathBuf,
    pub unit: SourceUnitId,
    pub caller_pid: u32,
    /// Caller notification channel id; `0` when there is none.
    pub caller_channel: u64,
}

impl HandoffMessage {
    /// Encode as a framed message (length prefix included).
    pub fn encode(&self) -> Result<Vec<u8>, HandoffError> {
        let mut payload = Vec::with_capacity(256);
        payload.extend_from_slice(&FIELD_COUNT.to_le_bytes());

        put_str(&mut payload, &self.artifact_name);
        put_str(&mut payload, path_str(&self.artifact_path)?);
        put_int(&mut payload, i64::from(self.flags.bits()));
        put_str_array(&mut payload, &self.args);
        match &self.result_pipe {
            Some(pipe) => put_str(&mut payload, pipe),
            None => payload.push(TAG_NULL),
        }
        put_str(&mut payload, path_str(&self.workspace_root)?);
        put_int(&mut payload, i64::from(self.unit.get()));
        put_int(&mut payload, i64::from(self.caller_pid));
        put_int(
            &mut payload,
            i64::try_from(self.caller_channel).map_err(|_| HandoffError::OutOfRange("caller_channel"))?,
        );

        if payload.len() > MAX_MESSAGE_LEN {
            return Err(HandoffError::TooLarge(payload.len()));
        }

        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a payload (without the length prefix).
    pub fn decode(payload: &[u8]) -> Result<Self, HandoffError> {
        let mut r = Reader { buf: payload };

        let count = r.u32()?;
        if count != FIELD_COUNT {
            return Err(HandoffError::FieldCount {
                expected: FIELD_COUNT,
                got: count,
            });
        }

        let artifact_name = r.str_field("artifact_name")?;
        let artifact_path = PathBuf::from(r.str_field("artifact_path")?);
        let flags = u32::try_from(r.int_field("flags")?)
            .ok()
            .and_then(LaunchFlags::from_bits)
            .ok_or(HandoffError::OutOfRange("flags"))?;
        let args = r.str_array_field("args")?;
        let result_pipe = r.opt_str_field("result_pipe")?;
        let workspace_root = PathBuf::from(r.str_field("workspace_root")?);
        let unit = u32::try_from(r.int_field("unit")?)
            .map(SourceUnitId)
            .map_err(|_| HandoffError::OutOfRange("unit"))?;
        let caller_pid =
            u32::try_from(r.int_field("caller_pid")?).map_err(|_| HandoffError::OutOfRange("caller_pid"))?;
        let caller_channel = u64::try_from(r.int_field("caller_channel")?)
            .map_err(|_| HandoffError::OutOfRange("caller_channel"))?;

        if !r.buf.is_empty() {
            return Err(HandoffError::TrailingBytes(r.buf.len()));
        }

        Ok(Self {
            artifact_name,
            artifact_path,
            flags,
            args,
            result_pipe,
            workspace_root,
            unit,
            caller_pid,
            caller_channel,
        })
    }

    /// Read one framed message.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, HandoffError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(HandoffError::TooLarge(len));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Self::decode(&payload)
    }
}

fn path_str(path: &std::path::Path) -> Result<&str, HandoffError> {
    path.to_str()
        .ok_or_else(|| HandoffError::NonUtf8Path(path.to_path_buf()))
}

fn put_int(out: &mut Vec<u8>, v: i64) {
    out.push(TAG_INT);
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_raw_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.push(TAG_STR);
    put_raw_str(out, s);
}

fn put_str_array(out: &mut Vec<u8>, items: &[String]) {
    out.push(TAG_STR_ARRAY);
    out.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        put_raw_str(out, item);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], HandoffError> {
        if self.buf.len() < n {
            return Err(HandoffError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, HandoffError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, HandoffError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn raw_str(&mut self, field: &'static str) -> Result<String, HandoffError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| HandoffError::InvalidUtf8(field))
    }

    fn expect_tag(&mut self, field: &'static str, expected: u8) -> Result<(), HandoffError> {
        match self.u8()? {
            tag if tag == expected => Ok(()),
            tag => Err(HandoffError::UnexpectedTag { field, tag }),
        }
    }

    fn int_field(&mut self, field: &'static str) -> Result<i64, HandoffError> {
        self.expect_tag(field, TAG_INT)?;
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(i64::from_le_bytes(arr))
    }

    fn str_field(&mut self, field: &'static str) -> Result<String, HandoffError> {
        self.expect_tag(field, TAG_STR)?;
        self.raw_str(field)
    }

    fn opt_str_field(&mut self, field: &'static str) -> Result<Option<String>, HandoffError> {
        match self.u8()? {
            TAG_NULL => Ok(None),
            TAG_STR => self.raw_str(field).map(Some),
            tag => Err(HandoffError::UnexpectedTag { field, tag }),
        }
    }

    fn str_array_field(&mut self, field: &'static str) -> Result<Vec<String>, HandoffError> {
        self.expect_tag(field, TAG_STR_ARRAY)?;
        let count = self.u32()? as usize;
        // Every element needs at least its 4-byte length.
        if count > self.buf.len() / 4 {
            return Err(HandoffError::Truncated);
        }
        (0..count).map(|_| self.raw_str(field)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> HandoffMessage {
        HandoffMessage {
            artifact_name: "hello".into(),
            artifact_path: PathBuf::from("/ws/.compiled/1.bin"),
            flags: LaunchFlags::PRELOADED | LaunchFlags::INTERACTIVE,
            args: vec!["a b".into(), String::new(), "ü".into()],
            result_pipe: None,
            workspace_root: PathBuf::from("/ws"),
            unit: SourceUnitId(1),
            caller_pid: 4242,
            caller_channel: 0,
        }
    }

    #[test]
    fn frame_starts_with_payload_length() {
        let bytes = message().encode().unwrap();
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(&bytes[4..8], &FIELD_COUNT.to_le_bytes());
        assert_eq!(HandoffMessage::decode(&bytes[4..]).unwrap(), message());
    }

    #[tokio::test]
    async fn reads_one_framed_message_from_a_stream() {
        let mut msg = message();
        msg.result_pipe = Some("result-7".into());
        let mut bytes = msg.encode().unwrap();
        bytes.extend_from_slice(b"ignored tail");

        let mut reader = &bytes[..];
        let decoded = HandoffMessage::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_and_mistyped_payloads_fail() {
        let bytes = message().encode().unwrap();
        let payload = &bytes[4..];

        assert!(matches!(
            HandoffMessage::decode(&payload[..payload.len() - 1]),
            Err(HandoffError::Truncated)
        ));

        let mut wrong = payload.to_vec();
        wrong[4] = TAG_INT;
        assert!(matches!(
            HandoffMessage::decode(&wrong),
            Err(HandoffError::UnexpectedTag { field: "artifact_name", .. })
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_reading() {
        let header = ((MAX_MESSAGE_LEN + 1) as u32).to_le_bytes();
        let mut reader = &header[..];
        assert!(matches!(
            HandoffMessage::read_from(&mut reader).await,
            Err(HandoffError::TooLarge(_))
        ));
    }
}
