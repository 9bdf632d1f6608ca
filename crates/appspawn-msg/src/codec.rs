//! Binary encoding of spawn messages
//!
//! Layout (little-endian): a 20-byte header `{magic, version, msg_type,
//! msg_len, msg_id}`, the length-prefixed process name, `uid`, `gid`, `token`,
//! then TLV records `{tag u32, len u32, payload}` up to `msg_len` exactly.

use thiserror::Error;

use crate::flags::FlagBitmap;
use crate::message::{MsgType, SpawnMessage};
use crate::tlv::{DacInfo, DomainInfo, TlvRecord, tag};

pub const MAGIC: u32 = 0xEF20_1234;
pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 20;
pub const RECORD_HEADER_LEN: usize = 8;
pub const MAX_MSG_LEN: usize = 64 * 1024;
pub const MAX_RECORD_LEN: usize = 32 * 1024;
pub const MAX_RECORDS: usize = 128;
pub const MAX_NAME_LEN: usize = 256;

/// Offset of `msg_len` inside the header
pub const MSG_LEN_OFFSET: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated message: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("{what} of {len} bytes exceeds limit {limit}")]
    Oversized {
        what: &'static str,
        len: usize,
        limit: usize,
    },

    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    #[error("malformed {tag} record: {reason}")]
    Malformed { tag: &'static str, reason: String },

    #[error("more than {0} records")]
    TooManyRecords(usize),

    #[error("declared length {declared} does not match decoded length {decoded}")]
    LengthMismatch { declared: usize, decoded: usize },

    #[error("{what} {name:?} is not a single path component")]
    InvalidName { what: &'static str, name: String },
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self, what: &'static str, limit: usize) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        if len > limit {
            return Err(DecodeError::Oversized { what, len, limit });
        }
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Malformed {
            tag: what,
            reason: "invalid utf-8".to_string(),
        })
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Decode one message from the front of `buf`.
///
/// Returns the message and the number of bytes it occupied (`msg_len`);
/// bytes past that are left for the caller.
pub fn decode(buf: &[u8]) -> Result<(SpawnMessage, usize), DecodeError> {
    let mut header = Reader::new(buf);
    header.take(HEADER_LEN)?;
    header.pos = 0;

    let magic = header.u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = header.u32()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let raw_type = header.u32()?;
    let msg_type = MsgType::from_u32(raw_type).ok_or(DecodeError::UnknownMessageType(raw_type))?;
    let msg_len = header.u32()? as usize;
    let msg_id = header.u32()?;

    if msg_len > MAX_MSG_LEN {
        return Err(DecodeError::Oversized {
            what: "message",
            len: msg_len,
            limit: MAX_MSG_LEN,
        });
    }
    if msg_len < HEADER_LEN {
        return Err(DecodeError::LengthMismatch {
            declared: msg_len,
            decoded: HEADER_LEN,
        });
    }
    if msg_len > buf.len() {
        return Err(DecodeError::Truncated {
            offset: 0,
            needed: msg_len,
            available: buf.len(),
        });
    }

    let mut body = Reader::new(&buf[..msg_len]);
    body.pos = HEADER_LEN;

    let process_name = body.string("process name", MAX_NAME_LEN)?;
    let uid = body.u32()?;
    let gid = body.u32()?;
    let token = body.u64()?;

    let mut records = Vec::new();
    let mut seen = 0usize;
    while body.remaining() > 0 {
        seen += 1;
        if seen > MAX_RECORDS {
            return Err(DecodeError::TooManyRecords(MAX_RECORDS));
        }
        let record_tag = body.u32()?;
        let len = body.u32()? as usize;
        if len > MAX_RECORD_LEN {
            return Err(DecodeError::Oversized {
                what: "record",
                len,
                limit: MAX_RECORD_LEN,
            });
        }
        let payload = body.take(len)?;
        match decode_record(record_tag, payload)? {
            Some(record) => records.push(record),
            None => log::debug!("skipping unknown record tag {} ({} bytes)", record_tag, len),
        }
    }

    let msg = SpawnMessage {
        msg_type,
        msg_id,
        process_name,
        uid,
        gid,
        token,
        records,
    };
    msg.validate_names()?;
    Ok((msg, msg_len))
}

fn decode_record(record_tag: u32, payload: &[u8]) -> Result<Option<TlvRecord>, DecodeError> {
    let name = match record_tag {
        tag::BUNDLE_INFO => "bundle-info",
        tag::MSG_FLAGS => "msg-flags",
        tag::DAC_INFO => "dac-info",
        tag::DOMAIN_INFO => "domain-info",
        tag::OWNER_INFO => "owner-info",
        tag::PERMISSION => "permission",
        tag::INTERNET_INFO => "internet-info",
        tag::TERMINATION_INFO => "termination-info",
        tag::FD_LIST => "fd-list",
        tag::EXTENSION => "extension",
        _ => return Ok(None),
    };

    let mut r = Reader::new(payload);
    let record = parse_payload(record_tag, &mut r).map_err(|err| match err {
        DecodeError::Truncated { .. } => DecodeError::Malformed {
            tag: name,
            reason: "payload shorter than its fields".to_string(),
        },
        other => other,
    })?;
    if r.remaining() != 0 {
        return Err(DecodeError::Malformed {
            tag: name,
            reason: format!("{} trailing bytes", r.remaining()),
        });
    }
    Ok(Some(record))
}

fn parse_payload(record_tag: u32, r: &mut Reader<'_>) -> Result<TlvRecord, DecodeError> {
    let record = match record_tag {
        tag::BUNDLE_INFO => {
            let bundle_index = r.u32()?;
            let bundle_name = r.string("bundle name", MAX_NAME_LEN)?;
            TlvRecord::BundleInfo {
                bundle_index,
                bundle_name,
            }
        }
        tag::MSG_FLAGS => TlvRecord::MsgFlags(read_bitmap(r)?),
        tag::PERMISSION => TlvRecord::Permission(read_bitmap(r)?),
        tag::DAC_INFO => {
            let count = r.u32()? as usize;
            let mut gids = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                gids.push(r.u32()?);
            }
            let user_name = r.string("user name", MAX_NAME_LEN)?;
            TlvRecord::DacInfo(DacInfo { gids, user_name })
        }
        tag::DOMAIN_INFO => {
            let hap_flags = r.u32()?;
            let apl = r.string("apl", MAX_NAME_LEN)?;
            TlvRecord::DomainInfo(DomainInfo { hap_flags, apl })
        }
        tag::OWNER_INFO => TlvRecord::OwnerInfo(r.string("owner id", MAX_NAME_LEN)?),
        tag::INTERNET_INFO => {
            let set_allow = r.u8()? != 0;
            let allow = r.u8()? != 0;
            TlvRecord::InternetInfo { set_allow, allow }
        }
        tag::TERMINATION_INFO => TlvRecord::TerminationInfo { pid: r.i32()? },
        tag::FD_LIST => {
            let count = r.u32()? as usize;
            let mut fds = Vec::with_capacity(count.min(64));
            for _ in 0..count {
                fds.push(r.i32()?);
            }
            TlvRecord::FdList(fds)
        }
        _ => {
            let name = r.string("extension name", MAX_NAME_LEN)?;
            let value = r.rest().to_vec();
            TlvRecord::Extension { name, value }
        }
    };
    Ok(record)
}

fn read_bitmap(r: &mut Reader<'_>) -> Result<FlagBitmap, DecodeError> {
    let count = r.u32()? as usize;
    let mut words = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        words.push(r.u32()?);
    }
    Ok(FlagBitmap::from_words(words))
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

fn put_bitmap(out: &mut Vec<u8>, bitmap: &FlagBitmap) {
    put_u32(out, bitmap.words().len() as u32);
    for word in bitmap.words() {
        put_u32(out, *word);
    }
}

/// Encode the payload of a single record (without its TLV header)
pub fn encode_record(record: &TlvRecord) -> Vec<u8> {
    let mut out = Vec::new();
    match record {
        TlvRecord::BundleInfo {
            bundle_index,
            bundle_name,
        } => {
            put_u32(&mut out, *bundle_index);
            put_str(&mut out, bundle_name);
        }
        TlvRecord::MsgFlags(bitmap) | TlvRecord::Permission(bitmap) => put_bitmap(&mut out, bitmap),
        TlvRecord::DacInfo(info) => {
            put_u32(&mut out, info.gids.len() as u32);
            for gid in &info.gids {
                put_u32(&mut out, *gid);
            }
            put_str(&mut out, &info.user_name);
        }
        TlvRecord::DomainInfo(info) => {
            put_u32(&mut out, info.hap_flags);
            put_str(&mut out, &info.apl);
        }
        TlvRecord::OwnerInfo(owner) => put_str(&mut out, owner),
        TlvRecord::InternetInfo { set_allow, allow } => {
            out.push(u8::from(*set_allow));
            out.push(u8::from(*allow));
        }
        TlvRecord::TerminationInfo { pid } => put_u32(&mut out, *pid as u32),
        TlvRecord::FdList(fds) => {
            put_u32(&mut out, fds.len() as u32);
            for fd in fds {
                put_u32(&mut out, *fd as u32);
            }
        }
        TlvRecord::Extension { name, value } => {
            put_str(&mut out, name);
            out.extend_from_slice(value);
        }
    }
    out
}

/// Append one raw TLV record to `out`
pub fn push_raw_record(out: &mut Vec<u8>, record_tag: u32, payload: &[u8]) {
    put_u32(out, record_tag);
    put_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

/// Encode a message; `msg_len` in the header is filled in from the result
pub fn encode(msg: &SpawnMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64);
    put_u32(&mut out, MAGIC);
    put_u32(&mut out, PROTOCOL_VERSION);
    put_u32(&mut out, msg.msg_type.as_u32());
    put_u32(&mut out, 0);
    put_u32(&mut out, msg.msg_id);

    put_str(&mut out, &msg.process_name);
    put_u32(&mut out, msg.uid);
    put_u32(&mut out, msg.gid);
    out.extend_from_slice(&msg.token.to_le_bytes());

    for record in &msg.records {
        let payload = encode_record(record);
        push_raw_record(&mut out, record.tag(), &payload);
    }

    set_msg_len(&mut out);
    out
}

/// Rewrite the header's `msg_len` to the buffer's current length
pub fn set_msg_len(buf: &mut [u8]) {
    let len = buf.len() as u32;
    if buf.len() >= HEADER_LEN {
        buf[MSG_LEN_OFFSET..MSG_LEN_OFFSET + 4].copy_from_slice(&len.to_le_bytes());
    }
}

/// Declared `msg_len` of a buffer holding at least a full header
pub fn peek_msg_len(buf: &[u8]) -> Option<usize> {
    let raw = buf.get(MSG_LEN_OFFSET..MSG_LEN_OFFSET + 4)?;
    let mut word = [0u8; 4];
    word.copy_from_slice(raw);
    Some(u32::from_le_bytes(word) as usize)
}
