//! Reply sent back for every request

use std::fmt;

use crate::codec::DecodeError;

pub const REPLY_LEN: usize = 8;

/// Negative reply values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    Unknown,
    DecodeFailed,
    SpawnFailed,
    Timeout,
    ResourceExhausted,
    NotFound,
}

impl FailureCode {
    pub fn value(self) -> i64 {
        match self {
            FailureCode::Unknown => -1,
            FailureCode::DecodeFailed => -2,
            FailureCode::SpawnFailed => -3,
            FailureCode::Timeout => -4,
            FailureCode::ResourceExhausted => -5,
            FailureCode::NotFound => -6,
        }
    }

    /// Map a raw negative value; unrecognised values read as `Unknown`
    pub fn from_value(value: i64) -> Self {
        match value {
            -2 => FailureCode::DecodeFailed,
            -3 => FailureCode::SpawnFailed,
            -4 => FailureCode::Timeout,
            -5 => FailureCode::ResourceExhausted,
            -6 => FailureCode::NotFound,
            _ => FailureCode::Unknown,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureCode::Unknown => "unknown failure",
            FailureCode::DecodeFailed => "request could not be decoded",
            FailureCode::SpawnFailed => "spawn failed",
            FailureCode::Timeout => "child did not become ready in time",
            FailureCode::ResourceExhausted => "resources exhausted",
            FailureCode::NotFound => "no such process",
        };
        f.write_str(text)
    }
}

/// A single signed 64-bit reply value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reply(pub i64);

impl Reply {
    pub fn pid(pid: i32) -> Self {
        Reply(i64::from(pid))
    }

    pub fn failure(code: FailureCode) -> Self {
        Reply(code.value())
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn failure_code(self) -> Option<FailureCode> {
        (self.0 < 0).then(|| FailureCode::from_value(self.0))
    }

    pub fn encode(self) -> [u8; REPLY_LEN] {
        self.0.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let raw = buf.get(..REPLY_LEN).ok_or(DecodeError::Truncated {
            offset: 0,
            needed: REPLY_LEN,
            available: buf.len(),
        })?;
        let mut word = [0u8; REPLY_LEN];
        word.copy_from_slice(raw);
        Ok(Reply(i64::from_le_bytes(word)))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure_code() {
            Some(code) => write!(f, "{} ({})", self.0, code),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_values_are_distinct() {
        let codes = [
            FailureCode::Unknown,
            FailureCode::DecodeFailed,
            FailureCode::SpawnFailed,
            FailureCode::Timeout,
            FailureCode::ResourceExhausted,
            FailureCode::NotFound,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(a.value() < 0);
            assert_eq!(FailureCode::from_value(a.value()), *a);
            for b in &codes[i + 1..] {
                assert_ne!(a.value(), b.value());
            }
        }
        assert_eq!(FailureCode::Unknown.value(), -1);
    }

    #[test]
    fn reply_encodes_eight_bytes() {
        let reply = Reply::failure(FailureCode::DecodeFailed);
        let bytes = reply.encode();
        assert_eq!(Reply::decode(&bytes).unwrap(), reply);
        assert_eq!(reply.failure_code(), Some(FailureCode::DecodeFailed));
        assert!(Reply::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn pid_reply_is_success() {
        let reply = Reply::pid(1234);
        assert!(reply.is_success());
        assert_eq!(reply.failure_code(), None);
        assert_eq!(reply.to_string(), "1234");
        assert!(Reply(0).is_success());
    }
}
