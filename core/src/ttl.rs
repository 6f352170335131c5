//! Expiration envelopes and clocks.
//!
//! Every stored value carries a big-endian suffix of `W` bytes (4 or 8):
//!
//! ```text
//! plain / data:   payload | expire_at
//! meta:           payload | version (8) | expire_at
//! merge operand:  operand | written_at
//! ```
//!
//! Times are seconds since the Unix epoch. An `expire_at` of 0 never expires.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Source of the current time in epoch seconds.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self { now: AtomicU64::new(now) }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn is_expired(expire_at: u64, now: u64) -> bool {
    expire_at != 0 && now >= expire_at
}

/// Earliest of two expirations, where 0 means never.
pub fn earliest(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, x) | (x, 0) => x,
        (a, b) => a.min(b),
    }
}

/// Remaining lifetime of a live record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyTtl {
    NoTtl,
    Remaining(u64),
}

impl KeyTtl {
    pub(crate) fn from_expire_at(expire_at: u64, now: u64) -> Self {
        if expire_at == 0 {
            KeyTtl::NoTtl
        } else {
            KeyTtl::Remaining(expire_at.saturating_sub(now))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtlWidth {
    Four,
    Eight,
}

impl TtlWidth {
    pub fn from_bytes(bytes: usize) -> Result<Self> {
        match bytes {
            4 => Ok(TtlWidth::Four),
            8 => Ok(TtlWidth::Eight),
            n => Err(Error::invalid(format!("ttl_bytes must be 4 or 8, got {}", n))),
        }
    }

    pub fn len(self) -> usize {
        match self {
            TtlWidth::Four => 4,
            TtlWidth::Eight => 8,
        }
    }

    fn max(self) -> u64 {
        match self {
            TtlWidth::Four => u32::MAX as u64,
            TtlWidth::Eight => u64::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaValue<'a> {
    pub payload: &'a [u8],
    pub version: u64,
    pub expire_at: u64,
}

/// Encodes and decodes the envelope for one configured width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueCodec {
    width: TtlWidth,
}

impl ValueCodec {
    pub fn new(width: TtlWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> TtlWidth {
        self.width
    }

    /// Expiration for a record written at `now` with `ttl` seconds to live.
    pub fn expire_at_for(&self, ttl: u32, now: u64) -> Result<u64> {
        if ttl == 0 {
            return Ok(0);
        }
        let expire_at = now
            .checked_add(ttl as u64)
            .ok_or_else(|| Error::invalid("expiration overflows u64"))?;
        self.check(expire_at)?;
        Ok(expire_at)
    }

    fn check(&self, time: u64) -> Result<()> {
        if time > self.width.max() {
            return Err(Error::invalid(format!(
                "time {} does not fit a {}-byte envelope",
                time,
                self.width.len()
            )));
        }
        Ok(())
    }

    fn push_time(&self, out: &mut Vec<u8>, time: u64) {
        match self.width {
            TtlWidth::Four => out.extend_from_slice(&(time as u32).to_be_bytes()),
            TtlWidth::Eight => out.extend_from_slice(&time.to_be_bytes()),
        }
    }

    fn split_time<'a>(&self, value: &'a [u8], what: &str) -> Result<(&'a [u8], u64)> {
        let w = self.width.len();
        if value.len() < w {
            return Err(Error::corruption(format!(
                "{} of {} bytes is shorter than its {}-byte envelope",
                what,
                value.len(),
                w
            )));
        }
        let (payload, tail) = value.split_at(value.len() - w);
        let time = tail.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64);
        Ok((payload, time))
    }

    pub fn stamp(&self, payload: &[u8], expire_at: u64) -> Result<Vec<u8>> {
        self.check(expire_at)?;
        let mut out = Vec::with_capacity(payload.len() + self.width.len());
        out.extend_from_slice(payload);
        self.push_time(&mut out, expire_at);
        Ok(out)
    }

    /// Stamp `value` to expire `ttl` seconds after `now`; 0 never expires.
    pub fn stamp_ttl(&self, value: &[u8], ttl: u32, now: u64) -> Result<Vec<u8>> {
        self.stamp(value, self.expire_at_for(ttl, now)?)
    }

    /// Split a stored value into its payload and `expire_at`.
    pub fn decode<'a>(&self, value: &'a [u8]) -> Result<(&'a [u8], u64)> {
        self.split_time(value, "value")
    }

    /// Payload and whether the record has expired at `now`.
    pub fn read_ttl<'a>(&self, value: &'a [u8], now: u64) -> Result<(&'a [u8], bool)> {
        let (payload, expire_at) = self.decode(value)?;
        Ok((payload, is_expired(expire_at, now)))
    }

    pub fn stamp_meta(&self, payload: &[u8], version: u64, expire_at: u64) -> Result<Vec<u8>> {
        self.check(expire_at)?;
        let mut out = Vec::with_capacity(payload.len() + 8 + self.width.len());
        out.extend_from_slice(payload);
        out.extend_from_slice(&version.to_be_bytes());
        self.push_time(&mut out, expire_at);
        Ok(out)
    }

    pub fn decode_meta<'a>(&self, value: &'a [u8]) -> Result<MetaValue<'a>> {
        let (rest, expire_at) = self.split_time(value, "meta value")?;
        if rest.len() < 8 {
            return Err(Error::corruption(format!(
                "meta value of {} bytes has no room for a version",
                value.len()
            )));
        }
        let (payload, version) = rest.split_at(rest.len() - 8);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(version);
        Ok(MetaValue {
            payload,
            version: u64::from_be_bytes(buf),
            expire_at,
        })
    }

    pub fn stamp_operand(&self, operand: &[u8], written_at: u64) -> Result<Vec<u8>> {
        self.check(written_at)?;
        let mut out = Vec::with_capacity(operand.len() + self.width.len());
        out.extend_from_slice(operand);
        self.push_time(&mut out, written_at);
        Ok(out)
    }

    pub fn decode_operand<'a>(&self, value: &'a [u8]) -> Result<(&'a [u8], u64)> {
        self.split_time(value, "merge operand")
    }
}
