//! Compaction-time reclamation of expired and orphaned records.
//!
//! [`decide`] is a pure function over one record. [`ExpirationFilterFactory`]
//! adapts it to the engine's compaction hooks, resolving meta keys through
//! the compaction's snapshot view.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::keys::{KeyKind, KeyLayout};
use crate::lsm::{CompactionContext, CompactionFilter, CompactionFilterFactory, FilterDecision};
use crate::options::KeyValueFilter;
use crate::ttl::{is_expired, Clock, ValueCodec};
use crate::version::MetaState;

/// Decide the fate of one record at time `now`.
///
/// `in_scope` tells whether a physical key lies in the compaction range and
/// `meta_lookup` resolves a meta key as of the compaction's snapshot. A data
/// key is in scope when either it or its meta key is. Records that cannot be
/// decoded, and data keys whose meta cannot be read, are kept.
pub fn decide(
    layout: &KeyLayout,
    codec: &ValueCodec,
    key: &[u8],
    value: &[u8],
    now: u64,
    in_scope: &dyn Fn(&[u8]) -> bool,
    meta_lookup: &mut dyn FnMut(&[u8]) -> Result<MetaState>,
) -> FilterDecision {
    let kind = layout.classify(key);

    let scoped = match &kind {
        KeyKind::Data(data) => in_scope(key) || in_scope(&layout.meta_key_of(data)),
        _ => in_scope(key),
    };
    if !scoped {
        return FilterDecision::Keep;
    }

    let expire_at = match kind {
        KeyKind::Meta { .. } => codec.decode_meta(value).map(|m| m.expire_at),
        _ => codec.decode(value).map(|(_, e)| e),
    };
    let expire_at = match expire_at {
        Ok(e) => e,
        Err(e) => {
            warn!(key = ?String::from_utf8_lossy(key), error = %e, "keeping undecodable record");
            return FilterDecision::Keep;
        }
    };
    if is_expired(expire_at, now) {
        return FilterDecision::Drop;
    }

    let KeyKind::Data(data) = kind else {
        return FilterDecision::Keep;
    };
    let meta_key = layout.meta_key_of(&data);
    match meta_lookup(&meta_key) {
        // Versions only move forward and every compacted record predates the
        // snapshot, so any mismatch with the meta is an orphan.
        Ok(MetaState::Live { version, .. }) if version != data.version => FilterDecision::Drop,
        Ok(MetaState::Expired { .. }) => FilterDecision::Drop,
        Ok(_) => FilterDecision::Keep,
        Err(e) => {
            warn!(
                key = ?String::from_utf8_lossy(&meta_key),
                error = %e,
                "meta lookup failed, keeping data key"
            );
            FilterDecision::Keep
        }
    }
}

pub struct ExpirationFilterFactory {
    layout: KeyLayout,
    codec: ValueCodec,
    clock: Arc<dyn Clock>,
    user: Option<KeyValueFilter>,
}

impl ExpirationFilterFactory {
    pub fn new(
        layout: KeyLayout,
        codec: ValueCodec,
        clock: Arc<dyn Clock>,
        user: Option<KeyValueFilter>,
    ) -> Self {
        Self {
            layout,
            codec,
            clock,
            user,
        }
    }
}

impl CompactionFilterFactory for ExpirationFilterFactory {
    fn name(&self) -> &str {
        "NemoExpirationFilter"
    }

    fn create(&self) -> Box<dyn CompactionFilter> {
        Box::new(ExpirationFilter {
            now: self.clock.now(),
            layout: self.layout,
            codec: self.codec,
            user: self.user.clone(),
            last_meta: None,
        })
    }
}

/// One compaction's filter. `now` is fixed at creation.
pub struct ExpirationFilter {
    now: u64,
    layout: KeyLayout,
    codec: ValueCodec,
    user: Option<KeyValueFilter>,
    /// Data keys of one name are contiguous, so one cached meta suffices.
    last_meta: Option<(Vec<u8>, MetaState)>,
}

impl ExpirationFilter {
    fn apply_user(&self, key: &[u8], value: &[u8]) -> FilterDecision {
        let Some(user) = &self.user else {
            return FilterDecision::Keep;
        };

        let decoded = match self.layout.classify(key) {
            KeyKind::Meta { .. } => self
                .codec
                .decode_meta(value)
                .map(|m| (m.payload, Some(m.version), m.expire_at)),
            _ => self.codec.decode(value).map(|(p, e)| (p, None, e)),
        };
        let Ok((payload, version, expire_at)) = decoded else {
            return FilterDecision::Keep;
        };

        match (user.func)(key, payload) {
            FilterDecision::Rewrite(new_payload) => {
                let restamped = match version {
                    Some(version) => self.codec.stamp_meta(&new_payload, version, expire_at),
                    None => self.codec.stamp(&new_payload, expire_at),
                };
                match restamped {
                    Ok(v) => FilterDecision::Rewrite(v),
                    Err(e) => {
                        warn!(filter = %user.name, error = %e, "ignoring rewrite");
                        FilterDecision::Keep
                    }
                }
            }
            decision => decision,
        }
    }
}

impl CompactionFilter for ExpirationFilter {
    fn filter(&mut self, ctx: &CompactionContext, key: &[u8], value: &[u8]) -> FilterDecision {
        let now = self.now;
        let codec = self.codec;
        let last_meta = &mut self.last_meta;
        let mut lookup = |meta_key: &[u8]| -> Result<MetaState> {
            if let Some((cached_key, state)) = last_meta.as_ref() {
                if cached_key.as_slice() == meta_key {
                    return Ok(*state);
                }
            }
            let state = MetaState::lookup(&ctx.view, &codec, meta_key, now)?;
            *last_meta = Some((meta_key.to_vec(), state));
            Ok(state)
        };

        let decision = decide(
            &self.layout,
            &self.codec,
            key,
            value,
            now,
            &|k| ctx.in_range(k),
            &mut lookup,
        );
        match decision {
            FilterDecision::Keep if ctx.in_range(key) => self.apply_user(key, value),
            decision => decision,
        }
    }
}
