//! The parser context: the single stateful object threaded through a parse.
//!
//! Mirrors `targets_ctx_t` in the original C sources (the `read`/`peek`
//! callbacks, `sigs[CONFIG_UPTANE_TARGETS_MAX_SIGS]`, `in_signed`),
//! generalized the way a `Verifier` threads configuration (trusted keys,
//! threshold) and accumulated verification state through a verify pass.
//!
//! `MAX_SIGS` bounds both the number of configured trusted keys and the
//! number of incoming `signatures` array entries the driver will look at —
//! the same conflation the C original makes with its single `sigs` array,
//! kept here deliberately rather than introducing a second const generic
//! with no corresponding requirement in the data model (spec's "per-key
//! slots: for each i < K" and "MAX_SIGS — cap on signatures accepted from
//! the array" describe the same array from two angles).

use std::array;

use crate::crypto::{Crypto, KeyId, TrustedKey};
use crate::error::Error;
use crate::source::{ByteSource, TeeingSource};
use crate::time::CalendarTime;

/// Tagged result of a single `process_targets` run. Three success variants,
/// one partial-success variant (`NoHash`), and the rest are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Matching image present, digest present, `version > v_prev`.
    Update,
    /// Matching image present, digest present, `version == v_prev`.
    NoUpdate,
    /// No target in the manifest matched this ECU/hardware identity.
    NoImage,
    /// A matching target was found but carried no `sha512` hash.
    NoHash,
    /// The byte source's `read`/`peek` failed.
    ReadErr,
    /// The bytes read did not conform to the grammar.
    JsonErr,
    /// `_type` was not `"Targets"`.
    WrongType,
    /// `now > expires`.
    Expired,
    /// `version < v_prev`.
    Downgrade,
    /// Fewer than the threshold number of signatures verified.
    SigFail,
    /// Two distinct targets both claimed this ECU.
    EcuDuplicate,
    /// A verification context could not be allocated.
    NoMem,
}

/// Per-parse state: configuration inputs, streaming flags, per-key slots,
/// and outputs, all in one object.
pub struct TargetsContext<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize>
where
    X: Crypto,
{
    pub(crate) src: TeeingSource<S, X::Ctx>,
    pub(crate) crypto: X,

    /// Trusted keys, `keys[0..K)` with the rest `None`. Indexed by
    /// configured key position, not by incoming signature array position.
    pub(crate) keys: [Option<(KeyId, TrustedKey)>; MAX_SIGS],
    pub(crate) threshold: usize,

    pub(crate) now: CalendarTime,
    pub(crate) v_prev: u32,

    pub(crate) ecu_id: [u8; BUF_SIZE],
    pub(crate) ecu_id_len: usize,
    pub(crate) hw_id: [u8; BUF_SIZE],
    pub(crate) hw_id_len: usize,

    /// Per-key slots: raw signature length (buffer itself is scratch, held
    /// locally during parsing), usability, and the live verification context.
    pub(crate) sig_usable: [bool; MAX_SIGS],
    pub(crate) verify_ctx: [Option<X::Ctx>; MAX_SIGS],

    /// Outputs, valid only once `process_targets` returns a success variant.
    pub(crate) length: u32,
    pub(crate) sha512_hash: [u8; 64],
    pub(crate) version: u32,
}

impl<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize> TargetsContext<S, X, MAX_SIGS, BUF_SIZE>
where
    S: ByteSource,
    X: Crypto,
{
    /// Builds a fresh context. `keys` is the trusted key table (`None` for
    /// unused slots); `threshold` must be in `[1, K]` where `K` is the
    /// number of `Some` entries in `keys`.
    pub fn new(
        source: S,
        crypto: X,
        keys: [Option<(KeyId, TrustedKey)>; MAX_SIGS],
        threshold: usize,
        now: CalendarTime,
        ecu_id: &[u8],
        hw_id: &[u8],
        v_prev: u32,
    ) -> Result<Self, Error> {
        if ecu_id.len() > BUF_SIZE || hw_id.len() > BUF_SIZE {
            return Err(Error::Config(format!(
                "ecu/hardware identifier exceeds BUF_SIZE ({})",
                BUF_SIZE
            )));
        }
        let key_count = keys.iter().filter(|k| k.is_some()).count();
        if threshold == 0 || threshold > key_count {
            return Err(Error::Config(format!(
                "threshold {} out of range for {} configured keys",
                threshold, key_count
            )));
        }

        let mut ecu_buf = [0u8; BUF_SIZE];
        ecu_buf[..ecu_id.len()].copy_from_slice(ecu_id);
        let mut hw_buf = [0u8; BUF_SIZE];
        hw_buf[..hw_id.len()].copy_from_slice(hw_id);

        Ok(TargetsContext {
            src: TeeingSource::new(source),
            crypto,
            keys,
            threshold,
            now,
            v_prev,
            ecu_id: ecu_buf,
            ecu_id_len: ecu_id.len(),
            hw_id: hw_buf,
            hw_id_len: hw_id.len(),
            sig_usable: [false; MAX_SIGS],
            verify_ctx: array::from_fn(|_| None),
            length: 0,
            sha512_hash: [0u8; 64],
            version: 0,
        })
    }

    /// Image length extracted from the matching target. Valid only after a
    /// success result (`Update`, `NoUpdate`, or `NoHash`).
    pub fn length(&self) -> u32 {
        self.length
    }

    /// SHA-512 digest of the matching target's image. Valid only after
    /// `Update` or `NoUpdate`.
    pub fn sha512(&self) -> &[u8; 64] {
        &self.sha512_hash
    }

    /// Manifest version. Valid only after a success result.
    pub fn version(&self) -> u32 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RingCrypto;
    use crate::source::SliceSource;

    fn ctx_with(keys: [Option<(KeyId, TrustedKey)>; 2], threshold: usize) -> Result<TargetsContext<SliceSource<'static>, RingCrypto, 2, 16>, Error> {
        TargetsContext::new(
            SliceSource::new(b""),
            RingCrypto::new(),
            keys,
            threshold,
            CalendarTime::new(2024, 1, 1, 0, 0, 0),
            b"ecu1",
            b"hw1",
            0,
        )
    }

    #[test]
    fn rejects_threshold_above_key_count() {
        let keys = [Some(([1u8; 32], TrustedKey::Ed25519([0u8; 32]))), None];
        assert!(ctx_with(keys, 2).is_err());
    }

    #[test]
    fn rejects_zero_threshold() {
        let keys = [Some(([1u8; 32], TrustedKey::Ed25519([0u8; 32]))), None];
        assert!(ctx_with(keys, 0).is_err());
    }

    #[test]
    fn accepts_threshold_within_range() {
        let keys = [
            Some(([1u8; 32], TrustedKey::Ed25519([0u8; 32]))),
            Some(([2u8; 32], TrustedKey::Ed25519([0u8; 32]))),
        ];
        assert!(ctx_with(keys, 1).is_ok());
    }

    #[test]
    fn rejects_oversized_identifiers() {
        let keys = [Some(([1u8; 32], TrustedKey::Ed25519([0u8; 32]))), None];
        let result = TargetsContext::<SliceSource<'static>, RingCrypto, 2, 2>::new(
            SliceSource::new(b""),
            RingCrypto::new(),
            keys,
            1,
            CalendarTime::new(2024, 1, 1, 0, 0, 0),
            b"toolong",
            b"hw",
            0,
        );
        assert!(result.is_err());
    }
}
