//! The grammar driver: a recursive-descent walk of the fixed director
//! `targets.json` shape, gating transitions on parsed values.
//!
//! Shaped after a `Verifier::verify_signed`/`verify_signatures` pair for
//! the role/expiry/threshold checks, generalized from
//! "verify an already-buffered document" into "drive a single streaming pass
//! that never buffers the document." The state machine below:
//!
//! ```text
//! START → SIGS → SIGNED_OPEN (set in_signed)
//!       → TYPE → EXPIRES → TARGETS → VERSION
//!       → SIGNED_CLOSE (clear in_signed) → VERIFY → DOC_END → FINAL
//! ```

use crate::context::{ProcessResult, TargetsContext};
use crate::crypto::{Crypto, KeyId, MAX_SIGNATURE_LEN};
use crate::lexer::{decimal_integer, fixed_literal, ignore_hex, ignore_string, iso_timestamp, quoted_hex, quoted_text, LexError};
use crate::source::ByteSource;

/// Drives `ctx` through one full parse. Consumes the byte source exactly
/// once; on any lexical or grammar failure short-circuits to the matching
/// error terminal — the verification phase is never reached in that case.
pub fn process_targets<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize>(
    ctx: &mut TargetsContext<S, X, MAX_SIGS, BUF_SIZE>,
) -> ProcessResult
where
    S: ByteSource,
    X: Crypto,
{
    match run(ctx) {
        Ok(result) => result,
        Err(LexError::Read) => ProcessResult::ReadErr,
        Err(LexError::Syntax) => ProcessResult::JsonErr,
    }
}

fn run<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize>(
    ctx: &mut TargetsContext<S, X, MAX_SIGS, BUF_SIZE>,
) -> Result<ProcessResult, LexError>
where
    S: ByteSource,
    X: Crypto,
{
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"{\"signatures\":[")?;

    let mut num_sigs = 0usize;
    let mut alloc_failed = false;
    loop {
        if num_sigs >= MAX_SIGS {
            return Err(LexError::Syntax);
        }
        if parse_signature(ctx)? {
            alloc_failed = true;
        }
        num_sigs += 1;
        if ctx.src.peek()? == b',' {
            fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",")?;
            continue;
        }
        break;
    }
    if alloc_failed {
        return Ok(ProcessResult::NoMem);
    }

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"],\"signed\":")?;
    ctx.src.enter_signed();
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"{")?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"\"_type\":")?;
    let mut type_buf = [0u8; BUF_SIZE];
    let type_len = quoted_text(&mut ctx.src, &mut ctx.verify_ctx, BUF_SIZE, Some(&mut type_buf))?;
    let is_targets = &type_buf[..type_len] == b"Targets";

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"expires\":")?;
    let expires = iso_timestamp(&mut ctx.src, &mut ctx.verify_ctx)?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"targets\":{")?;

    let mut got_image = false;
    let mut got_hash = false;
    loop {
        let matched_hash = parse_target(ctx)?;
        if let Some(has_hash) = matched_hash {
            if got_image {
                return Ok(ProcessResult::EcuDuplicate);
            }
            got_image = true;
            got_hash = has_hash;
        }
        if ctx.src.peek()? == b',' {
            fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",")?;
            continue;
        }
        break;
    }
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"version\":")?;
    let version = decimal_integer(&mut ctx.src, &mut ctx.verify_ctx)?;
    ctx.version = version;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;
    ctx.src.leave_signed();
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;

    if !is_targets {
        debug!("role check failed: _type was not \"Targets\"");
        return Ok(ProcessResult::WrongType);
    }
    if ctx.now > expires {
        debug!("expiry check failed: now is past expires");
        return Ok(ProcessResult::Expired);
    }
    if version < ctx.v_prev {
        debug!("version check failed: {} < previous {}", version, ctx.v_prev);
        return Ok(ProcessResult::Downgrade);
    }

    let mut verified = 0usize;
    let slots = std::array::from_fn::<_, MAX_SIGS, _>(|i| ctx.verify_ctx[i].take());
    for slot in slots {
        if let Some(vctx) = slot {
            if vctx.finish() {
                verified += 1;
            }
        }
    }
    trace!("signature tally: {} verified, threshold {}", verified, ctx.threshold);
    if verified < ctx.threshold {
        debug!("signature tally below threshold, rejecting manifest");
        return Ok(ProcessResult::SigFail);
    }

    if !got_image {
        return Ok(ProcessResult::NoImage);
    }
    if !got_hash {
        return Ok(ProcessResult::NoHash);
    }
    if version > ctx.v_prev {
        Ok(ProcessResult::Update)
    } else {
        Ok(ProcessResult::NoUpdate)
    }
}

/// Parses one `sig` element. Returns `Ok(true)` if a verification context
/// should have been allocated but the crypto backend declined (treated as
/// an allocation failure — reachable only when the method was already
/// confirmed supported for the matched key's kind).
fn parse_signature<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize>(
    ctx: &mut TargetsContext<S, X, MAX_SIGS, BUF_SIZE>,
) -> Result<bool, LexError>
where
    S: ByteSource,
    X: Crypto,
{
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"{\"keyid\":")?;
    let mut keyid_buf: KeyId = [0u8; 32];
    let keyid_len = quoted_hex(&mut ctx.src, &mut ctx.verify_ctx, &mut keyid_buf)?;
    if keyid_len != keyid_buf.len() {
        return Err(LexError::Syntax);
    }

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"method\":")?;
    let mut method_buf = [0u8; BUF_SIZE];
    let method_len = quoted_text(&mut ctx.src, &mut ctx.verify_ctx, BUF_SIZE, Some(&mut method_buf))?;
    let method = std::str::from_utf8(&method_buf[..method_len]).map_err(|_| LexError::Syntax)?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"sig\":")?;
    let mut sig_buf = [0u8; MAX_SIGNATURE_LEN];
    let sig_len = quoted_hex(&mut ctx.src, &mut ctx.verify_ctx, &mut sig_buf)?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;

    let matched = ctx
        .keys
        .iter()
        .enumerate()
        .find(|(_, slot)| slot.as_ref().is_some_and(|(kid, _)| constant_time_eq(kid, &keyid_buf)))
        .map(|(j, _)| j);

    let Some(j) = matched else {
        trace!("signature keyid {} matches no trusted key, skipping", hex::encode(keyid_buf));
        return Ok(false);
    };
    if ctx.sig_usable[j] {
        trace!("key slot {} already bound to a signature, skipping duplicate", j);
        return Ok(false);
    }
    if !ctx.crypto.keytype_supported(method) {
        debug!("key slot {} matched but method {} is unsupported, skipping", j, method);
        return Ok(false);
    }

    let (_, key) = ctx.keys[j].as_ref().expect("matched index has a key");
    match ctx.crypto.start_verify(key, method, &sig_buf[..sig_len]) {
        Some(vctx) => {
            trace!("key slot {} bound, verification context started", j);
            ctx.verify_ctx[j] = Some(vctx);
            ctx.sig_usable[j] = true;
            Ok(false)
        }
        None => {
            debug!("key slot {} matched but crypto backend could not allocate a context", j);
            Ok(true)
        }
    }
}

/// Parses one `target` element. Returns `Some(got_hash)` if this target
/// matched the local ECU/hardware identity (and so committed its length and,
/// if present, its SHA-512 digest into the context), `None` if it was
/// ignored.
fn parse_target<S, X, const MAX_SIGS: usize, const BUF_SIZE: usize>(
    ctx: &mut TargetsContext<S, X, MAX_SIGS, BUF_SIZE>,
) -> Result<Option<bool>, LexError>
where
    S: ByteSource,
    X: Crypto,
{
    ignore_string(&mut ctx.src, &mut ctx.verify_ctx)?;
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b":{\"custom\":{\"ecu_identifier\":")?;
    let mut ecu_buf = [0u8; BUF_SIZE];
    let ecu_len = quoted_text(&mut ctx.src, &mut ctx.verify_ctx, BUF_SIZE, Some(&mut ecu_buf))?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"hardware_identifier\":")?;
    let mut hw_buf = [0u8; BUF_SIZE];
    let hw_len = quoted_text(&mut ctx.src, &mut ctx.verify_ctx, BUF_SIZE, Some(&mut hw_buf))?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"release_counter\":")?;
    let _release_counter = decimal_integer(&mut ctx.src, &mut ctx.verify_ctx)?;
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;

    let ignore_image =
        &ecu_buf[..ecu_len] != &ctx.ecu_id[..ctx.ecu_id_len] || &hw_buf[..hw_len] != &ctx.hw_id[..ctx.hw_id_len];

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"hashes\":{")?;
    let mut got_hash = false;
    let mut digest = [0u8; 64];
    loop {
        let mut name_buf = [0u8; BUF_SIZE];
        let name_len = quoted_text(&mut ctx.src, &mut ctx.verify_ctx, BUF_SIZE, Some(&mut name_buf))?;
        fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b":")?;

        if !ignore_image && &name_buf[..name_len] == b"sha512" {
            if got_hash {
                return Err(LexError::Syntax);
            }
            let n = quoted_hex(&mut ctx.src, &mut ctx.verify_ctx, &mut digest)?;
            if n != 64 {
                return Err(LexError::Syntax);
            }
            got_hash = true;
        } else {
            ignore_hex(&mut ctx.src, &mut ctx.verify_ctx)?;
        }

        if ctx.src.peek()? == b',' {
            fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",")?;
            continue;
        }
        break;
    }
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;

    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b",\"length\":")?;
    let length = decimal_integer(&mut ctx.src, &mut ctx.verify_ctx)?;
    fixed_literal(&mut ctx.src, &mut ctx.verify_ctx, b"}")?;

    if ignore_image {
        return Ok(None);
    }
    ctx.length = length;
    if got_hash {
        ctx.sha512_hash = digest;
    }
    Ok(Some(got_hash))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{RingCrypto, TrustedKey};
    use crate::source::SliceSource;
    use crate::time::CalendarTime;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};

    fn ed25519_keypair() -> (Ed25519KeyPair, [u8; 32]) {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).expect("generate");
        let pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).expect("parse");
        let mut raw = [0u8; 32];
        raw.copy_from_slice(pair.public_key().as_ref());
        (pair, raw)
    }

    fn keyid_for(raw_pub: &[u8; 32]) -> KeyId {
        let mut id = [0u8; 32];
        id.copy_from_slice(raw_pub);
        id
    }

    fn build_manifest(signed_body: &str, pair: &Ed25519KeyPair) -> Vec<u8> {
        let sig = pair.sign(signed_body.as_bytes());
        let sig_hex = hex::encode(sig.as_ref());
        let keyid_hex = hex::encode(pair.public_key().as_ref());
        format!(
            "{{\"signatures\":[{{\"keyid\":\"{}\",\"method\":\"ed25519\",\"sig\":\"{}\"}}],\"signed\":{}}}",
            keyid_hex, sig_hex, signed_body
        )
        .into_bytes()
    }

    fn signed_body(version: u32, expires: &str, ecu: &str, sha512_all_zero: bool, extra_target: Option<&str>) -> String {
        let hash_hex = if sha512_all_zero { "0".repeat(128) } else { String::new() };
        let mut targets = format!(
            "\"target1\":{{\"custom\":{{\"ecu_identifier\":\"{}\",\"hardware_identifier\":\"hw1\",\"release_counter\":1}},\"hashes\":{{\"sha512\":\"{}\"}},\"length\":1024}}",
            ecu, hash_hex
        );
        if let Some(extra) = extra_target {
            targets.push(',');
            targets.push_str(extra);
        }
        format!(
            "{{\"_type\":\"Targets\",\"expires\":\"{}\",\"targets\":{{{}}},\"version\":{}}}",
            expires, targets, version
        )
    }

    fn run_scenario<const MAX_SIGS: usize>(
        manifest: Vec<u8>,
        raw_pub: [u8; 32],
        threshold: usize,
        now: CalendarTime,
        v_prev: u32,
    ) -> (ProcessResult, TargetsContext<SliceSource<'static>, RingCrypto, MAX_SIGS, 64>) {
        let leaked: &'static [u8] = Box::leak(manifest.into_boxed_slice());
        let mut keys: [Option<(KeyId, TrustedKey)>; MAX_SIGS] = std::array::from_fn(|_| None);
        keys[0] = Some((keyid_for(&raw_pub), TrustedKey::Ed25519(raw_pub)));
        let mut ctx = TargetsContext::new(
            SliceSource::new(leaked),
            RingCrypto::new(),
            keys,
            threshold,
            now,
            ecu_id_for(ecu1()),
            b"hw1",
            v_prev,
        )
        .expect("valid context config");
        let result = process_targets(&mut ctx);
        (result, ctx)
    }

    fn ecu1() -> &'static str {
        "ecu1"
    }

    fn ecu_id_for(s: &'static str) -> &'static [u8] {
        s.as_bytes()
    }

    #[test]
    fn s1_valid_signature_update() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(2, "2099-01-01T00:00:00Z", "ecu1", true, None);
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, ctx) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::Update);
        assert_eq!(ctx.length(), 1024);
        assert_eq!(ctx.sha512(), &[0u8; 64]);
    }

    #[test]
    fn s2_same_version_no_update() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(1, "2099-01-01T00:00:00Z", "ecu1", true, None);
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::NoUpdate);
    }

    #[test]
    fn s3_downgrade() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(0, "2099-01-01T00:00:00Z", "ecu1", true, None);
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::Downgrade);
    }

    #[test]
    fn s4_no_matching_ecu_yields_noimage() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(2, "2099-01-01T00:00:00Z", "ecu2", true, None);
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::NoImage);
    }

    #[test]
    fn s5_tampered_signature_fails() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(2, "2099-01-01T00:00:00Z", "ecu1", true, None);
        let mut manifest = build_manifest(&body, &pair);
        let marker = b"\"sig\":\"";
        let sig_start = manifest
            .windows(marker.len())
            .position(|w| w == marker)
            .map(|p| p + marker.len())
            .unwrap();
        let nibble = manifest[sig_start];
        manifest[sig_start] = if nibble == b'0' { b'1' } else { b'0' };
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::SigFail);
    }

    #[test]
    fn s6_duplicate_matching_targets_is_ecu_duplicate() {
        let (pair, raw_pub) = ed25519_keypair();
        let extra = "\"target2\":{\"custom\":{\"ecu_identifier\":\"ecu1\",\"hardware_identifier\":\"hw1\",\"release_counter\":1},\"hashes\":{\"sha512\":\"00\"},\"length\":1}";
        let body = signed_body(2, "2099-01-01T00:00:00Z", "ecu1", true, Some(extra));
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::EcuDuplicate);
    }

    #[test]
    fn s7_wrong_type() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(2, "2099-01-01T00:00:00Z", "ecu1", true, None).replace("Targets", "Snapshot");
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::WrongType);
    }

    #[test]
    fn s8_expired() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(2, "2000-01-01T00:00:00Z", "ecu1", true, None);
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::Expired);
    }

    #[test]
    fn nohash_when_sha512_absent() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = "{\"_type\":\"Targets\",\"expires\":\"2099-01-01T00:00:00Z\",\"targets\":{\"target1\":{\"custom\":{\"ecu_identifier\":\"ecu1\",\"hardware_identifier\":\"hw1\",\"release_counter\":1},\"hashes\":{\"sha256\":\"00\"},\"length\":1024}},\"version\":2}".to_string();
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::NoHash);
    }

    #[test]
    fn duplicate_sha512_entries_are_rejected() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = "{\"_type\":\"Targets\",\"expires\":\"2099-01-01T00:00:00Z\",\"targets\":{\"target1\":{\"custom\":{\"ecu_identifier\":\"ecu1\",\"hardware_identifier\":\"hw1\",\"release_counter\":1},\"hashes\":{\"sha512\":\"00\",\"sha512\":\"11\"},\"length\":1}},\"version\":2}".to_string();
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::JsonErr);
    }

    #[test]
    fn signature_matches_key_in_non_first_slot() {
        let (_decoy_pair, decoy_pub) = ed25519_keypair();
        let (signer_pair, signer_pub) = ed25519_keypair();
        let body = signed_body(2, "2099-01-01T00:00:00Z", "ecu1", true, None);
        let manifest = build_manifest(&body, &signer_pair);

        let leaked: &'static [u8] = Box::leak(manifest.into_boxed_slice());
        let mut keys: [Option<(KeyId, TrustedKey)>; 2] = std::array::from_fn(|_| None);
        keys[0] = Some((keyid_for(&decoy_pub), TrustedKey::Ed25519(decoy_pub)));
        keys[1] = Some((keyid_for(&signer_pub), TrustedKey::Ed25519(signer_pub)));
        let mut ctx = TargetsContext::new(
            SliceSource::new(leaked),
            RingCrypto::new(),
            keys,
            1,
            CalendarTime::new(2024, 6, 1, 0, 0, 0),
            b"ecu1",
            b"hw1",
            1,
        )
        .expect("valid context config");
        assert_eq!(process_targets(&mut ctx), ProcessResult::Update);
    }

    #[test]
    fn expiry_boundary_now_equal_expires_is_not_expired() {
        let (pair, raw_pub) = ed25519_keypair();
        let body = signed_body(2, "2024-06-01T00:00:00Z", "ecu1", true, None);
        let manifest = build_manifest(&body, &pair);
        let now = CalendarTime::new(2024, 6, 1, 0, 0, 0);
        let (result, _) = run_scenario::<1>(manifest, raw_pub, 1, now, 1);
        assert_eq!(result, ProcessResult::Update);
    }
}
