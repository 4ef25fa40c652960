//! Streaming validator for Uptane director `targets.json` manifests.
//!
//! The crate ingests a director targets manifest as a byte stream, without
//! ever buffering the document, while simultaneously feeding the `signed`
//! byte range into one verification context per matched trusted key. See
//! `grammar::process_targets` for the entry point.

#[macro_use]
extern crate log;

pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod grammar;
pub mod lexer;
pub mod pool;
pub mod source;
pub mod time;

pub use config::Config;
pub use context::{ProcessResult, TargetsContext};
pub use crypto::{Crypto, KeyId, RingCrypto, TrustedKey, VerifyCtx, KEYID_LEN, MAX_SIGNATURE_LEN};
pub use error::Error;
pub use grammar::process_targets;
pub use pool::ContextSource;
#[cfg(feature = "heap")]
pub use pool::HeapSource;
#[cfg(feature = "pooled")]
pub use pool::StaticPool;
pub use source::{ByteSource, ReadFailure, ReaderSource, SliceSource};
pub use time::CalendarTime;
