//! Ambient errors for configuration and key loading.
//!
//! These are distinct from [`crate::context::ProcessResult`], which is the
//! streaming-parse result taxonomy returned by `process_targets`. `Error`
//! covers everything that can go wrong *before* a parse starts: reading a
//! config file, decoding key material, building the trusted-key table.

use std::fmt::{self, Display, Formatter};
use std::io;

/// System-wide errors from configuration and key setup.
#[derive(Debug)]
pub enum Error {
    Config(String),
    Io(io::Error),
    Toml(toml::de::Error),
    Hex(hex::FromHexError),
    Pem(pem::PemError),
    KeyNotFound(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Config(err) => write!(f, "bad config: {}", err),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Toml(err) => write!(f, "TOML parse error: {}", err),
            Error::Hex(err) => write!(f, "not valid hex data: {}", err),
            Error::Pem(err) => write!(f, "PEM parse error: {}", err),
            Error::KeyNotFound(id) => write!(f, "key not found: {}", id),
        }
    }
}

impl std::error::Error for Error {}

macro_rules! derive_from {
    ([ $( $from:ty => $to:ident ),* $(,)? ]) => {
        $(impl From<$from> for Error {
            fn from(err: $from) -> Error { Error::$to(err) }
        })*
    };
}

derive_from!([
    io::Error => Io,
    toml::de::Error => Toml,
    hex::FromHexError => Hex,
    pem::PemError => Pem,
]);
