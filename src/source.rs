//! Byte source adapter: wraps the caller's `read`/`peek` and, while the
//! cursor is inside the `signed` sub-object, tees every consumed byte into
//! every live verification context.
//!
//! Shaped after a transport-agnostic client trait with an in-memory test
//! double backing it; here the abstraction is narrower (two methods,
//! byte-granular) because the core never needs more than "give me the next
//! byte(s)" or "peek one".

use crate::crypto::VerifyCtx;

/// The underlying transport failed to deliver a byte.
///
/// Carries no detail: a failure of the underlying transport is propagated
/// unchanged as a read failure. Distinguishing *why* the transport failed
/// is the caller's concern, not the parser's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFailure;

/// The caller-supplied transport: deliver exact byte counts, or fail.
pub trait ByteSource {
    /// Deliver exactly `buf.len()` bytes, advancing the cursor.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), ReadFailure>;

    /// Deliver the next byte without advancing the cursor. Never teed —
    /// a peeked byte is teed on the `read` call that actually consumes it.
    fn peek(&mut self) -> Result<u8, ReadFailure>;
}

/// Reads from an in-memory byte slice. Used by tests and `targets_replay`.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceSource { data, pos: 0 }
    }
}

impl<'a> ByteSource for SliceSource<'a> {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), ReadFailure> {
        let end = self.pos + buf.len();
        let chunk = self.data.get(self.pos..end).ok_or(ReadFailure)?;
        buf.copy_from_slice(chunk);
        self.pos = end;
        Ok(())
    }

    fn peek(&mut self) -> Result<u8, ReadFailure> {
        self.data.get(self.pos).copied().ok_or(ReadFailure)
    }
}

/// Wraps any `std::io::Read` (a socket, a streamed HTTP body, a file) as a
/// `ByteSource`. `peek` buffers at most one already-read byte, never more.
pub struct ReaderSource<R> {
    inner: R,
    peeked: Option<u8>,
}

impl<R: std::io::Read> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        ReaderSource { inner, peeked: None }
    }
}

impl<R: std::io::Read> ByteSource for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), ReadFailure> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut written = 0;
        if let Some(byte) = self.peeked.take() {
            buf[0] = byte;
            written = 1;
        }
        if written < buf.len() {
            self.inner.read_exact(&mut buf[written..]).map_err(|_| ReadFailure)?;
        }
        Ok(())
    }

    fn peek(&mut self) -> Result<u8, ReadFailure> {
        if let Some(byte) = self.peeked {
            return Ok(byte);
        }
        let mut byte = [0u8; 1];
        self.inner.read_exact(&mut byte).map_err(|_| ReadFailure)?;
        self.peeked = Some(byte[0]);
        Ok(byte[0])
    }
}

/// Owns the `in_signed` gate and the live verification contexts, and tees
/// every byte `read` delivers into each of them while the gate is open.
///
/// `slots` has one entry per trusted key; `None` means that key's
/// signature either wasn't present or wasn't usable (unsupported method,
/// unmatched key id).
pub struct TeeingSource<S, C> {
    inner: S,
    in_signed: bool,
    _marker: std::marker::PhantomData<C>,
}

impl<S: ByteSource, C: VerifyCtx> TeeingSource<S, C> {
    pub fn new(inner: S) -> Self {
        TeeingSource {
            inner,
            in_signed: false,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn enter_signed(&mut self) {
        self.in_signed = true;
    }

    pub fn leave_signed(&mut self) {
        self.in_signed = false;
    }

    pub fn in_signed(&self) -> bool {
        self.in_signed
    }

    /// Read `buf.len()` bytes, tee-ing them into `slots` if the signed
    /// region is currently open.
    pub fn read(&mut self, buf: &mut [u8], slots: &mut [Option<C>]) -> Result<(), ReadFailure> {
        self.inner.read(buf)?;
        if self.in_signed {
            for slot in slots.iter_mut().flatten() {
                slot.feed(buf);
            }
        }
        Ok(())
    }

    pub fn peek(&mut self) -> Result<u8, ReadFailure> {
        self.inner.peek()
    }
}
