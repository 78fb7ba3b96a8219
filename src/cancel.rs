//! Cancellation shared by every stage of a run.

use std::{
    fmt,
    io::{self, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

/// Token to cancel a running extraction.
///
/// Clones share the same state. Once cancelled, it can't be reset.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Return an error if the token is cancelled.
    ///
    /// The error can be identified with [`is_cancellation`].
    pub fn check(&self) -> io::Result<()> {
        if self.is_cancelled() {
            Err(io::Error::other(Cancelled))
        } else {
            Ok(())
        }
    }

    /// Wrap `reader` so every read fails after this token is cancelled.
    pub fn reader<R: Read>(&self, reader: R) -> CancellableReader<'_, R> {
        CancellableReader {
            token: self,
            reader,
        }
    }
}

/// Error stored in the `io::Error` returned after a cancellation.
#[derive(Debug)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Operation cancelled.")
    }
}

impl std::error::Error for Cancelled {}

/// Check if `error` was caused by a cancelled [`CancelToken`].
pub fn is_cancellation(error: &io::Error) -> bool {
    error.get_ref().is_some_and(|e| e.is::<Cancelled>())
}

/// Reader that checks a [`CancelToken`] before and after every read.
///
/// The error is not `ErrorKind::Interrupted`, since `io::copy` would
/// retry the read forever.
pub struct CancellableReader<'a, R> {
    token: &'a CancelToken,
    reader: R,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.token.check()?;
        let n = self.reader.read(buf)?;
        self.token.check()?;
        Ok(n)
    }
}

/// Cancel `token` when the process receives `SIGINT` or `SIGTERM`.
///
/// The signals are blocked in the calling thread, and then received by
/// a dedicated thread with `sigwait`. This function must be called before
/// any other thread is spawned, so all of them inherit the signal mask.
///
/// A second signal terminates the process immediately.
pub fn cancel_on_signals(token: &CancelToken) -> io::Result<()> {
    // SAFETY: `set` is initialized by `sigemptyset` before use.
    let set = unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);

        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }

        set
    };

    let token = token.clone();

    thread::Builder::new()
        .name("signals".into())
        .spawn(move || loop {
            let mut signal = 0;

            // SAFETY: `set` is a valid signal set, blocked in every thread.
            if unsafe { libc::sigwait(&set, &mut signal) } != 0 {
                continue;
            }

            if token.is_cancelled() {
                tracing::error!(signal, "Caught signal again, exiting");
                std::process::exit(128 + signal);
            }

            tracing::warn!(signal, "Caught signal, cancelling");
            token.cancel();
        })?;

    Ok(())
}

#[test]
fn cancel_in_flight_copy() {
    /// Reader that cancels the token after the first chunk.
    struct CancelAfterFirstRead<'a> {
        token: &'a CancelToken,
        reads: usize,
    }

    impl Read for CancelAfterFirstRead<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            if self.reads == 2 {
                self.token.cancel();
            }

            buf.fill(b'x');
            Ok(buf.len())
        }
    }

    let token = CancelToken::new();
    let source = CancelAfterFirstRead {
        token: &token,
        reads: 0,
    };

    let mut output = Vec::new();
    let err = io::copy(&mut token.reader(source), &mut output).unwrap_err();

    assert!(is_cancellation(&err));
    assert!(!output.is_empty());
}

#[test]
fn cancelled_token_stops_reads() {
    let token = CancelToken::new();
    let clone = token.clone();

    let mut buffer = [0; 4];
    assert_eq!(token.reader(&b"abcd"[..]).read(&mut buffer).unwrap(), 4);

    clone.cancel();
    assert!(token.is_cancelled());

    let err = token.reader(&b"abcd"[..]).read(&mut buffer).unwrap_err();
    assert!(is_cancellation(&err));
    assert!(!is_cancellation(&io::Error::other("other")));
}
