// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Redirection of the process's stdout and stderr into a pipe.

use crate::helpers::lock;
use bytes::BytesMut;
use std::{
    ffi::c_int,
    fs::File,
    io::{self, Read, Write},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread::JoinHandle,
    time::Duration,
};
use tracing::{debug, warn};

const STDOUT: c_int = libc::STDOUT_FILENO;
const STDERR: c_int = libc::STDERR_FILENO;

/// How long [`StreamRedirect::finish`] waits for the pipe to drain.
pub(super) const BAILOUT_TIME: Duration = Duration::from_secs(1);

/// How [`StreamRedirect::finish`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum FinishOutcome {
    /// Everything written to the pipe was read.
    Drained,

    /// Another process still holds the pipe open. The reader was detached and its output
    /// discarded.
    BailedOut,
}

#[derive(Debug)]
pub(super) struct StreamRedirect {
    saved_stdout: OwnedFd,
    saved_stderr: OwnedFd,
    // Kept open so that capture can be paused and resumed without losing the reader.
    write_end: Option<OwnedFd>,
    reader: Option<JoinHandle<()>>,
    // Disconnects when the reader thread exits.
    reader_done: Receiver<()>,
    buffer: Arc<Mutex<BytesMut>>,
    // Set under the buffer lock once the reader is detached.
    detached: Arc<AtomicBool>,
    redirected: bool,
}

impl StreamRedirect {
    pub(super) fn start(buffer: Arc<Mutex<BytesMut>>) -> io::Result<Self> {
        let (read_end, write_end) = pipe()?;
        let saved_stdout = dup(STDOUT)?;
        let saved_stderr = dup(STDERR)?;
        let (done_tx, reader_done) = mpsc::channel();
        let detached = Arc::new(AtomicBool::new(false));

        let reader = std::thread::Builder::new()
            .name("trellis-output-reader".to_owned())
            .spawn({
                let buffer = Arc::clone(&buffer);
                let detached = Arc::clone(&detached);
                move || {
                    let _done_tx = done_tx;
                    let mut read_end = File::from(read_end);
                    let mut chunk = [0u8; 8192];
                    loop {
                        match read_end.read(&mut chunk) {
                            Ok(0) => break,
                            Ok(n) => {
                                // A detached reader keeps draining so the writer never blocks.
                                let mut buffer = lock(&buffer);
                                if !detached.load(Ordering::Acquire) {
                                    buffer.extend_from_slice(&chunk[..n]);
                                }
                            }
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                            Err(err) => {
                                debug!("output reader stopped: {err}");
                                break;
                            }
                        }
                    }
                }
            })?;

        let mut this = Self {
            saved_stdout,
            saved_stderr,
            write_end: Some(write_end),
            reader: Some(reader),
            reader_done,
            buffer,
            detached,
            redirected: false,
        };
        this.redirect()?;
        Ok(this)
    }

    pub(super) fn redirect(&mut self) -> io::Result<()> {
        if self.redirected {
            return Ok(());
        }
        let Some(write_end) = &self.write_end else {
            return Ok(());
        };
        flush_std();
        dup2(write_end.as_raw_fd(), STDOUT)?;
        dup2(write_end.as_raw_fd(), STDERR)?;
        self.redirected = true;
        Ok(())
    }

    pub(super) fn restore(&mut self) -> io::Result<()> {
        if !self.redirected {
            return Ok(());
        }
        flush_std();
        dup2(self.saved_stdout.as_raw_fd(), STDOUT)?;
        dup2(self.saved_stderr.as_raw_fd(), STDERR)?;
        self.redirected = false;
        Ok(())
    }

    /// Restores the original streams and waits for everything written so far to be read.
    ///
    /// A process started with inherited stdio keeps the pipe open after the streams are restored.
    /// If the pipe hasn't drained within [`BAILOUT_TIME`], the reader is detached: it keeps
    /// draining in the background but nothing it reads is captured.
    pub(super) fn finish(mut self) -> io::Result<FinishOutcome> {
        let restored = self.restore();
        // Once fds 1 and 2 are restored this is our last write end, so the reader sees EOF unless
        // another process holds a copy.
        self.write_end = None;
        let outcome = match self.reader_done.recv_timeout(BAILOUT_TIME) {
            Err(RecvTimeoutError::Timeout) => {
                let _buffer = lock(&self.buffer);
                self.detached.store(true, Ordering::Release);
                warn!(
                    bailout = ?BAILOUT_TIME,
                    "captured streams held open by another process, abandoning the pipe",
                );
                // Dropping the handle detaches the thread.
                self.reader = None;
                FinishOutcome::BailedOut
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(reader) = self.reader.take()
                    && reader.join().is_err()
                {
                    debug!("output reader thread panicked");
                }
                FinishOutcome::Drained
            }
        };
        restored.map(|()| outcome)
    }
}

impl Drop for StreamRedirect {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            debug!("failed to restore stdout and stderr: {err}");
        }
    }
}

fn flush_std() {
    // Anything buffered in Rust's stdout belongs to whichever fd was installed when it was written.
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe succeeded, so both fds are open and owned by nobody else.
    let (read_end, write_end) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((read_end, write_end))
}

fn dup(fd: c_int) -> io::Result<OwnedFd> {
    let res = unsafe { libc::dup(fd) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: dup returned a fresh fd.
    Ok(unsafe { OwnedFd::from_raw_fd(res) })
}

fn dup2(src: c_int, dst: c_int) -> io::Result<()> {
    loop {
        let res = unsafe { libc::dup2(src, dst) };
        if res != -1 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
