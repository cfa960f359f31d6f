//! Line-oriented pipe IO.
//!
//! The worker (child) side blocks: a worker drives one task at a time and
//! has nothing else to do while waiting, so plain `std` IO on the pipe fds
//! is the whole story (`read_until`/`write_all` already retry EINTR). The
//! driver (parent) side is async so one task per worker can drain results
//! without blocking the runtime.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader as AsyncBufReader, Lines, ReadBuf};
use tokio::net::unix::pipe;
use tokio::process::{ChildStdin, ChildStdout};

/// Blocking line reader for the worker side of a pipe.
pub(crate) struct LineReader {
    inner: BufReader<File>,
}

impl LineReader {
    pub(crate) fn new(file: File) -> Self {
        Self {
            inner: BufReader::new(file),
        }
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self::new(File::from(fd))
    }

    /// Read one line including its newline; `Ok(None)` on EOF.
    pub(crate) fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.inner.read_line(&mut line)?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line))
        }
    }
}

/// Blocking line writer for the worker side of a pipe.
pub(crate) struct LineWriter {
    inner: File,
}

impl LineWriter {
    pub(crate) fn new(file: File) -> Self {
        Self { inner: file }
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Self {
        Self::new(File::from(fd))
    }

    /// Write one line (caller supplies the trailing newline).
    pub(crate) fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes())
    }
}

/// Reader over fd 0 for a spawn-mode worker (its submit pipe is stdin).
pub(crate) fn stdin_reader() -> LineReader {
    // Safety: called once, in the worker entry, before anything else in the
    // process touches stdin.
    LineReader::new(unsafe { File::from_raw_fd(0) })
}

/// Writer over fd 1 for a spawn-mode worker (its result pipe is stdout).
pub(crate) fn stdout_writer() -> LineWriter {
    // Safety: called once, in the worker entry, before anything else in the
    // process touches stdout.
    LineWriter::new(unsafe { File::from_raw_fd(1) })
}

/// Parent end of a submit pipe: a spawned child's stdin or the write end of
/// a fork pipe pair.
enum SubmitSink {
    Stdio(ChildStdin),
    Pipe(pipe::Sender),
}

/// Async line writer for the driver side of a submit pipe.
pub(crate) struct FrameWriter {
    sink: SubmitSink,
}

impl FrameWriter {
    pub(crate) fn stdio(stdin: ChildStdin) -> Self {
        Self {
            sink: SubmitSink::Stdio(stdin),
        }
    }

    pub(crate) fn pipe(sender: pipe::Sender) -> Self {
        Self {
            sink: SubmitSink::Pipe(sender),
        }
    }

    pub(crate) async fn write_line(&mut self, line: &str) -> io::Result<()> {
        match &mut self.sink {
            SubmitSink::Stdio(w) => w.write_all(line.as_bytes()).await,
            SubmitSink::Pipe(w) => w.write_all(line.as_bytes()).await,
        }
    }
}

/// Parent end of a result pipe: a spawned child's stdout or the read end of
/// a fork pipe pair.
pub(crate) enum ResultSource {
    Stdio(ChildStdout),
    Pipe(pipe::Receiver),
}

impl AsyncRead for ResultSource {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        match self.get_mut() {
            ResultSource::Stdio(r) => std::pin::Pin::new(r).poll_read(cx, buf),
            ResultSource::Pipe(r) => std::pin::Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Async line reader for the driver side of a result pipe.
pub(crate) struct FrameReader {
    lines: Lines<AsyncBufReader<ResultSource>>,
}

impl FrameReader {
    pub(crate) fn stdio(stdout: ChildStdout) -> Self {
        Self::new(ResultSource::Stdio(stdout))
    }

    pub(crate) fn pipe(receiver: pipe::Receiver) -> Self {
        Self::new(ResultSource::Pipe(receiver))
    }

    fn new(source: ResultSource) -> Self {
        Self {
            lines: AsyncBufReader::new(source).lines(),
        }
    }

    /// Read one line without its newline; `Ok(None)` on EOF.
    pub(crate) async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }
}
