use super::Error;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// ANSI colors handed out to clients, by index.
pub const COLORS: &[&str] = &[
    "\x1b[32m", "\x1b[33m", "\x1b[36m", "\x1b[35m", "\x1b[31m", "\x1b[34m",
];

/// Resets the terminal color.
pub const RESET_COLOR: &str = "\x1b[0m";

/// Render the label written before every output line of a client.
///
/// `width` is the length of the longest label in the run; shorter labels are left-padded so
/// the `|` separators line up.
pub fn render(label: &str, index: usize, width: usize, color: bool) -> String {
    let padding = " ".repeat(width.saturating_sub(label.len()));
    if color {
        format!(
            "{}{}{} | {}",
            COLORS[index % COLORS.len()],
            padding,
            label,
            RESET_COLOR
        )
    } else {
        format!("{}{} | ", padding, label)
    }
}

type Sink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Where the combined output of all clients goes.
///
/// Cloning yields handles to the same destinations; every line is written under a lock, so
/// lines from different clients never interleave.
#[derive(Clone)]
pub struct Output {
    stdout: Sink,
    stderr: Sink,
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output").finish_non_exhaustive()
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new(tokio::io::stdout(), tokio::io::stderr())
    }
}

impl Output {
    /// Send output to the given writers.
    pub fn new<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncWrite + Send + Unpin + 'static,
        E: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            stdout: Arc::new(Mutex::new(Box::new(stdout))),
            stderr: Arc::new(Mutex::new(Box::new(stderr))),
        }
    }

    pub(crate) fn stdout(&self) -> Sink {
        self.stdout.clone()
    }

    pub(crate) fn stderr(&self) -> Sink {
        self.stderr.clone()
    }

    /// Write a full line to the operator's stderr.
    pub(crate) async fn report(&self, line: &str) {
        let mut w = self.stderr.lock().await;
        let _ = w.write_all(line.as_bytes()).await;
        let _ = w.write_all(b"\n").await;
        let _ = w.flush().await;
    }

    /// Flush both destinations.
    pub async fn flush(&self) {
        let _ = self.stdout.lock().await.flush().await;
        let _ = self.stderr.lock().await.flush().await;
    }
}

/// Copy `reader` to `sink` line by line, starting every line with `prefix`.
///
/// A final line without a newline gets one. Returns the number of lines copied.
pub(crate) async fn copy_prefixed<R>(
    reader: R,
    sink: Sink,
    prefix: String,
    stream: &'static str,
) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);
    let mut buf = Vec::with_capacity(256);
    let mut lines = 0;

    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|source| Error::ChildIo { stream, source })?;
        if n == 0 {
            break;
        }

        buf.clear();
        buf.extend_from_slice(prefix.as_bytes());
        buf.extend_from_slice(&line);
        if !line.ends_with(b"\n") {
            buf.push(b'\n');
        }

        let mut w = sink.lock().await;
        w.write_all(&buf)
            .await
            .map_err(|source| Error::ChildIo { stream, source })?;
        w.flush()
            .await
            .map_err(|source| Error::ChildIo { stream, source })?;
        lines += 1;
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_align() {
        let short = render("a@web1", 0, 12, false);
        let long = render("deploy@web10", 1, 12, false);
        assert_eq!(short, "      a@web1 | ");
        assert_eq!(long, "deploy@web10 | ");
        assert_eq!(short.len(), long.len());

        let colored = render("a@web1", 7, 6, true);
        assert!(colored.starts_with(COLORS[1]));
        assert!(colored.ends_with(RESET_COLOR));
    }

    #[tokio::test]
    async fn every_line_prefixed() {
        let (w, mut r) = tokio::io::duplex(1024);
        let sink: Sink = Arc::new(Mutex::new(Box::new(w)));
        let input: &[u8] = b"one\ntwo\nthree";

        let n = copy_prefixed(input, sink.clone(), "h | ".into(), "stdout")
            .await
            .unwrap();
        assert_eq!(n, 3);
        drop(sink);

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut r, &mut out)
            .await
            .unwrap();
        assert_eq!(out, "h | one\nh | two\nh | three\n");
    }
}
