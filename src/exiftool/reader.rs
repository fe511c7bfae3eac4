use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

/// One line of exiftool output, classified.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line<'a> {
    /// `{readyN}`, or `{ready}` when no number was attached.
    Ready(Option<u64>),
    Output(&'a str),
}

pub(crate) fn classify(line: &str) -> Line<'_> {
    let trimmed = line.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{ready")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        if inner.is_empty() {
            return Line::Ready(None);
        }
        if let Ok(seq) = inner.parse() {
            return Line::Ready(Some(seq));
        }
    }
    Line::Output(line)
}

/// Drain `stdout` into an unbounded queue until EOF.
///
/// Every line is queued, ready sentinels included; consumers do the
/// filtering. When the process exits the task ends and the queue simply stops
/// receiving lines.
pub(crate) fn spawn_stdout_reader<R>(stdout: R, pid: Option<u32>) -> (UnboundedReceiver<String>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::warn!("Error reading exiftool stdout (pid {pid:?}): {e}");
                    break;
                }
            }
        }
        log::debug!("exiftool stdout reader finished (pid {pid:?})");
    });
    (rx, task)
}

/// Forward exiftool's stderr to the log.
pub(crate) fn spawn_stderr_logger<R>(stderr: R, pid: Option<u32>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    if line.starts_with("Warning") {
                        log::debug!("exiftool: {line}");
                    } else {
                        log::warn!("exiftool: {line}");
                    }
                }
            }
        }
        log::debug!("exiftool stderr reader finished (pid {pid:?})");
    })
}

// exiftool echoes file names in the local code page on some systems.
fn decode_line(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    text.trim_end_matches(['\n', '\r']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_numbered_sentinel() {
        assert_eq!(classify("{ready42}"), Line::Ready(Some(42)));
        assert_eq!(classify("{ready7}\r"), Line::Ready(Some(7)));
    }

    #[test]
    fn classify_bare_sentinel() {
        assert_eq!(classify("{ready}"), Line::Ready(None));
    }

    #[test]
    fn classify_output() {
        assert_eq!(
            classify("    1 image files updated"),
            Line::Output("    1 image files updated")
        );
        assert_eq!(classify("{readyish}"), Line::Output("{readyish}"));
    }

    #[tokio::test]
    async fn reader_queues_every_line_until_eof() {
        let input: &[u8] = b"    1 image files updated\n{ready1}\r\nno newline";
        let (mut rx, task) = spawn_stdout_reader(input, None);
        task.await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("    1 image files updated"));
        assert_eq!(rx.recv().await.as_deref(), Some("{ready1}"));
        assert_eq!(rx.recv().await.as_deref(), Some("no newline"));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn reader_survives_invalid_utf8() {
        let input: &[u8] = b"caf\xe9\n{ready2}\n";
        let (mut rx, task) = spawn_stdout_reader(input, None);
        task.await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("caf\u{fffd}"));
        assert_eq!(rx.recv().await.as_deref(), Some("{ready2}"));
    }
}
