//! ProcessExecutor - `tokio::process` による CommandExecutor

use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::pool::Interrupt;
use crate::ports::{CommandExecutor, ExecError};

/// Spawns the command as a child process and streams both of its outputs.
///
/// Lines end at `\n` or `\r`; encoders redraw their status line with a bare
/// carriage return.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(
        &self,
        args: &[String],
        work_dir: &Path,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        mut interrupt: Interrupt,
    ) -> Result<bool, ExecError> {
        let (program, rest) = args.split_first().ok_or_else(|| {
            ExecError::Io(std::io::Error::new(ErrorKind::InvalidInput, "empty command"))
        })?;

        let spawned = Command::new(program)
            .args(rest)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ExecError::MissingBinary(program.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(program = %program, pid = ?child.id(), "process started");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_lines = LineBuffer::default();
        let mut err_lines = LineBuffer::default();
        let mut out_buf = [0u8; 4096];
        let mut err_buf = [0u8; 4096];

        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                _ = interrupt.interrupted() => {
                    kill(&mut child).await;
                    return Err(ExecError::Interrupted);
                }
                read = read_some(&mut stdout, &mut out_buf) => match read? {
                    0 => {
                        out_lines.flush(on_line);
                        stdout = None;
                    }
                    n => out_lines.push(&out_buf[..n], on_line),
                },
                read = read_some(&mut stderr, &mut err_buf) => match read? {
                    0 => {
                        err_lines.flush(on_line);
                        stderr = None;
                    }
                    n => err_lines.push(&err_buf[..n], on_line),
                },
            }
        }

        let status = tokio::select! {
            _ = interrupt.interrupted() => {
                kill(&mut child).await;
                return Err(ExecError::Interrupted);
            }
            status = child.wait() => status?,
        };
        tracing::debug!(program = %program, %status, "process exited");
        Ok(status.success())
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill interrupted process");
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Longer output without a line break is handed on in pieces of this size.
const MAX_LINE_LEN: usize = 4096;

#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8], on_line: &mut (dyn for<'a> FnMut(&'a str) + Send)) {
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                self.flush(on_line);
            } else {
                self.pending.push(byte);
                if self.pending.len() >= MAX_LINE_LEN {
                    self.flush(on_line);
                }
            }
        }
    }

    fn flush(&mut self, on_line: &mut (dyn for<'a> FnMut(&'a str) + Send)) {
        if self.pending.is_empty() {
            return;
        }
        {
            let line = String::from_utf8_lossy(&self.pending);
            on_line(line.trim_end());
        }
        self.pending.clear();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn streams_lines_from_both_outputs() {
        let mut lines = Vec::new();
        let ok = ProcessExecutor
            .run(
                &sh("printf 'frame=1\\rframe=2\\n'; echo oops 1>&2"),
                Path::new("."),
                &mut |line: &str| lines.push(line.to_string()),
                Interrupt::never(),
            )
            .await
            .unwrap();

        assert!(ok);
        lines.sort();
        assert_eq!(lines, vec!["frame=1", "frame=2", "oops"]);
    }

    #[test]
    fn unterminated_output_is_split_into_bounded_lines() {
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        let noise = vec![b'x'; MAX_LINE_LEN * 3 + 10];
        for chunk in noise.chunks(1000) {
            buffer.push(chunk, &mut |line: &str| lines.push(line.len()));
        }
        buffer.push(b"\n", &mut |line: &str| lines.push(line.len()));

        assert_eq!(lines, vec![MAX_LINE_LEN, MAX_LINE_LEN, MAX_LINE_LEN, 10]);
        assert!(buffer.pending.is_empty());
    }

    #[tokio::test]
    async fn nonzero_exit_is_false() {
        let ok = ProcessExecutor
            .run(&sh("exit 3"), Path::new("."), &mut |_: &str| {}, Interrupt::never())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn missing_program_is_missing_binary() {
        let args = vec!["spindle-no-such-encoder".to_string()];
        let err = ProcessExecutor
            .run(&args, Path::new("."), &mut |_: &str| {}, Interrupt::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::MissingBinary(p) if p == "spindle-no-such-encoder"));
    }

    #[tokio::test]
    async fn interrupt_kills_the_process() {
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(async move {
            ProcessExecutor
                .run(&sh("sleep 5"), Path::new("."), &mut |_: &str| {}, Interrupt::new(rx))
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ExecError::Interrupted)));
    }
}
