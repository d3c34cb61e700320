#![cfg(unix)]

//! Transport over an externally launched command. The child's stdin/stdout
//! carry the RPC byte stream; stderr is drained to a bounded tail buffer so
//! an abrupt exit can explain itself. SSH tunnelling is this transport with
//! a synthesised command line.

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};
use crate::transport::{DialOptions, unix};
use crate::uri::RemoteUri;

/// How much of the child's stderr is retained for error reports.
const STDERR_TAIL_MAX: usize = 8192;

/// Shared view of the child's collected stderr.
#[derive(Clone, Debug)]
pub struct StderrTail {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl StderrTail {
    fn new() -> Self {
        StderrTail {
            buf: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The collected output, trimmed, when there is any.
    pub fn snapshot(&self) -> Option<String> {
        let buf = self.buf.lock();
        if buf.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&buf).trim().to_string())
    }

    fn append(&self, data: &[u8]) {
        let mut buf = self.buf.lock();
        // Keep the newest bytes: the final lines are the ones that explain
        // an exit.
        if data.len() >= STDERR_TAIL_MAX {
            buf.clear();
            buf.extend_from_slice(&data[data.len() - STDERR_TAIL_MAX..]);
            return;
        }
        let overflow = (buf.len() + data.len()).saturating_sub(STDERR_TAIL_MAX);
        if overflow > 0 {
            buf.drain(..overflow);
        }
        buf.extend_from_slice(data);
    }
}

/// A running tunnel process plus its pipes. The child is killed and reaped
/// when this is dropped.
#[derive(Debug)]
pub struct ExternalProcess {
    _child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: StderrTail,
}

impl ExternalProcess {
    pub fn stderr_tail(&self) -> StderrTail {
        self.stderr.clone()
    }
}

/// Launch `program args…` and wire its stdio up as a transport.
pub async fn spawn(program: &str, args: &[String]) -> Result<ExternalProcess> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Transport(format!("unable to launch '{program}': {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Resource("child stdin missing".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Resource("child stdout missing".into()))?;
    let mut err_pipe = child
        .stderr
        .take()
        .ok_or_else(|| Error::Resource("child stderr missing".into()))?;

    let stderr = StderrTail::new();
    let tail = stderr.clone();
    tokio::spawn(async move {
        let mut chunk = [0u8; 1024];
        loop {
            match err_pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.append(&chunk[..n]),
            }
        }
    });

    Ok(ExternalProcess {
        _child: child,
        stdin,
        stdout,
        stderr,
    })
}

/// `ext` transport: the URI must name the command to run.
pub async fn connect_command(uri: &RemoteUri) -> Result<ExternalProcess> {
    let command = uri.params.command.as_deref().ok_or_else(|| {
        Error::Configuration("for 'ext' transport, the command parameter is required".into())
    })?;
    spawn(command, &[]).await
}

/// `ssh` transport: synthesise
/// `ssh [-p PORT] [-l USER] [-T -o BatchMode=yes -e none] HOST NETCAT -U SOCKET`.
pub async fn connect_ssh(uri: &RemoteUri, opts: &DialOptions) -> Result<ExternalProcess> {
    let (program, args) = ssh_command(uri, opts)?;
    spawn(&program, &args).await
}

fn ssh_command(uri: &RemoteUri, opts: &DialOptions) -> Result<(String, Vec<String>)> {
    let program = uri
        .params
        .command
        .clone()
        .unwrap_or_else(|| "ssh".to_string());

    let mut args = Vec::new();
    if let Some(port) = uri.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    if let Some(user) = &uri.username {
        args.push("-l".to_string());
        args.push(user.clone());
    }
    if uri.params.no_tty {
        for opt in ["-T", "-o", "BatchMode=yes", "-e", "none"] {
            args.push(opt.to_string());
        }
    }
    args.push(uri.hostname().to_string());
    args.push(
        uri.params
            .netcat
            .clone()
            .unwrap_or_else(|| "nc".to_string()),
    );
    args.push("-U".to_string());

    let socket = match &uri.params.socket {
        Some(path) => path.clone(),
        None => {
            if opts.read_only {
                unix::SOCKET_PATH_RO.to_string()
            } else {
                unix::SOCKET_PATH.to_string()
            }
        }
    };
    args.push(socket);

    Ok((program, args))
}

impl AsyncRead for ExternalProcess {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ExternalProcess {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}
