#![cfg(unix)]

//! Local UNIX socket transport. Handles the system read-write and
//! read-only sockets, per-user session sockets (abstract, `@`-prefixed),
//! and autostarting a session daemon when nothing is listening yet.

use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::transport::DialOptions;

/// System instance, read-write.
pub const SOCKET_PATH: &str = "/var/run/libvirt/libvirt-sock";
/// System instance, read-only.
pub const SOCKET_PATH_RO: &str = "/var/run/libvirt/libvirt-sock-ro";

/// Daemon binary candidates when `LIBVIRTD_PATH` is unset.
const DAEMON_PATHS: &[&str] = &["/usr/sbin/libvirtd", "/usr/local/sbin/libvirtd"];

/// Idle-exit timeout handed to an autostarted daemon, in seconds.
const DAEMON_IDLE_TIMEOUT: &str = "30";

const AUTOSTART_RETRIES: u32 = 20;

/// Resolve the socket path for this connection. A leading `@` marks an
/// abstract-namespace socket.
pub fn socket_path(explicit: Option<&str>, opts: &DialOptions) -> Result<String> {
    if let Some(path) = explicit {
        return Ok(path.to_string());
    }
    if opts.user_session {
        let home = std::env::var("HOME")
            .map_err(|_| Error::Configuration("cannot determine home directory".into()))?;
        return Ok(format!("@{home}/.libvirt/libvirt-sock"));
    }
    Ok(if opts.read_only {
        SOCKET_PATH_RO.to_string()
    } else {
        SOCKET_PATH.to_string()
    })
}

/// Connect to the socket, optionally spawning the local daemon and
/// retrying with linear backoff when the first attempt is refused.
pub async fn connect(path: &str, opts: &DialOptions) -> Result<UnixStream> {
    let autostart = opts.autostart && std::env::var("LIBVIRT_AUTOSTART").as_deref() != Ok("0");

    let mut trials = 0u32;
    loop {
        match dial(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused
                && autostart
                && trials < AUTOSTART_RETRIES =>
            {
                // Several clients may race to start the daemon; the losers'
                // daemons fail to bind and exit on their own.
                if trials == 0 {
                    spawn_daemon()?;
                }
                trials += 1;
                tokio::time::sleep(Duration::from_millis(100 * u64::from(trials))).await;
            }
            Err(e) => {
                return Err(Error::ConnectFailed {
                    endpoint: path.to_string(),
                    attempts: trials + 1,
                    reason: format!("{e}; the daemon may need to be started"),
                });
            }
        }
    }
}

async fn dial(path: &str) -> std::io::Result<UnixStream> {
    match path.strip_prefix('@') {
        Some(name) => dial_abstract(name),
        None => UnixStream::connect(path).await,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn dial_abstract(name: &str) -> std::io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn dial_abstract(_name: &str) -> std::io::Result<UnixStream> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        "abstract sockets are not supported on this platform",
    ))
}

fn daemon_path() -> Result<String> {
    if let Ok(custom) = std::env::var("LIBVIRTD_PATH") {
        return Ok(custom);
    }
    for candidate in DAEMON_PATHS {
        if std::path::Path::new(candidate).is_file() {
            return Ok((*candidate).to_string());
        }
    }
    Err(Error::Configuration("failed to find daemon binary".into()))
}

fn spawn_daemon() -> Result<()> {
    let path = daemon_path()?;
    tracing::debug!(daemon = %path, "autostarting local daemon");
    Command::new(&path)
        .arg("--timeout")
        .arg(DAEMON_IDLE_TIMEOUT)
        .arg("--daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| Error::Transport(format!("failed to launch daemon '{path}': {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    fn opts() -> DialOptions {
        DialOptions::default()
    }

    #[test]
    fn path_resolution() {
        let explicit = socket_path(Some("/tmp/x.sock"), &opts()).unwrap();
        assert_eq!(explicit, "/tmp/x.sock");

        assert_eq!(socket_path(None, &opts()).unwrap(), SOCKET_PATH);

        let ro = DialOptions {
            read_only: true,
            ..opts()
        };
        assert_eq!(socket_path(None, &ro).unwrap(), SOCKET_PATH_RO);

        let session = DialOptions {
            user_session: true,
            ..opts()
        };
        let path = socket_path(None, &session).unwrap();
        assert!(path.starts_with('@'), "session socket is abstract: {path}");
        assert!(path.ends_with("/.libvirt/libvirt-sock"));
    }

    #[tokio::test]
    async fn connects_to_listening_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let path_str = path.to_str().unwrap().to_string();
        let client = tokio::spawn(async move {
            connect(&path_str, &DialOptions::default()).await.unwrap()
        });

        let (mut server, _) = listener.accept().await.unwrap();
        let mut stream = client.await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn refused_without_autostart_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobody.sock");
        let err = connect(path.to_str().unwrap(), &DialOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::ConnectFailed { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
