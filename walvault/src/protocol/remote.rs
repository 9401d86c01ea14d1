//! Remote worker transports: the same framed protocol over an SSH
//! subprocess or a TLS socket.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use super::{BoxChannel, Channel};
use crate::errors::{Error, Result};

/// Spawn a local worker process of this binary, framed over its stdio.
pub fn spawn_local_worker(stanza: &str, config_args: &[String]) -> Result<(BoxChannel, tokio::process::Child)> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::Execute(format!("unable to find own binary: {e}")))?;

    let mut command = Command::new(exe);
    command
        .arg("worker")
        .arg(format!("--stanza={stanza}"))
        .args(config_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    spawn_channel(command)
}

/// Reach a worker on another host through ssh. Authentication and host keys
/// are the operator's ssh configuration; the engine only runs the command.
pub fn spawn_ssh_worker(
    host: &str,
    user: Option<&str>,
    stanza: &str,
    config_args: &[String],
) -> Result<(BoxChannel, tokio::process::Child)> {
    let mut command = Command::new("ssh");
    command.arg("-o").arg("BatchMode=yes");
    match user {
        Some(user) => command.arg(format!("{user}@{host}")),
        None => command.arg(host),
    };
    command
        .arg("walvault")
        .arg("worker")
        .arg(format!("--stanza={stanza}"))
        .args(config_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    spawn_channel(command)
}

fn spawn_channel(mut command: Command) -> Result<(BoxChannel, tokio::process::Child)> {
    let mut child = command
        .spawn()
        .map_err(|e| Error::Execute(format!("unable to spawn worker: {e}")))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Execute("worker has no stdout".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Execute("worker has no stdin".into()))?;

    Ok((
        Channel::new(
            Box::new(stdout) as Box<dyn AsyncRead + Send + Unpin>,
            Box::new(stdin) as Box<dyn AsyncWrite + Send + Unpin>,
        ),
        child,
    ))
}

/// Connect to a TLS-served worker. The CA bundle comes from the webpki
/// roots plus an optional additional PEM file.
pub async fn connect_tls_worker(
    host: &str,
    port: u16,
    ca_file: Option<&camino::Utf8Path>,
) -> Result<BoxChannel> {
    let mut roots = tokio_rustls::rustls::RootCertStore::empty();
    if let Some(ca_file) = ca_file {
        let pem = std::fs::read(ca_file)
            .map_err(|e| Error::FileOpen(format!("CA file '{ca_file}': {e}")))?;
        let certs = rustls_pemfile::certs(&mut pem.as_slice())
            .map_err(|e| Error::Format(format!("CA file '{ca_file}': {e}")))?;
        for cert in certs {
            roots
                .add(&tokio_rustls::rustls::Certificate(cert))
                .map_err(|e| Error::Format(format!("CA file '{ca_file}': {e}")))?;
        }
    }

    let config = tokio_rustls::rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let stream = tokio::net::TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::HostConnect(format!("unable to connect to '{host}:{port}': {e}")))?;

    let server_name = tokio_rustls::rustls::ServerName::try_from(host)
        .map_err(|e| Error::HostInvalid(format!("'{host}': {e}")))?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::HostConnect(format!("TLS handshake with '{host}:{port}': {e}")))?;

    let (reader, writer) = tokio::io::split(tls);
    Ok(Channel::new(
        Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>,
        Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
    ))
}
