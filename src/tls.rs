//! TLS session establishment and X.509 verification.
//!
//! Credentials (CA bundle, client certificate and key) are loaded once per
//! process and shared by every connection. After the handshake the server
//! performs its own check of the client certificate and source address and
//! signals acceptance with a single `0x01` byte; anything else is fatal.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

const CA_CERT: &str = "/etc/pki/CA/cacert.pem";
const CLIENT_CERT: &str = "/etc/pki/libvirt/clientcert.pem";
const CLIENT_KEY: &str = "/etc/pki/libvirt/private/clientkey.pem";

#[derive(Debug)]
struct Credentials {
    roots: RootCertStore,
    client_chain: Vec<CertificateDer<'static>>,
    client_key: PrivateKeyDer<'static>,
}

/// Loaded once; the first caller's pkipath wins, later connections share
/// the same handle.
static CREDENTIALS: Mutex<Option<Arc<Credentials>>> = Mutex::new(None);

/// Perform the client handshake on a connected TCP stream and consume the
/// server's acceptance byte.
pub async fn handshake(
    stream: TcpStream,
    hostname: &str,
    pkipath: Option<&str>,
    no_verify: bool,
) -> Result<TlsStream<TcpStream>> {
    if std::env::var("LIBVIRT_GNUTLS_DEBUG").is_ok() {
        tracing::debug!(%hostname, no_verify, "starting TLS handshake");
    }

    let creds = credentials(pkipath)?;
    let config = client_config(&creds, no_verify)?;

    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Configuration(format!("invalid TLS server name '{hostname}'")))?;

    let connector = TlsConnector::from(Arc::new(config));
    let mut tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| match e.kind() {
            // rustls surfaces verification failures as InvalidData.
            std::io::ErrorKind::InvalidData => {
                Error::Authentication(format!("server certificate failed validation: {e}"))
            }
            _ => Error::Transport(format!("unable to complete TLS handshake: {e}")),
        })?;

    let mut confirm = [0u8; 1];
    tls.read_exact(&mut confirm).await.map_err(|e| {
        Error::Authentication(format!(
            "server verification (of our certificate or IP address) failed: {e}"
        ))
    })?;
    if confirm[0] != 0x01 {
        return Err(Error::Authentication(
            "server verification (of our certificate or IP address) failed".into(),
        ));
    }

    Ok(tls)
}

fn credentials(pkipath: Option<&str>) -> Result<Arc<Credentials>> {
    let mut guard = CREDENTIALS.lock();
    if let Some(creds) = &*guard {
        return Ok(creds.clone());
    }

    let (cacert, clientcert, clientkey) = resolve_paths(pkipath);
    let creds = Arc::new(load(&cacert, &clientcert, &clientkey)?);
    *guard = Some(creds.clone());
    Ok(creds)
}

/// Certificate locations: an explicit pkipath overrides everything, then a
/// per-user PKI directory, then the system-wide defaults. The user CA and
/// the user cert/key pair fall back independently so a partial user setup
/// is never mixed and matched within the pair.
fn resolve_paths(pkipath: Option<&str>) -> (PathBuf, PathBuf, PathBuf) {
    if let Some(dir) = pkipath {
        let dir = Path::new(dir);
        return (
            dir.join("cacert.pem"),
            dir.join("clientcert.pem"),
            dir.join("clientkey.pem"),
        );
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_pki = Path::new(&home).join(".pki/libvirt");

        let cacert = {
            let user = user_pki.join("cacert.pem");
            if user.is_file() { user } else { PathBuf::from(CA_CERT) }
        };

        let user_cert = user_pki.join("clientcert.pem");
        let user_key = user_pki.join("clientkey.pem");
        if user_cert.is_file() && user_key.is_file() {
            return (cacert, user_cert, user_key);
        }
        return (cacert, PathBuf::from(CLIENT_CERT), PathBuf::from(CLIENT_KEY));
    }

    (
        PathBuf::from(CA_CERT),
        PathBuf::from(CLIENT_CERT),
        PathBuf::from(CLIENT_KEY),
    )
}

fn load(cacert: &Path, clientcert: &Path, clientkey: &Path) -> Result<Credentials> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(cacert, "CA certificate")? {
        roots
            .add(cert)
            .map_err(|e| Error::Configuration(format!("unable to load CA certificate: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::Configuration(format!(
            "no CA certificates found in '{}'",
            cacert.display()
        )));
    }

    let client_chain = read_certs(clientcert, "client certificate")?;
    let client_key = read_key(clientkey)?;

    Ok(Credentials {
        roots,
        client_chain,
        client_key,
    })
}

fn read_certs(path: &Path, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Configuration(format!("cannot access {what} '{}': {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Configuration(format!("unable to parse {what} '{}': {e}", path.display())))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| {
        Error::Configuration(format!("cannot access client key '{}': {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| {
            Error::Configuration(format!("unable to parse client key '{}': {e}", path.display()))
        })?
        .ok_or_else(|| {
            Error::Configuration(format!("no private key found in '{}'", path.display()))
        })
}

fn client_config(creds: &Credentials, no_verify: bool) -> Result<ClientConfig> {
    let builder = ClientConfig::builder();

    let mut config = if no_verify {
        let strict = WebPkiServerVerifier::builder(Arc::new(creds.roots.clone()))
            .build()
            .map_err(|e| Error::Configuration(format!("unable to build verifier: {e}")))?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(LenientVerifier { strict }))
            .with_client_auth_cert(creds.client_chain.clone(), creds.client_key.clone_key())
    } else {
        builder
            .with_root_certificates(creds.roots.clone())
            .with_client_auth_cert(creds.client_chain.clone(), creds.client_key.clone_key())
    }
    .map_err(|e| Error::Configuration(format!("unable to load client certificate: {e}")))?;

    config.enable_sni = true;
    Ok(config)
}

/// Runs full verification but only records the outcome: the connection
/// proceeds, matching `no_verify=1` semantics.
#[derive(Debug)]
struct LenientVerifier {
    strict: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for LenientVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.strict.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(ok) => Ok(ok),
            Err(e) => {
                tracing::warn!(error = %e, "server certificate failed validation, continuing anyway");
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.strict.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.strict.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.strict.supported_verify_schemes()
    }
}
