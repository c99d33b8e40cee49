//! TLS for the peer link: mutual auth with a private CA. Both sides
//! present a certificate signed by the configured CA file.
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use dynconfig::TlsIdentity;
use haven_core::prelude::*;

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::validation(format!("opening {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::validation(format!("parsing certs in {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::validation(format!("opening {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::validation(format!("parsing key in {}: {e}", path.display())))?
        .ok_or_else(|| Error::validation(format!("no private key in {}", path.display())))
}

fn root_store(identity: &TlsIdentity) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&identity.ca)? {
        roots
            .add(cert)
            .map_err(|e| Error::validation(format!("adding ca cert: {e}")))?;
    }
    Ok(roots)
}

/// Acceptor for the listening side, requiring a client certificate
/// signed by our CA.
pub(crate) fn acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor> {
    let roots = root_store(identity)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::validation(format!("building client verifier: {e}")))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(&identity.cert)?, load_key(&identity.key)?)
        .map_err(|e| Error::validation(format!("building tls server config: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for the dialing side, presenting our certificate.
pub(crate) fn connector(identity: &TlsIdentity) -> Result<TlsConnector> {
    let roots = root_store(identity)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(&identity.cert)?, load_key(&identity.key)?)
        .map_err(|e| Error::validation(format!("building tls client config: {e}")))?;
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The name the dialing side verifies: configured override, or the host
/// part of the peer address.
pub(crate) fn server_name(identity: &TlsIdentity, peer_host: &str) -> Result<ServerName<'static>> {
    let name = identity
        .server_name
        .clone()
        .unwrap_or_else(|| peer_host.to_string());
    ServerName::try_from(name)
        .map_err(|e| Error::validation(format!("invalid tls server name: {e}")))
}
