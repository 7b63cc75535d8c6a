//! TLS configuration and acceptor.

use crate::config::{TlsConfig, TlsMode};
use crate::error::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Builds the acceptor for the configured mode, or `None` when TLS is off.
pub fn acceptor_for(config: &TlsConfig) -> Result<Option<TlsAcceptor>, ServerError> {
    match config.mode() {
        TlsMode::Disabled => Ok(None),
        TlsMode::ServerOnly | TlsMode::Mutual => create_tls_acceptor(config).map(Some),
    }
}

/// Loads TLS certificates and creates a TLS acceptor.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ServerError> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("cert_path not set".into()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| ServerError::TlsConfig("key_path not set".into()))?;

    let client_ca_path = match (config.require_client_cert, &config.client_ca_path) {
        (true, None) => {
            return Err(ServerError::TlsConfig(
                "client_ca_path not set for mTLS".into(),
            ))
        }
        (true, Some(path)) => Some(path),
        (false, _) => None,
    };

    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no certificate found in {:?}",
            cert_path
        )));
    }
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let server_config = match client_ca_path {
        Some(ca_path) => {
            let client_verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(ca_path)?))
                .build()
                .map_err(|e| {
                    ServerError::TlsConfig(format!("failed to build client verifier: {}", e))
                })?;
            builder
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| ServerError::TlsConfig(format!("invalid server cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_roots(path: &Path) -> Result<RootCertStore, ServerError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(ServerError::TlsConfig(format!(
            "no CA certificate found in {:?}",
            path
        )));
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        .ok_or_else(|| ServerError::TlsConfig(format!("no private key found in {:?}", path)))
}

/// Certificate fixtures minted per test run.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use rustls::pki_types::ServerName;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tokio_rustls::TlsConnector;

    /// A CA plus a server and a client certificate signed by it, written as
    /// PEM files into a temporary directory.
    pub struct Pki {
        pub dir: TempDir,
        pub ca_cert: PathBuf,
        pub server_cert: PathBuf,
        pub server_key: PathBuf,
        pub client_cert: PathBuf,
        pub client_key: PathBuf,
    }

    impl Pki {
        pub fn generate() -> Self {
            let dir = TempDir::new().unwrap();

            let ca_key = KeyPair::generate().unwrap();
            let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            ca_params
                .distinguished_name
                .push(DnType::CommonName, "nfcrelay test CA");
            let ca = ca_params.self_signed(&ca_key).unwrap();

            let server_key = KeyPair::generate().unwrap();
            let server = CertificateParams::new(vec!["localhost".to_string()])
                .unwrap()
                .signed_by(&server_key, &ca, &ca_key)
                .unwrap();

            let client_key = KeyPair::generate().unwrap();
            let client = CertificateParams::new(vec!["reader.local".to_string()])
                .unwrap()
                .signed_by(&client_key, &ca, &ca_key)
                .unwrap();

            let write = |name: &str, pem: String| {
                let path = dir.path().join(name);
                std::fs::write(&path, pem).unwrap();
                path
            };

            Self {
                ca_cert: write("ca.pem", ca.pem()),
                server_cert: write("server.pem", server.pem()),
                server_key: write("server.key", server_key.serialize_pem()),
                client_cert: write("client.pem", client.pem()),
                client_key: write("client.key", client_key.serialize_pem()),
                dir,
            }
        }

        pub fn tls_config(&self, mutual: bool) -> TlsConfig {
            TlsConfig {
                enabled: true,
                cert_path: Some(self.server_cert.clone()),
                key_path: Some(self.server_key.clone()),
                require_client_cert: mutual,
                client_ca_path: mutual.then(|| self.ca_cert.clone()),
            }
        }

        /// Client-side connector trusting the test CA, optionally presenting
        /// the client certificate.
        pub fn connector(&self, with_client_cert: bool) -> (TlsConnector, ServerName<'static>) {
            let roots = load_roots(&self.ca_cert).unwrap();
            let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
            let config = if with_client_cert {
                builder
                    .with_client_auth_cert(
                        load_certs(&self.client_cert).unwrap(),
                        load_private_key(&self.client_key).unwrap(),
                    )
                    .unwrap()
            } else {
                builder.with_no_client_auth()
            };
            (
                TlsConnector::from(Arc::new(config)),
                ServerName::try_from("localhost").unwrap(),
            )
        }
    }
}
