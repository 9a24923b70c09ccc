//! rustls configuration shared by the route clients and the TLS listeners.
use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use eyre::{Result, WrapErr, eyre};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
};
use rustls_native_certs::load_native_certs;

use crate::config::{CertificateConfig, TlsConfig};

/// Install aws-lc-rs as the process crypto provider if none is set yet.
pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(
        File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .wrap_err_with(|| format!("failed to parse certificates in {}", path.display()))?;

    if certs.is_empty() {
        return Err(eyre!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>> {
    let path = path.as_ref();
    let mut reader = BufReader::new(
        File::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .wrap_err_with(|| format!("failed to parse private key in {}", path.display()))?
        .ok_or_else(|| eyre!("no private key found in {}", path.display()))
}

/// Platform trust anchors.
pub fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native_certs = load_native_certs();

    for cert in native_certs.certs {
        if roots.add(cert).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }
    tracing::debug!("Loaded {} native root certificates", roots.len());
    roots
}

/// Client configuration for dialling secured routes.
///
/// Trusts the platform roots plus the profile's `ca_path`; presents the profile's client
/// certificate when one is configured.
pub fn client_config(profile: Option<&CertificateConfig>) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();

    let mut roots = native_roots();
    if let Some(ca_path) = profile.and_then(|p| p.ca_path.as_deref()) {
        for cert in load_certs(ca_path)? {
            roots
                .add(cert)
                .wrap_err_with(|| format!("invalid trust anchor in {ca_path}"))?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    match profile.map(|p| (p.cert_path.as_deref(), p.key_path.as_deref())) {
        Some((Some(cert_path), Some(key_path))) => builder
            .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
            .wrap_err("invalid client certificate or key"),
        Some((Some(_), None)) | Some((None, Some(_))) => Err(eyre!(
            "client certificate and key must be configured together"
        )),
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Server configuration for the HTTPS ingress and `tls` channel listeners.
///
/// With `client_ca_path` set, clients may present a certificate signed by that CA; callers
/// without one are still accepted.
pub fn server_config(tls: &TlsConfig) -> Result<rustls::ServerConfig> {
    ensure_crypto_provider();

    let certs = load_certs(&tls.cert_path)?;
    let key = load_private_key(&tls.key_path)?;

    let builder = rustls::ServerConfig::builder();
    let builder = match &tls.client_ca_path {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .wrap_err_with(|| format!("invalid client CA in {ca_path}"))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .wrap_err("failed to build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(certs, key)
        .wrap_err("invalid server certificate or key")
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn pem_files() -> (NamedTempFile, NamedTempFile) {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let mut cert = NamedTempFile::new().unwrap();
        cert.write_all(generated.cert.pem().as_bytes()).unwrap();
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(generated.signing_key.serialize_pem().as_bytes())
            .unwrap();
        (cert, key)
    }

    #[test]
    fn test_load_cert_and_key() {
        let (cert, key) = pem_files();
        assert_eq!(load_certs(cert.path()).unwrap().len(), 1);
        assert!(load_private_key(key.path()).is_ok());
        assert!(load_certs(key.path()).is_err());
    }

    #[test]
    fn test_server_config_with_optional_client_auth() {
        let (cert, key) = pem_files();
        let tls = TlsConfig {
            cert_path: cert.path().to_string_lossy().into_owned(),
            key_path: key.path().to_string_lossy().into_owned(),
            client_ca_path: Some(cert.path().to_string_lossy().into_owned()),
        };
        assert!(server_config(&tls).is_ok());
    }

    #[test]
    fn test_client_config_requires_key_with_cert() {
        let (cert, _key) = pem_files();
        let profile = CertificateConfig {
            ca_path: Some(cert.path().to_string_lossy().into_owned()),
            cert_path: Some(cert.path().to_string_lossy().into_owned()),
            key_path: None,
        };
        assert!(client_config(Some(&profile)).is_err());
        assert!(client_config(None).is_ok());
    }
}
