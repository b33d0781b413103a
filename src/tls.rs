//! TLS Bridge: ALPN selection and the certificate/key material behind the
//! `boring`-backed SSL context the QUIC runtime drives the handshake with.
//!
//! The handshake state machine itself (CRYPTO frame transitions per
//! encryption level) is owned by the QUIC runtime's embedded TLS library;
//! this module only supplies the context (leaf cert, chain, key) and the
//! ALPN selection policy.

use std::{fs, path::Path};

use boring::pkey::{PKey, Private};
use boring::ssl::{AlpnError, SslContextBuilder, SslMethod};
use boring::x509::X509;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_quiche::quic::ConnectionHook;
use tokio_quiche::settings::TlsCertificatePaths;

use crate::error::ServerError;

/// Certificate DER bytes generated at build time (see `build.rs`).
const BUILTIN_CERT_DER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/cert.der"));
const BUILTIN_KEY_DER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/key.der"));

/// ALPN identifiers offered by the server, in preference order: `h3` first,
/// then `echo`.
pub const ALPN_H3: &[u8] = b"h3";
pub const ALPN_ECHO: &[u8] = b"echo";

pub struct CertifiedKey {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertifiedKey {
    /// Use the certificate/key embedded at build time.
    pub fn builtin() -> Self {
        Self {
            chain: vec![CertificateDer::from(BUILTIN_CERT_DER.to_vec())],
            key: PrivateKeyDer::try_from(BUILTIN_KEY_DER.to_vec())
                .expect("build.rs emits a PKCS#8 DER key"),
        }
    }

    /// Load a PEM certificate chain and private key from disk, overriding
    /// the build-time embedded pair.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, ServerError> {
        let cert_pem =
            fs::read(cert_path).map_err(|e| ServerError::Cert(format!("reading cert: {e}")))?;
        let key_pem =
            fs::read(key_path).map_err(|e| ServerError::Cert(format!("reading key: {e}")))?;

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| ServerError::Cert(format!("parsing cert chain: {e}")))?;
        if chain.is_empty() {
            return Err(ServerError::Cert("no certificates found in PEM".into()));
        }

        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| ServerError::Cert(format!("parsing private key: {e}")))?
            .ok_or_else(|| ServerError::Cert("no private key found in PEM".into()))?;

        Ok(Self { chain, key })
    }
}

fn der_to_boring_key(key: &PrivateKeyDer) -> Result<PKey<Private>, boring::error::ErrorStack> {
    use boring::ec::EcKey;
    use boring::rsa::Rsa;

    match key {
        PrivateKeyDer::Pkcs8(d) => PKey::private_key_from_der(d.secret_pkcs8_der()),
        PrivateKeyDer::Pkcs1(d) => Ok(PKey::from_rsa(Rsa::private_key_from_der(
            d.secret_pkcs1_der(),
        )?)?),
        PrivateKeyDer::Sec1(d) => Ok(PKey::from_ec_key(EcKey::private_key_from_der(
            d.secret_sec1_der(),
        )?)?),
        _ => {
            tracing::warn!("unsupported private key format");
            Err(PKey::<Private>::private_key_from_der(&[]).unwrap_err())
        }
    }
}

/// Select the first server-offered protocol that also appears in the
/// client's ALPN offer list (wire format: length-prefixed strings).
///
/// Server preference order wins, not the client's: `h3` is tried before
/// `echo` regardless of how the client ordered its offer.
fn alpn_select<'a>(server: &[&[u8]], client: &'a [u8]) -> Option<&'a [u8]> {
    for server_proto in server {
        let mut rest = client;
        while !rest.is_empty() {
            let len = rest[0] as usize;
            if len == 0 || 1 + len > rest.len() {
                break;
            }
            let proto = &rest[1..1 + len];
            rest = &rest[1 + len..];
            if proto == *server_proto {
                return Some(proto);
            }
        }
    }
    None
}

pub struct CertHook {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertHook {
    pub fn new(certified: CertifiedKey) -> Self {
        Self {
            chain: certified.chain,
            key: certified.key,
        }
    }
}

impl ConnectionHook for CertHook {
    fn create_custom_ssl_context_builder(
        &self,
        _settings: TlsCertificatePaths<'_>,
    ) -> Option<SslContextBuilder> {
        let mut builder = SslContextBuilder::new(SslMethod::tls())
            .inspect_err(|err| tracing::error!(%err, "failed to create SSL context"))
            .ok()?;

        let leaf = X509::from_der(self.chain.first()?.as_ref())
            .inspect_err(|err| tracing::error!(%err, "failed to parse leaf certificate DER"))
            .ok()?;
        builder
            .set_certificate(&leaf)
            .inspect_err(|err| tracing::error!(%err, "failed to set leaf certificate"))
            .ok()?;

        for cert_der in self.chain.iter().skip(1) {
            let cert = X509::from_der(cert_der.as_ref())
                .inspect_err(
                    |err| tracing::error!(%err, "failed to parse intermediate certificate DER"),
                )
                .ok()?;
            builder
                .add_extra_chain_cert(cert)
                .inspect_err(
                    |err| tracing::error!(%err, "failed to add intermediate certificate"),
                )
                .ok()?;
        }

        let key = der_to_boring_key(&self.key)
            .inspect_err(|err| tracing::error!(%err, "failed to parse private key"))
            .ok()?;
        builder
            .set_private_key(&key)
            .inspect_err(|err| tracing::error!(%err, "failed to set private key"))
            .ok()?;

        builder.set_alpn_select_callback(move |_, client| {
            alpn_select(&[ALPN_H3, ALPN_ECHO], client).ok_or(AlpnError::NOACK)
        });

        Some(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_h3_regardless_of_client_order() {
        // client offers echo, h3 -- server must still pick h3.
        let mut client = Vec::new();
        client.push(ALPN_ECHO.len() as u8);
        client.extend_from_slice(ALPN_ECHO);
        client.push(ALPN_H3.len() as u8);
        client.extend_from_slice(ALPN_H3);

        let chosen = alpn_select(&[ALPN_H3, ALPN_ECHO], &client);
        assert_eq!(chosen, Some(ALPN_H3));
    }

    #[test]
    fn falls_back_to_echo_when_h3_absent() {
        let mut client = Vec::new();
        client.push(ALPN_ECHO.len() as u8);
        client.extend_from_slice(ALPN_ECHO);

        let chosen = alpn_select(&[ALPN_H3, ALPN_ECHO], &client);
        assert_eq!(chosen, Some(ALPN_ECHO));
    }

    #[test]
    fn rejects_unknown_offer_list() {
        let mut client = Vec::new();
        client.push(3);
        client.extend_from_slice(b"h2c");

        let chosen = alpn_select(&[ALPN_H3, ALPN_ECHO], &client);
        assert_eq!(chosen, None);
    }
}
