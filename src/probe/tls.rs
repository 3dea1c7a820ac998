//! TLS client handshakes for probes, with leaf-certificate expiry capture.

use chrono::{DateTime, NaiveDateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::ProbeError;

static VERIFYING: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static PERMISSIVE: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Accepts any server certificate. Used when a check sets `ignore_ssl_error`.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for e in &loaded.errors {
        tracing::warn!("TLS: failed to load a native root certificate: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    tracing::debug!("TLS: loaded {} native roots ({} ignored)", added, ignored);
    roots
}

fn build_config(ignore_errors: bool) -> Result<Arc<ClientConfig>, ProbeError> {
    let provider = Arc::new(ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Tls(e.to_string()))?;

    let config = if ignore_errors {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(native_roots())
            .with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Shared client configuration, built once per verification mode.
pub fn client_config(ignore_errors: bool) -> Result<Arc<ClientConfig>, ProbeError> {
    let cell = if ignore_errors { &PERMISSIVE } else { &VERIFYING };
    if let Some(config) = cell.get() {
        return Ok(config.clone());
    }
    let config = build_config(ignore_errors)?;
    Ok(cell.get_or_init(|| config).clone())
}

/// Perform a client handshake over `stream` and report the leaf certificate's
/// `notAfter`.
pub async fn handshake<S>(
    stream: S,
    host: &str,
    ignore_errors: bool,
) -> Result<(TlsStream<S>, Option<DateTime<Utc>>), ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::Config(format!("invalid TLS server name {:?}: {}", host, e)))?;
    let connector = TlsConnector::from(client_config(ignore_errors)?);
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProbeError::Tls(e.to_string()))?;

    let not_after = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .and_then(|leaf| certificate_not_after(leaf.as_ref()));
    Ok((tls, not_after))
}

/// Read one DER TLV, returning (tag, content, rest).
fn read_tlv(buf: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = buf.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = if first < 0x80 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return None;
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

fn parse_asn1_time(tag: u8, raw: &[u8]) -> Option<DateTime<Utc>> {
    let s = std::str::from_utf8(raw).ok()?;
    let full = match tag {
        // UTCTime: YYMMDDHHMMSSZ
        0x17 => {
            let yy: u32 = s.get(..2)?.parse().ok()?;
            let century = if yy < 50 { "20" } else { "19" };
            format!("{}{}", century, s)
        }
        // GeneralizedTime: YYYYMMDDHHMMSSZ
        0x18 => s.to_string(),
        _ => return None,
    };
    let naive = NaiveDateTime::parse_from_str(&full, "%Y%m%d%H%M%SZ").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Extract `validity.notAfter` from an X.509 certificate.
pub fn certificate_not_after(der: &[u8]) -> Option<DateTime<Utc>> {
    let (0x30, cert, _) = read_tlv(der)? else {
        return None;
    };
    let (0x30, tbs, _) = read_tlv(cert)? else {
        return None;
    };

    let mut rest = tbs;
    let (tag, _, after) = read_tlv(rest)?;
    // Optional explicit [0] version.
    if tag == 0xa0 {
        rest = after;
    }
    // serialNumber, signature, issuer
    for _ in 0..3 {
        let (_, _, after) = read_tlv(rest)?;
        rest = after;
    }
    let (0x30, validity, _) = read_tlv(rest)? else {
        return None;
    };
    let (_, _, after_not_before) = read_tlv(validity)?;
    let (tag, not_after, _) = read_tlv(after_not_before)?;
    parse_asn1_time(tag, not_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        if content.len() < 0x80 {
            out.push(content.len() as u8);
        } else {
            out.push(0x82);
            out.extend_from_slice(&(content.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(content);
        out
    }

    fn fake_cert(not_after: (u8, &str)) -> Vec<u8> {
        let version = tlv(0xa0, &tlv(0x02, &[2]));
        let serial = tlv(0x02, &[1, 2, 3]);
        let sig = tlv(0x30, &tlv(0x06, &[42, 134, 72]));
        let issuer = tlv(0x30, &[0u8; 200]);
        let validity = tlv(
            0x30,
            &[
                tlv(0x17, b"240101000000Z"),
                tlv(not_after.0, not_after.1.as_bytes()),
            ]
            .concat(),
        );
        let tbs = tlv(0x30, &[version, serial, sig, issuer, validity].concat());
        tlv(0x30, &tbs)
    }

    #[test]
    fn test_not_after_utc_time() {
        let der = fake_cert((0x17, "251231235959Z"));
        assert_eq!(
            certificate_not_after(&der),
            Some(Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap())
        );
    }

    #[test]
    fn test_not_after_generalized_time() {
        let der = fake_cert((0x18, "20510615120000Z"));
        assert_eq!(
            certificate_not_after(&der),
            Some(Utc.with_ymd_and_hms(2051, 6, 15, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_truncated_der() {
        let der = fake_cert((0x17, "251231235959Z"));
        assert_eq!(certificate_not_after(&der[..40]), None);
        assert_eq!(certificate_not_after(&[]), None);
    }
}
