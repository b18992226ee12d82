//! Client-side TLS for outbound adapters: native roots, configurable SNI,
//! and an opt-in skip-verify mode.

use std::sync::Arc;

use anyhow::Context as _;
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;

pub fn provider() -> Arc<CryptoProvider> {
	Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds a client config with the platform trust store. When
/// `skip_verify` is set, certificate validation is disabled entirely; this
/// is a documented operator risk, not a default.
pub fn client_config(skip_verify: bool) -> anyhow::Result<Arc<ClientConfig>> {
	let builder = ClientConfig::builder_with_provider(provider())
		.with_safe_default_protocol_versions()
		.context("tls protocol versions")?;
	let config = if skip_verify {
		builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(insecure::NoVerifier))
			.with_no_client_auth()
	} else {
		let mut roots = RootCertStore::empty();
		for cert in rustls_native_certs::load_native_certs().certs {
			// A single unparsable platform cert should not block startup.
			let _ = roots.add(cert);
		}
		builder.with_root_certificates(roots).with_no_client_auth()
	};
	Ok(Arc::new(config))
}

pub fn server_name(sni: &str) -> anyhow::Result<ServerName<'static>> {
	ServerName::try_from(sni.to_string()).context("invalid sni")
}

pub mod insecure {
	use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
	use rustls::{DigitallySignedStruct, SignatureScheme};
	use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

	#[derive(Debug)]
	pub struct NoVerifier;

	impl ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &CertificateDer,
			_intermediates: &[CertificateDer],
			_server_name: &ServerName,
			_ocsp_response: &[u8],
			_now: UnixTime,
		) -> Result<ServerCertVerified, rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &CertificateDer,
			_dss: &DigitallySignedStruct,
		) -> Result<HandshakeSignatureValid, rustls::Error> {
			Ok(HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
			vec![
				SignatureScheme::RSA_PKCS1_SHA256,
				SignatureScheme::ECDSA_NISTP256_SHA256,
				SignatureScheme::RSA_PKCS1_SHA384,
				SignatureScheme::ECDSA_NISTP384_SHA384,
				SignatureScheme::RSA_PKCS1_SHA512,
				SignatureScheme::ECDSA_NISTP521_SHA512,
				SignatureScheme::RSA_PSS_SHA256,
				SignatureScheme::RSA_PSS_SHA384,
				SignatureScheme::RSA_PSS_SHA512,
				SignatureScheme::ED25519,
			]
		}
	}
}
