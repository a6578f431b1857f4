use std::{path::Path, sync::Arc};

use tokio_rustls::{
	TlsAcceptor,
	rustls::{
		ServerConfig,
		pki_types::{CertificateDer, PrivateKeyDer},
	},
};

use crate::error::ReceiverError;

/// Build a TLS acceptor from PEM cert and key files.
///
/// Certificate provisioning is the host's problem; this only loads what it
/// is given.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ReceiverError> {
	let certs = load_certs(cert_path)?;
	let key = load_key(key_path)?;

	let config = ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.map_err(|err| ReceiverError::Validation(format!("TLS config: {err}")))?;

	Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ReceiverError> {
	let pem = std::fs::read(path)?;
	let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
		.collect::<Result<_, _>>()
		.map_err(|err| ReceiverError::Validation(format!("reading {path:?}: {err}")))?;
	if certs.is_empty() {
		return Err(ReceiverError::Validation(format!(
			"no certificates found in {path:?}"
		)));
	}
	Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ReceiverError> {
	let pem = std::fs::read(path)?;
	rustls_pemfile::private_key(&mut pem.as_slice())
		.map_err(|err| ReceiverError::Validation(format!("reading {path:?}: {err}")))?
		.ok_or_else(|| ReceiverError::Validation(format!("no private key found in {path:?}")))
}
