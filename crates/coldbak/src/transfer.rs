use std::{
	collections::{BTreeSet, HashMap, HashSet},
	num::NonZeroU64,
	path::Path,
	sync::Arc,
};

use tokio::{net::TcpStream, sync::mpsc};
use tokio_rustls::{
	TlsConnector,
	rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use coldbak_proto::{
	PROTOCOL_VERSION, auth,
	chunk::{ChunkHeader, FileChunker},
	error::ProtocolError,
	message::{Begin, Chunk, ChunkOutcome, FinalizeOutcome, Hello, Message},
	metadata::FileMetadata,
};

use crate::error::BackupError;

/// Most chunks allowed in flight before waiting on acknowledgements.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone)]
pub struct TransferClient {
	pub host: String,
	pub port: u16,
	pub tls: bool,
	pub client_id: String,
	pub client_secret: String,
	pub chunk_size: NonZeroU64,
	pub max_in_flight: usize,
}

/// What a finished transfer looked like.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
	pub transfer_id: String,
	pub remote_path: String,
	pub bytes_sent: u64,
	pub chunks: Vec<ChunkHeader>,
}

impl TransferClient {
	/// Stream one archive to the receiver, resuming where possible.
	///
	/// `on_token` fires whenever the receiver hands out a resume token, so
	/// the caller can persist it before anything else goes wrong.
	#[instrument(level = "debug", skip_all, fields(host = %self.host, port = self.port, file = %metadata.name))]
	pub async fn send_file(
		&self,
		archive: &Path,
		metadata: &FileMetadata,
		resume_token: Option<&str>,
		on_token: &(dyn Fn(&str) + Send + Sync),
		on_progress: &(dyn Fn(u64, u64) + Send + Sync),
		cancel: &CancellationToken,
	) -> Result<TransferOutcome, BackupError> {
		let tcp = TcpStream::connect((self.host.as_str(), self.port))
			.await
			.map_err(|err| BackupError::TransferNetwork(format!("connecting: {err}")))?;

		if self.tls {
			let stream = self.connect_tls(tcp).await?;
			self.run_over(stream, archive, metadata, resume_token, on_token, on_progress, cancel)
				.await
		} else {
			self.run_over(tcp, archive, metadata, resume_token, on_token, on_progress, cancel)
				.await
		}
	}

	async fn connect_tls(
		&self,
		tcp: TcpStream,
	) -> Result<tokio_rustls::client::TlsStream<TcpStream>, BackupError> {
		let mut roots = RootCertStore::empty();
		let native = rustls_native_certs::load_native_certs();
		for cert in native.certs {
			if let Err(err) = roots.add(cert) {
				warn!("skipping unusable native certificate: {err}");
			}
		}

		let config = ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		let connector = TlsConnector::from(Arc::new(config));
		let server_name = ServerName::try_from(self.host.clone())
			.map_err(|err| BackupError::TransferNetwork(format!("invalid server name: {err}")))?;

		connector
			.connect(server_name, tcp)
			.await
			.map_err(|err| BackupError::TransferNetwork(format!("TLS handshake: {err}")))
	}

	/// The whole protocol over an established stream.
	pub(crate) async fn run_over<S>(
		&self,
		mut stream: S,
		archive: &Path,
		metadata: &FileMetadata,
		resume_token: Option<&str>,
		on_token: &(dyn Fn(&str) + Send + Sync),
		on_progress: &(dyn Fn(u64, u64) + Send + Sync),
		cancel: &CancellationToken,
	) -> Result<TransferOutcome, BackupError>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	{
		self.hello(&mut stream).await?;
		let (transfer_id, completed) = self
			.negotiate(&mut stream, metadata, resume_token, on_token)
			.await?;

		let mut chunker = FileChunker::open(archive, self.chunk_size)
			.await
			.map_err(|err| BackupError::TransferNetwork(format!("opening archive: {err}")))?;
		if chunker.len() != metadata.size {
			return Err(BackupError::Validation(
				"archive changed size since it was hashed".into(),
			));
		}

		let total = metadata.size;
		let count = chunker.chunk_count();
		let mut bytes_sent: u64 = completed
			.iter()
			.map(|index| expected_len(total, self.chunk_size, *index, count))
			.sum();
		on_progress(bytes_sent, total);
		info!(
			transfer_id = %transfer_id,
			resumed_chunks = completed.len(),
			total_chunks = count,
			"transfer negotiated"
		);

		let (mut reader, mut writer) = tokio::io::split(stream);
		let (ack_tx, mut ack_rx) = mpsc::channel::<Result<Message, ProtocolError>>(64);
		tokio::spawn(async move {
			loop {
				let message = Message::read_from(&mut reader).await;
				let done = message.is_err();
				if ack_tx.send(message).await.is_err() || done {
					break;
				}
			}
		});

		let mut chunks: Vec<ChunkHeader> = Vec::with_capacity(count as usize);
		let mut to_send = (0..count).filter(|index| !completed.contains(index));
		let mut in_flight: HashMap<u64, ChunkHeader> = HashMap::new();
		let mut conflict_retried: HashSet<u64> = HashSet::new();
		let max_in_flight = self.max_in_flight.max(1);

		loop {
			while in_flight.len() < max_in_flight {
				let Some(index) = to_send.next() else { break };
				let (header, bytes) = read_chunk(&mut chunker, index).await?;
				debug!(index, len = header.length, "sending chunk");
				Message::Chunk(Chunk {
					index,
					length: header.length,
					md5: header.md5.clone(),
					bytes,
				})
				.write_to(&mut writer)
				.await?;
				in_flight.insert(index, header);
			}

			if in_flight.is_empty() {
				break;
			}

			let ack = tokio::select! {
				() = cancel.cancelled() => return Err(BackupError::Cancelled),
				ack = ack_rx.recv() => ack,
			};
			let message = match ack {
				Some(Ok(message)) => message,
				Some(Err(err)) => return Err(network(err)),
				None => return Err(BackupError::TransferNetwork("connection lost".into())),
			};

			let Message::ChunkAck(ack) = message else {
				return Err(BackupError::Protocol(ProtocolError::UnexpectedMessage {
					got: message.name(),
					expected: "CHUNK_ACK",
				}));
			};

			match ack.outcome {
				ChunkOutcome::Ok | ChunkOutcome::AlreadyPresent => {
					// UNWRAP: the server only acks chunks we sent
					let header = in_flight.remove(&ack.index).unwrap();
					bytes_sent += header.length;
					chunks.push(header);
					on_progress(bytes_sent, total);
				}
				ChunkOutcome::Error(code) if code == "ChunkConflict" => {
					if !conflict_retried.insert(ack.index) {
						return Err(BackupError::ChunkConflict { index: ack.index });
					}
					warn!(index = ack.index, "chunk conflict, re-sending");
					let (header, bytes) = read_chunk(&mut chunker, ack.index).await?;
					Message::Chunk(Chunk {
						index: ack.index,
						length: header.length,
						md5: header.md5.clone(),
						bytes,
					})
					.write_to(&mut writer)
					.await?;
				}
				ChunkOutcome::Error(code) => {
					return Err(BackupError::TransferNetwork(format!(
						"chunk {} rejected: {code}",
						ack.index
					)));
				}
			}
		}

		// Finalize; one round of filling in whatever the receiver says is
		// missing, then give up.
		for round in 0..2 {
			if cancel.is_cancelled() {
				return Err(BackupError::Cancelled);
			}
			Message::Finalize.write_to(&mut writer).await?;

			let reply = match ack_rx.recv().await {
				Some(Ok(message)) => message,
				Some(Err(err)) => return Err(network(err)),
				None => return Err(BackupError::TransferNetwork("connection lost".into())),
			};
			let Message::FinalizeAck(ack) = reply else {
				return Err(BackupError::Protocol(ProtocolError::UnexpectedMessage {
					got: reply.name(),
					expected: "FINALIZE_ACK",
				}));
			};

			match ack.outcome {
				FinalizeOutcome::Ok { path } => {
					info!(remote_path = %path, "transfer finalized");
					chunks.sort_by_key(|header| header.index);
					return Ok(TransferOutcome {
						transfer_id,
						remote_path: path,
						bytes_sent,
						chunks,
					});
				}
				FinalizeOutcome::IntegrityFailure => return Err(BackupError::IntegrityFailure),
				FinalizeOutcome::MissingChunks(missing) if round == 0 => {
					warn!(missing = missing.len(), "receiver reports missing chunks, re-sending");
					for index in missing {
						let (header, bytes) = read_chunk(&mut chunker, index).await?;
						Message::Chunk(Chunk {
							index,
							length: header.length,
							md5: header.md5.clone(),
							bytes,
						})
						.write_to(&mut writer)
						.await?;
						match ack_rx.recv().await {
							Some(Ok(Message::ChunkAck(_))) => {}
							Some(Ok(other)) => {
								return Err(BackupError::Protocol(
									ProtocolError::UnexpectedMessage {
										got: other.name(),
										expected: "CHUNK_ACK",
									},
								));
							}
							Some(Err(err)) => return Err(network(err)),
							None => {
								return Err(BackupError::TransferNetwork(
									"connection lost".into(),
								));
							}
						}
					}
				}
				FinalizeOutcome::MissingChunks(missing) => {
					return Err(BackupError::TransferNetwork(format!(
						"receiver still missing {} chunk(s) after re-send",
						missing.len()
					)));
				}
			}
		}

		Err(BackupError::TransferNetwork("finalize did not converge".into()))
	}

	async fn hello<S>(&self, stream: &mut S) -> Result<(), BackupError>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let token = auth::encode_credentials(&self.client_id, &self.client_secret)
			.map_err(|err| BackupError::Validation(err.to_string()))?;
		Message::Hello(Hello {
			version: PROTOCOL_VERSION,
			token,
		})
		.write_to(stream)
		.await?;

		match Message::read_from(stream).await.map_err(network)? {
			Message::HelloAck(ack) if ack.accepted => {
				debug!(session_id = %ack.session_id, "session accepted");
				Ok(())
			}
			Message::HelloAck(ack) => {
				let code = ack.error.unwrap_or_else(|| "rejected".into());
				Err(match code.as_str() {
					"ProtocolVersionMismatch" => {
						BackupError::TransferNetwork("protocol version mismatch".into())
					}
					_ => BackupError::AuthRejected(code),
				})
			}
			other => Err(BackupError::Protocol(ProtocolError::UnexpectedMessage {
				got: other.name(),
				expected: "HELLO_ACK",
			})),
		}
	}

	/// BEGIN, following a RESUME_OFFER if the receiver makes one.
	async fn negotiate<S>(
		&self,
		stream: &mut S,
		metadata: &FileMetadata,
		resume_token: Option<&str>,
		on_token: &(dyn Fn(&str) + Send + Sync),
	) -> Result<(String, BTreeSet<u64>), BackupError>
	where
		S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
	{
		let mut token = resume_token.map(str::to_string);
		loop {
			Message::Begin(Begin {
				metadata: metadata.clone(),
				chunk_size: self.chunk_size.get(),
				resume_token: token.clone(),
			})
			.write_to(stream)
			.await?;

			match Message::read_from(stream).await.map_err(network)? {
				Message::BeginAck(ack) => {
					return Ok((ack.transfer_id, ack.completed.into_iter().collect()));
				}
				Message::ResumeOffer(offer) => {
					info!(completed = offer.completed.len(), "receiver offered a resume");
					on_token(&offer.token);
					token = Some(offer.token);
				}
				other => {
					return Err(BackupError::Protocol(ProtocolError::UnexpectedMessage {
						got: other.name(),
						expected: "BEGIN_ACK or RESUME_OFFER",
					}));
				}
			}
		}
	}
}

fn network(err: ProtocolError) -> BackupError {
	match err {
		ProtocolError::Truncated => {
			BackupError::TransferNetwork("connection closed by receiver".into())
		}
		ProtocolError::Io(io) => BackupError::TransferNetwork(io.to_string()),
		other => BackupError::Protocol(other),
	}
}

async fn read_chunk(
	chunker: &mut FileChunker,
	index: u64,
) -> Result<(ChunkHeader, bytes::Bytes), BackupError> {
	chunker
		.read_chunk(index)
		.await
		.map_err(|err| BackupError::TransferNetwork(format!("reading chunk {index}: {err}")))?
		.ok_or_else(|| BackupError::Internal(format!("chunk {index} out of range")))
}

fn expected_len(total: u64, chunk_size: NonZeroU64, index: u64, count: u64) -> u64 {
	if index + 1 == count {
		total - (count - 1) * chunk_size.get()
	} else {
		chunk_size.get()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use coldbak_proto::message::{BeginAck, ChunkAck, FinalizeAck, HelloAck, ResumeOffer};

	fn client() -> TransferClient {
		TransferClient {
			host: "localhost".into(),
			port: 1,
			tls: false,
			client_id: "default-client".into(),
			client_secret: "default-secret-2024".into(),
			chunk_size: NonZeroU64::new(4096).unwrap(),
			max_in_flight: 2,
		}
	}

	async fn archive(dir: &Path, len: usize) -> (std::path::PathBuf, FileMetadata) {
		let bytes: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
		let path = dir.join("a.zip");
		tokio::fs::write(&path, &bytes).await.unwrap();
		let metadata = FileMetadata::for_file(&path).await.unwrap();
		(path, metadata)
	}

	/// A scripted receiver good enough to drive the client through a
	/// complete exchange.
	async fn fake_receiver(
		mut stream: tokio::io::DuplexStream,
		offer_resume: Option<(String, Vec<u64>)>,
	) {
		let Ok(Message::Hello(_)) = Message::read_from(&mut stream).await else {
			return;
		};
		Message::HelloAck(HelloAck {
			session_id: "sess".into(),
			accepted: true,
			error: None,
		})
		.write_to(&mut stream)
		.await
		.unwrap();

		let mut offer = offer_resume;
		loop {
			match Message::read_from(&mut stream).await.unwrap() {
				Message::Begin(begin) => {
					if begin.resume_token.is_none() {
						if let Some((token, completed)) = offer.take() {
							Message::ResumeOffer(ResumeOffer { token, completed })
								.write_to(&mut stream)
								.await
								.unwrap();
							continue;
						}
					}
					let completed = begin.resume_token.is_some().then(|| vec![0]).unwrap_or_default();
					Message::BeginAck(BeginAck {
						transfer_id: "tx".into(),
						completed,
					})
					.write_to(&mut stream)
					.await
					.unwrap();
				}
				Message::Chunk(chunk) => {
					Message::ChunkAck(ChunkAck {
						index: chunk.index,
						outcome: ChunkOutcome::Ok,
					})
					.write_to(&mut stream)
					.await
					.unwrap();
				}
				Message::Finalize => {
					Message::FinalizeAck(FinalizeAck {
						outcome: FinalizeOutcome::Ok {
							path: "/stored/a.zip".into(),
						},
					})
					.write_to(&mut stream)
					.await
					.unwrap();
					return;
				}
				_ => return,
			}
		}
	}

	#[tokio::test]
	async fn plain_run_sends_every_chunk() {
		let dir = tempfile::tempdir().unwrap();
		let (path, metadata) = archive(dir.path(), 10_000).await;

		let (ours, theirs) = tokio::io::duplex(256 * 1024);
		tokio::spawn(fake_receiver(theirs, None));

		let outcome = client()
			.run_over(
				ours,
				&path,
				&metadata,
				None,
				&|_| {},
				&|_, _| {},
				&CancellationToken::new(),
			)
			.await
			.unwrap();

		assert_eq!(outcome.remote_path, "/stored/a.zip");
		assert_eq!(outcome.chunks.len(), 3);
		assert_eq!(outcome.bytes_sent, 10_000);
	}

	#[tokio::test]
	async fn resume_offer_is_taken_and_completed_chunks_skipped() {
		let dir = tempfile::tempdir().unwrap();
		let (path, metadata) = archive(dir.path(), 10_000).await;

		let (ours, theirs) = tokio::io::duplex(256 * 1024);
		tokio::spawn(fake_receiver(
			theirs,
			Some(("RT_abcdefghijklmnopqrstuvwxyz".into(), vec![0])),
		));

		let seen_token = std::sync::Mutex::new(None);
		let outcome = client()
			.run_over(
				ours,
				&path,
				&metadata,
				None,
				&|token| *seen_token.lock().unwrap() = Some(token.to_string()),
				&|_, _| {},
				&CancellationToken::new(),
			)
			.await
			.unwrap();

		assert_eq!(
			seen_token.lock().unwrap().as_deref(),
			Some("RT_abcdefghijklmnopqrstuvwxyz")
		);
		// Chunk 0 was already on the receiver: only 1 and 2 travelled.
		assert_eq!(outcome.chunks.len(), 2);
		assert_eq!(outcome.bytes_sent, 10_000);
	}

	#[tokio::test]
	async fn rejected_hello_maps_to_auth_error() {
		let dir = tempfile::tempdir().unwrap();
		let (path, metadata) = archive(dir.path(), 100).await;

		let (ours, mut theirs) = tokio::io::duplex(64 * 1024);
		tokio::spawn(async move {
			let _ = Message::read_from(&mut theirs).await;
			Message::HelloAck(HelloAck {
				session_id: "sess".into(),
				accepted: false,
				error: Some("InvalidCredentials".into()),
			})
			.write_to(&mut theirs)
			.await
			.unwrap();
		});

		let result = client()
			.run_over(
				ours,
				&path,
				&metadata,
				None,
				&|_| {},
				&|_, _| {},
				&CancellationToken::new(),
			)
			.await;
		assert!(matches!(result, Err(BackupError::AuthRejected(code)) if code == "InvalidCredentials"));
	}
}
