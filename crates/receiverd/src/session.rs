use std::{sync::Arc, time::Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use coldbak_proto::{
	PROTOCOL_VERSION, auth,
	error::{AuthError, ProtocolError},
	message::{
		Begin, BeginAck, ChunkAck, ChunkOutcome, FinalizeAck, FinalizeOutcome, HelloAck, Message,
		ResumeOffer,
	},
	metadata::FileMetadata,
};

use crate::{
	audit::{AuditEntry, AuditLog, AuditOperation},
	authstore::AuthStore,
	catalog::{Catalog, CatalogEntry},
	chunks::ChunkManager,
	error::ReceiverError,
	layout::{BackupMetadata, StorageLayout},
};

/// A client that cannot finish HELLO within this window is cut off.
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared collaborators for every session.
#[derive(Debug)]
pub struct SessionContext {
	pub auth: Arc<AuthStore>,
	pub audit: Arc<AuditLog>,
	pub chunks: Arc<ChunkManager>,
	pub layout: Arc<StorageLayout>,
	pub catalog: Arc<Catalog>,
}

/// Companion metadata written next to each archive.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveMeta<'a> {
	md5: &'a str,
	sha256: &'a str,
	size: u64,
	created_at: chrono::DateTime<Utc>,
	server: &'a str,
	database: &'a str,
	original_name: &'a str,
}

/// Serve one client connection: HELLO, one transfer, done.
///
/// A disconnect mid-transfer is not an error: the staged chunks and session
/// state stay behind so the client can resume.
#[instrument(level = "debug", skip(stream, ctx, cancel), fields(%peer))]
pub async fn serve_connection<S>(
	mut stream: S,
	peer: std::net::SocketAddr,
	ctx: Arc<SessionContext>,
	cancel: CancellationToken,
) -> Result<(), ReceiverError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let session_id = uuid::Uuid::new_v4().to_string();

	let handshake = tokio::time::timeout(
		HANDSHAKE_TIMEOUT,
		handshake(&mut stream, &ctx, &session_id),
	)
	.await
	.map_err(|_| {
		warn!(%session_id, "handshake timed out");
		ReceiverError::Validation("handshake timed out".into())
	})?;
	let client_id = match handshake? {
		Some(client_id) => client_id,
		// Rejection already answered on the wire.
		None => return Ok(()),
	};
	info!(%session_id, %client_id, "session authenticated");

	let mut transfer_id: Option<String> = None;
	let mut metadata: Option<FileMetadata> = None;

	loop {
		let message = tokio::select! {
			() = cancel.cancelled() => {
				info!(%session_id, "receiver shutting down, closing session");
				return Ok(());
			}
			message = Message::read_from(&mut stream) => message,
		};

		let message = match message {
			Ok(message) => message,
			Err(ProtocolError::Truncated) => {
				// Client went away; whatever was staged stays resumable.
				debug!(%session_id, "client disconnected");
				return Ok(());
			}
			Err(err) => return Err(err.into()),
		};

		match message {
			Message::Begin(begin) => {
				let (reply, attached) = handle_begin(&ctx, &client_id, begin, &mut metadata).await?;
				if let Some(id) = attached {
					transfer_id = Some(id);
				}
				reply.write_to(&mut stream).await?;
			}

			Message::Chunk(chunk) => {
				let Some(id) = transfer_id.as_deref() else {
					Message::ChunkAck(ChunkAck {
						index: chunk.index,
						outcome: ChunkOutcome::Error("NoTransferInProgress".into()),
					})
					.write_to(&mut stream)
					.await?;
					continue;
				};

				if chunk.length != chunk.bytes.len() as u64 {
					Message::ChunkAck(ChunkAck {
						index: chunk.index,
						outcome: ChunkOutcome::Error("ChunkLengthMismatch".into()),
					})
					.write_to(&mut stream)
					.await?;
					continue;
				}

				let outcome = ctx
					.chunks
					.receive_chunk(id, chunk.index, &chunk.md5, &chunk.bytes)
					.await?;
				Message::ChunkAck(ChunkAck {
					index: chunk.index,
					outcome,
				})
				.write_to(&mut stream)
				.await?;
			}

			Message::Finalize => {
				let Some(id) = transfer_id.as_deref() else {
					Message::FinalizeAck(FinalizeAck {
						outcome: FinalizeOutcome::IntegrityFailure,
					})
					.write_to(&mut stream)
					.await?;
					continue;
				};
				// UNWRAP: metadata is always set alongside transfer_id
				let meta = metadata.as_ref().unwrap();

				let ack = finalize_transfer(&ctx, id, meta).await?;
				let done = matches!(ack.outcome, FinalizeOutcome::Ok { .. });
				Message::FinalizeAck(ack).write_to(&mut stream).await?;
				if done {
					return Ok(());
				}
			}

			other => {
				warn!(%session_id, message = other.name(), "unexpected message, closing");
				return Err(ProtocolError::UnexpectedMessage {
					got: other.name(),
					expected: "BEGIN, CHUNK, or FINALIZE",
				}
				.into());
			}
		}
	}
}

/// HELLO exchange: version gate, credentials check, audit trail.
///
/// Returns the authenticated client id, or `None` after answering a
/// rejection.
async fn handshake<S>(
	stream: &mut S,
	ctx: &SessionContext,
	session_id: &str,
) -> Result<Option<String>, ReceiverError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let hello = match Message::read_from(stream).await? {
		Message::Hello(hello) => hello,
		other => {
			return Err(ProtocolError::UnexpectedMessage {
				got: other.name(),
				expected: "HELLO",
			}
			.into());
		}
	};

	if hello.version != PROTOCOL_VERSION {
		Message::HelloAck(HelloAck {
			session_id: session_id.to_string(),
			accepted: false,
			error: Some("ProtocolVersionMismatch".into()),
		})
		.write_to(stream)
		.await?;
		return Err(ProtocolError::VersionMismatch {
			ours: PROTOCOL_VERSION,
			theirs: hello.version,
		}
		.into());
	}

	let started = Instant::now();
	let outcome = match auth::decode_credentials(&hello.token) {
		Ok((client_id, client_secret)) => {
			if ctx.auth.validate(&client_id, &client_secret).await? {
				Ok(client_id)
			} else {
				Err((client_id, AuthError::InvalidCredentials))
			}
		}
		Err(err) => Err(("unknown".to_string(), err)),
	};
	let duration_ms = started.elapsed().as_millis() as u64;

	match outcome {
		Ok(client_id) => {
			ctx.audit
				.record(AuditEntry::success(
					&client_id,
					AuditOperation::TokenValidation,
					duration_ms,
				))
				.await?;
			Message::HelloAck(HelloAck {
				session_id: session_id.to_string(),
				accepted: true,
				error: None,
			})
			.write_to(stream)
			.await?;
			Ok(Some(client_id))
		}
		Err((client_id, err)) => {
			ctx.audit
				.record(AuditEntry::failure(
					&client_id,
					AuditOperation::TokenValidation,
					duration_ms,
					err,
				))
				.await?;
			Message::HelloAck(HelloAck {
				session_id: session_id.to_string(),
				accepted: false,
				error: Some(err.code().to_string()),
			})
			.write_to(stream)
			.await?;
			Ok(None)
		}
	}
}

/// Answer a BEGIN: resume via token, offer a resume for a known in-flight
/// file, or start fresh.
async fn handle_begin(
	ctx: &SessionContext,
	client_id: &str,
	begin: Begin,
	metadata: &mut Option<FileMetadata>,
) -> Result<(Message, Option<String>), ReceiverError> {
	if let Some(token) = &begin.resume_token {
		return match ctx.chunks.restore_transfer(token, &begin.metadata).await {
			Ok(restored) => {
				*metadata = Some(begin.metadata);
				let completed: Vec<u64> = restored.completed.iter().copied().collect();
				Ok((
					Message::BeginAck(BeginAck {
						transfer_id: restored.transfer_id.clone(),
						completed,
					}),
					Some(restored.transfer_id),
				))
			}
			Err(
				err @ (ReceiverError::UnknownResumeToken
				| ReceiverError::TokenAlreadyCompleted
				| ReceiverError::ResumeMetadataMismatch),
			) => {
				warn!(%client_id, code = err.wire_code(), "resume refused");
				Err(err)
			}
			Err(err) => Err(err),
		};
	}

	// Reconnect without a token: offer to resume a matching in-flight
	// transfer rather than restarting from chunk zero.
	if let Some(in_flight) = ctx.chunks.find_in_flight(&begin.metadata).await {
		let started = Instant::now();
		let token = ctx.chunks.create_resume_token(&in_flight).await?;
		ctx.audit
			.record(AuditEntry::success(
				client_id,
				AuditOperation::TokenCreation,
				started.elapsed().as_millis() as u64,
			))
			.await?;

		let completed: Vec<u64> = ctx
			.chunks
			.completed_indices(&in_flight)
			.await?
			.iter()
			.copied()
			.collect();
		info!(%client_id, transfer_id = %in_flight, "offering resume");
		return Ok((
			Message::ResumeOffer(ResumeOffer { token, completed }),
			None,
		));
	}

	let transfer_id = ctx
		.chunks
		.init_transfer(begin.metadata.clone(), begin.chunk_size)
		.await?;
	*metadata = Some(begin.metadata);
	Ok((
		Message::BeginAck(BeginAck {
			transfer_id: transfer_id.clone(),
			completed: Vec::new(),
		}),
		Some(transfer_id),
	))
}

/// Run finalize, then place the archive into the catalog with its companion
/// metadata file.
async fn finalize_transfer(
	ctx: &SessionContext,
	transfer_id: &str,
	metadata: &FileMetadata,
) -> Result<FinalizeAck, ReceiverError> {
	let started_at = Utc::now();
	let backup = backup_metadata(metadata);
	let destination = ctx.layout.archive_path(&backup)?;

	let path = match ctx.chunks.finalize(transfer_id, &destination).await {
		Ok(path) => path,
		Err(ReceiverError::MissingChunks { missing }) => {
			return Ok(FinalizeAck {
				outcome: FinalizeOutcome::MissingChunks(missing),
			});
		}
		Err(ReceiverError::IntegrityFailure) => {
			return Ok(FinalizeAck {
				outcome: FinalizeOutcome::IntegrityFailure,
			});
		}
		Err(err) => return Err(err),
	};

	let meta_json = serde_json::to_vec_pretty(&ArchiveMeta {
		md5: &metadata.md5,
		sha256: &metadata.sha256,
		size: metadata.size,
		created_at: metadata.created_at,
		server: &backup.server_name,
		database: &backup.database_name,
		original_name: &metadata.name,
	})
	.map_err(|err| ReceiverError::Internal(err.to_string()))?;
	tokio::fs::write(StorageLayout::meta_path(&path), meta_json).await?;

	ctx.catalog
		.record(CatalogEntry {
			id: transfer_id.to_string(),
			archive_path: path.clone(),
			size: metadata.size,
			md5: metadata.md5.clone(),
			sha256: metadata.sha256.clone(),
			server: backup.server_name,
			database: backup.database_name,
			started_at,
			completed_at: Utc::now(),
			archive_missing: false,
		})
		.await?;

	Ok(FinalizeAck {
		outcome: FinalizeOutcome::Ok {
			path: path.display().to_string(),
		},
	})
}

/// Derive placement metadata from the transferred file's name.
///
/// Client archive names look like `20240115_103000_s1_db1.zip`; the server
/// and database segments feed the directory layout. Names that do not parse
/// fall back to `unknown`.
fn backup_metadata(metadata: &FileMetadata) -> BackupMetadata {
	let stem = metadata.name.strip_suffix(".zip").unwrap_or(&metadata.name);
	let parts: Vec<&str> = stem.split('_').collect();

	let (server, database) = match parts.as_slice() {
		[_date, _time, server, database, ..] => (server.to_string(), database.to_string()),
		_ => ("unknown".to_string(), "unknown".to_string()),
	};

	BackupMetadata {
		server_name: server,
		database_name: database,
		backup_time: metadata.created_at,
		backup_type: "full".into(),
	}
}
