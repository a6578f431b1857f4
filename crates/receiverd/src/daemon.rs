use std::sync::Arc;

use chrono::Utc;
use miette::{IntoDiagnostic as _, Result, miette};
use tokio::{net::TcpListener, sync::Semaphore, sync::oneshot, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
	ReceiverConfig,
	audit::AuditLog,
	authstore::AuthStore,
	catalog::Catalog,
	chunks::ChunkManager,
	layout::StorageLayout,
	retention::{self, PolicyStore},
	session::{SessionContext, serve_connection},
	tls,
	tokens::TokenStore,
};

/// Startup collaborator check, reported before anything is served.
#[derive(Debug, Default)]
pub struct DependencyValidationResult {
	pub problems: Vec<String>,
}

impl DependencyValidationResult {
	pub fn ok(&self) -> bool {
		self.problems.is_empty()
	}
}

async fn validate_dependencies(config: &ReceiverConfig) -> DependencyValidationResult {
	let mut result = DependencyValidationResult::default();

	for (what, dir) in [
		("storage root", &config.storage_root),
		("staging directory", &config.staging_dir),
		("audit directory", &config.audit_dir),
	] {
		if let Err(err) = tokio::fs::create_dir_all(dir).await {
			result.problems.push(format!("{what} {dir:?}: {err}"));
		}
	}

	// Probe that the storage root is actually writable.
	let probe = config.storage_root.join(".write-probe");
	match tokio::fs::write(&probe, b"probe").await {
		Ok(()) => {
			let _ = tokio::fs::remove_file(&probe).await;
		}
		Err(err) => {
			result
				.problems
				.push(format!("storage root not writable: {err}"));
		}
	}

	let auth = AuthStore::open(&config.credentials_file, config.store_key);
	if let Err(err) = auth.list().await {
		result
			.problems
			.push(format!("credential store {:?}: {err}", config.credentials_file));
	}

	if let Err(err) = Catalog::open(config.catalog_file()).all().await {
		result.problems.push(format!("catalog: {err}"));
	}

	if let Some(tls) = &config.tls {
		if let Err(err) = tls::acceptor(&tls.cert, &tls.key) {
			result.problems.push(format!("TLS: {err}"));
		}
	}

	result
}

/// Run the receiver until ctrl-c.
pub async fn run(config: ReceiverConfig) -> Result<()> {
	let (_shutdown_tx, shutdown_rx) = oneshot::channel();
	run_with_shutdown(config, shutdown_rx).await
}

/// Run the receiver until ctrl-c or an external shutdown signal.
pub async fn run_with_shutdown(
	config: ReceiverConfig,
	external_shutdown: oneshot::Receiver<()>,
) -> Result<()> {
	info!(storage = ?config.storage_root, "starting coldbak receiver");

	let validation = validate_dependencies(&config).await;
	if !validation.ok() {
		return Err(miette!(
			"dependency validation failed:\n  - {}",
			validation.problems.join("\n  - ")
		));
	}

	let auth = Arc::new(AuthStore::open(&config.credentials_file, config.store_key));
	if auth.init().await.into_diagnostic()? {
		info!("credential store seeded with the default client");
	}
	if auth.only_default_remains().await.into_diagnostic()? {
		warn!("only the default client credentials exist; add real clients before production use");
	}

	let tokens = Arc::new(
		TokenStore::open(config.tokens_file())
			.await
			.into_diagnostic()?,
	);
	let chunks = Arc::new(ChunkManager::new(&config.staging_dir, tokens));
	let layout = Arc::new(
		StorageLayout::new(
			&config.storage_root,
			config.organization.clone(),
			config.naming.clone(),
		)
		.into_diagnostic()?,
	);
	let catalog = Arc::new(Catalog::open(config.catalog_file()));
	let audit = Arc::new(AuditLog::new(&config.audit_dir));

	let ctx = Arc::new(SessionContext {
		auth,
		audit,
		chunks: chunks.clone(),
		layout,
		catalog: catalog.clone(),
	});

	let tls_acceptor = config
		.tls
		.as_ref()
		.map(|paths| tls::acceptor(&paths.cert, &paths.key))
		.transpose()
		.into_diagnostic()?;

	let listener = TcpListener::bind((config.bind.as_str(), config.port))
		.await
		.into_diagnostic()?;
	let local = listener.local_addr().into_diagnostic()?;
	info!(%local, tls = tls_acceptor.is_some(), "listening");

	let cancel = CancellationToken::new();

	// Background sweep: stale transfers and expired resume tokens.
	let sweeper = {
		let chunks = chunks.clone();
		let cancel = cancel.clone();
		let (grace, idle, every) = (
			config.token_grace,
			config.idle_transfer_ttl,
			config.sweep_interval,
		);
		tokio::spawn(async move {
			let mut ticker = interval(every);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					_ = ticker.tick() => {}
				}
				if let Err(err) = chunks.sweep(Utc::now(), grace, idle).await {
					error!("sweep failed: {err}");
				}
			}
		})
	};

	// Background retention: apply every enabled policy on its own schedule.
	let retention_task = config.retention_interval.map(|every| {
		let catalog = catalog.clone();
		let policies = PolicyStore::open(config.policies_file());
		let cancel = cancel.clone();
		tokio::spawn(async move {
			let mut ticker = interval(every);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					() = cancel.cancelled() => break,
					_ = ticker.tick() => {}
				}
				let enabled = match policies.enabled().await {
					Ok(enabled) => enabled,
					Err(err) => {
						error!("loading retention policies: {err}");
						continue;
					}
				};
				for policy in enabled {
					match retention::apply(&policy, &catalog, Utc::now()).await {
						Ok(outcome) if outcome.deleted_files + outcome.marked_missing > 0 => {
							info!(
								policy = %policy.name,
								deleted = outcome.deleted_files,
								freed = outcome.bytes_freed,
								"retention applied"
							);
						}
						Ok(_) => {}
						Err(err) => error!(policy = %policy.name, "retention failed: {err}"),
					}
				}
			}
		})
	});

	let sessions = Arc::new(Semaphore::new(config.max_sessions));
	let mut external_shutdown = external_shutdown;

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("interrupt received, shutting down");
				break;
			}
			_ = &mut external_shutdown => {
				info!("external shutdown requested");
				break;
			}
			accepted = listener.accept() => {
				let (socket, peer) = match accepted {
					Ok(pair) => pair,
					Err(err) => {
						warn!("accept failed: {err}");
						continue;
					}
				};

				let Ok(permit) = sessions.clone().try_acquire_owned() else {
					warn!(%peer, "session cap reached, turning connection away");
					continue;
				};

				debug!(%peer, "accepted connection");
				let ctx = ctx.clone();
				let cancel = cancel.child_token();
				let tls_acceptor = tls_acceptor.clone();
				tokio::spawn(async move {
					let _permit = permit;
					let outcome = match tls_acceptor {
						Some(acceptor) => match acceptor.accept(socket).await {
							Ok(stream) => serve_connection(stream, peer, ctx, cancel).await,
							Err(err) => {
								warn!(%peer, "TLS handshake failed: {err}");
								return;
							}
						},
						None => serve_connection(socket, peer, ctx, cancel).await,
					};
					if let Err(err) = outcome {
						warn!(%peer, "session ended with error: {err}");
					}
				});
			}
		}
	}

	cancel.cancel();
	sweeper.abort();
	if let Some(task) = retention_task {
		task.abort();
	}
	info!("receiver stopped");
	Ok(())
}
