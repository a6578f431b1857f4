use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lloggs::{LoggingArgs, PreArgs, WorkerGuard};
use miette::{IntoDiagnostic as _, Result, miette};
use tracing::debug;

use coldbak_receiverd::{
	AuthStore, Catalog, DateGranularity, DirectoryOrganizationStrategy, FileNamingStrategy,
	OrganizationKind, ReceiverConfig, RetentionPolicy, VerifyOutcome,
};

/// Coldbak file receiver
///
/// Accepts authenticated backup transfers, stores archives into an organized
/// layout, and prunes them under retention policies.
#[derive(Debug, Clone, Parser)]
#[command(author, version)]
struct Args {
	#[command(flatten)]
	logging: LoggingArgs,

	/// Root directory for archives and receiver state
	#[arg(long, env = "COLDBAK_STORAGE", default_value = "/var/lib/coldbak", global = true)]
	storage: PathBuf,

	/// Symmetric key for the credential store, 64 hex chars
	#[arg(long, env = "COLDBAK_STORE_KEY", hide_env_values = true, global = true)]
	store_key: Option<String>,

	/// Print machine-readable JSON instead of human output
	#[arg(long, global = true)]
	json: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
	/// Listen for backup transfers
	Serve(ServeArgs),
	/// Inspect and apply retention policies
	Retention {
		#[command(subcommand)]
		command: RetentionCommand,
	},
	/// Manage client credentials
	Credentials {
		#[command(subcommand)]
		command: CredentialsCommand,
	},
	/// Check stored archives against their companion metadata
	Verify(VerifyArgs),
}

#[derive(Debug, Clone, Parser)]
struct ServeArgs {
	/// Port to listen on
	#[arg(long, default_value_t = 7115)]
	port: u16,

	/// Address to bind
	#[arg(long, default_value = "0.0.0.0")]
	bind: String,

	/// Serve TLS (requires --tls-cert and --tls-key)
	#[arg(long, requires = "tls_cert", requires = "tls_key")]
	tls: bool,

	/// PEM certificate chain
	#[arg(long)]
	tls_cert: Option<PathBuf>,

	/// PEM private key
	#[arg(long)]
	tls_key: Option<PathBuf>,

	/// Maximum concurrent transfer sessions
	#[arg(long, default_value_t = 8)]
	max_sessions: usize,

	/// How long completed resume tokens are kept
	#[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
	token_grace: std::time::Duration,

	/// How long idle unfinished transfers are kept
	#[arg(long, default_value = "7d", value_parser = humantime::parse_duration)]
	idle_transfer_ttl: std::time::Duration,

	/// How often enabled retention policies run
	#[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
	retention_every: std::time::Duration,

	/// Directory organization: server-date, date-server, or flat
	#[arg(long, default_value = "server-date")]
	organization: String,

	/// Date depth of organized directories: year, month, or day
	#[arg(long, default_value = "month")]
	granularity: String,

	/// Add a per-database directory level
	#[arg(long)]
	include_database_dir: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum RetentionCommand {
	/// List configured policies
	List,
	/// Add a policy (at least one bound is required)
	Add {
		name: String,
		#[arg(long)]
		max_age_days: Option<u32>,
		#[arg(long)]
		max_count: Option<u64>,
		#[arg(long)]
		max_storage_bytes: Option<u64>,
	},
	/// Enable a policy
	Enable { name: String },
	/// Disable a policy
	Disable { name: String },
	/// Show what a policy would delete, without deleting
	Estimate { name: String },
	/// Apply a policy now
	Apply { name: String },
}

#[derive(Debug, Clone, Subcommand)]
enum CredentialsCommand {
	/// Seed the store with the default client if it is empty
	Init,
	/// Add a client
	Add {
		client_id: String,
		client_secret: String,
		/// Human-readable label
		#[arg(long, default_value = "")]
		name: String,
	},
	/// Remove a client
	Remove { client_id: String },
	/// List clients (never shows secrets)
	List,
}

#[derive(Debug, Clone, Parser)]
struct VerifyArgs {
	/// Verify a single archive instead of the whole storage root
	archive: Option<PathBuf>,
}

fn get_args() -> Result<(Args, WorkerGuard)> {
	let log_guard = PreArgs::parse().setup().map_err(|err| miette!("{err}"))?;

	debug!("parsing arguments");
	let args = Args::parse();

	let log_guard = match log_guard {
		Some(g) => g,
		None => args
			.logging
			.setup(|v| match v {
				0 => "coldbak_receiverd=info",
				1 => "info,coldbak_receiverd=debug",
				2 => "debug",
				3 => "debug,coldbak_receiverd=trace",
				_ => "trace",
			})
			.map_err(|err| miette!("{err}"))?,
	};

	debug!(?args, "got arguments");
	Ok((args, log_guard))
}

fn store_key(args: &Args) -> Result<[u8; 32]> {
	let hex_key = args
		.store_key
		.as_deref()
		.ok_or_else(|| miette!("--store-key (or COLDBAK_STORE_KEY) is required"))?;
	let bytes = hex::decode(hex_key).map_err(|_| miette!("store key must be hex"))?;
	bytes
		.try_into()
		.map_err(|_| miette!("store key must be exactly 32 bytes (64 hex chars)"))
}

fn organization(serve: &ServeArgs) -> Result<DirectoryOrganizationStrategy> {
	let kind = match serve.organization.as_str() {
		"server-date" => OrganizationKind::ServerDateBased,
		"date-server" => OrganizationKind::DateServerBased,
		"flat" => OrganizationKind::FlatServerBased,
		custom if custom.contains('{') => OrganizationKind::Custom(custom.to_string()),
		other => return Err(miette!("unknown organization {other:?}")),
	};
	let granularity = match serve.granularity.as_str() {
		"year" => DateGranularity::Year,
		"month" => DateGranularity::Month,
		"day" => DateGranularity::Day,
		other => return Err(miette!("unknown granularity {other:?}")),
	};
	Ok(DirectoryOrganizationStrategy {
		kind,
		granularity,
		include_database_dir: serve.include_database_dir,
	})
}

#[tokio::main]
async fn main() -> Result<()> {
	let (args, _guard) = get_args()?;

	match args.command.clone() {
		Command::Serve(serve) => {
			let mut config = ReceiverConfig::new(&args.storage, serve.port, store_key(&args)?);
			config.bind = serve.bind.clone();
			config.max_sessions = serve.max_sessions.max(1);
			config.token_grace = serve.token_grace;
			config.idle_transfer_ttl = serve.idle_transfer_ttl;
			config.retention_interval = Some(serve.retention_every);
			config.organization = organization(&serve)?;
			config.naming = FileNamingStrategy::default();
			if serve.tls {
				// UNWRAP: clap `requires` guarantees both paths
				config = config.with_tls(serve.tls_cert.unwrap(), serve.tls_key.unwrap());
			}
			coldbak_receiverd::run(config).await
		}

		Command::Retention { command } => retention_command(&args, command).await,
		Command::Credentials { command } => {
			let key = store_key(&args)?;
			credentials_command(&args, key, command).await
		}

		Command::Verify(verify) => {
			let results = match verify.archive {
				Some(archive) => vec![(
					archive.clone(),
					coldbak_receiverd::verify_archive(&archive)
						.await
						.into_diagnostic()?,
				)],
				None => coldbak_receiverd::verify_all(&args.storage)
					.await
					.into_diagnostic()?,
			};

			if args.json {
				let rows: Vec<_> = results
					.iter()
					.map(|(path, outcome)| {
						serde_json::json!({ "path": path, "outcome": outcome })
					})
					.collect();
				println!("{}", serde_json::to_string_pretty(&rows).into_diagnostic()?);
			} else {
				for (path, outcome) in &results {
					println!("{}: {outcome:?}", path.display());
				}
			}

			if results.iter().all(|(_, o)| *o == VerifyOutcome::Ok) {
				Ok(())
			} else {
				Err(miette!("some archives failed verification"))
			}
		}
	}
}

async fn retention_command(args: &Args, command: RetentionCommand) -> Result<()> {
	let policies = coldbak_receiverd::PolicyStore::open(args.storage.join("retention-policies.json"));
	let catalog = Catalog::open(args.storage.join("catalog.json"));

	match command {
		RetentionCommand::List => {
			let list = policies.list().await.into_diagnostic()?;
			if args.json {
				println!("{}", serde_json::to_string_pretty(&list).into_diagnostic()?);
			} else {
				for p in list {
					println!(
						"{}\tenabled={}\tage={:?}\tcount={:?}\tbytes={:?}",
						p.name, p.enabled, p.max_age_days, p.max_count, p.max_storage_bytes
					);
				}
			}
			Ok(())
		}
		RetentionCommand::Add {
			name,
			max_age_days,
			max_count,
			max_storage_bytes,
		} => {
			let mut policy = RetentionPolicy::new(name);
			policy.max_age_days = max_age_days;
			policy.max_count = max_count;
			policy.max_storage_bytes = max_storage_bytes;
			policies.add(policy).await.into_diagnostic()?;
			Ok(())
		}
		RetentionCommand::Enable { name } => {
			if !policies.set_enabled(&name, true).await.into_diagnostic()? {
				return Err(miette!("no policy named {name:?}"));
			}
			Ok(())
		}
		RetentionCommand::Disable { name } => {
			if !policies.set_enabled(&name, false).await.into_diagnostic()? {
				return Err(miette!("no policy named {name:?}"));
			}
			Ok(())
		}
		RetentionCommand::Estimate { name } => {
			let policy = find_policy(&policies, &name).await?;
			let entries = catalog.with_archive().await.into_diagnostic()?;
			let impact =
				coldbak_receiverd::retention_estimate(&policy, &entries, chrono::Utc::now())
					.into_diagnostic()?;
			if args.json {
				println!("{}", serde_json::to_string_pretty(&impact).into_diagnostic()?);
			} else {
				println!(
					"would delete {} file(s), freeing {} bytes",
					impact.files_count, impact.bytes_to_free
				);
			}
			Ok(())
		}
		RetentionCommand::Apply { name } => {
			let policy = find_policy(&policies, &name).await?;
			let outcome = coldbak_receiverd::retention_apply(&policy, &catalog, chrono::Utc::now())
				.await
				.into_diagnostic()?;
			if args.json {
				println!("{}", serde_json::to_string_pretty(&outcome).into_diagnostic()?);
			} else {
				println!(
					"deleted {} file(s), freed {} bytes, {} warning(s)",
					outcome.deleted_files,
					outcome.bytes_freed,
					outcome.warnings.len()
				);
				for warning in &outcome.warnings {
					println!("warning: {warning}");
				}
			}
			Ok(())
		}
	}
}

async fn find_policy(
	policies: &coldbak_receiverd::PolicyStore,
	name: &str,
) -> Result<RetentionPolicy> {
	policies
		.list()
		.await
		.into_diagnostic()?
		.into_iter()
		.find(|p| p.name == name)
		.ok_or_else(|| miette!("no policy named {name:?}"))
}

async fn credentials_command(
	args: &Args,
	key: [u8; 32],
	command: CredentialsCommand,
) -> Result<()> {
	let store = AuthStore::open(args.storage.join("credentials.enc"), key);

	match command {
		CredentialsCommand::Init => {
			let seeded = store.init().await.into_diagnostic()?;
			if args.json {
				println!("{}", serde_json::json!({ "seeded": seeded }));
			} else if seeded {
				println!("seeded default client");
			} else {
				println!("store already initialized");
			}
			Ok(())
		}
		CredentialsCommand::Add {
			client_id,
			client_secret,
			name,
		} => {
			store
				.add(&client_id, &client_secret, &name)
				.await
				.into_diagnostic()?;
			if args.json {
				println!("{}", serde_json::json!({ "added": client_id }));
			}
			Ok(())
		}
		CredentialsCommand::Remove { client_id } => {
			if !store.remove(&client_id).await.into_diagnostic()? {
				return Err(miette!("no client {client_id:?}"));
			}
			if args.json {
				println!("{}", serde_json::json!({ "removed": client_id }));
			}
			Ok(())
		}
		CredentialsCommand::List => {
			let rows = store.list().await.into_diagnostic()?;
			if args.json {
				let rows: Vec<_> = rows
					.iter()
					.map(|r| {
						serde_json::json!({
							"clientId": r.client_id,
							"name": r.name,
							"active": r.active,
							"createdAt": r.created_at,
						})
					})
					.collect();
				println!("{}", serde_json::to_string_pretty(&rows).into_diagnostic()?);
			} else {
				for r in rows {
					println!(
						"{}\t{}\tactive={}\tcreated={}",
						r.client_id, r.name, r.active, r.created_at
					);
				}
			}
			Ok(())
		}
	}
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
