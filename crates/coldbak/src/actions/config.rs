use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic as _, Result, miette};

use super::{Context, GlobalArgs};
use crate::store::{BackupConfiguration, SourceConfig, Store, TargetConfig};

/// Manage backup configurations.
#[derive(Debug, Clone, Parser)]
pub struct ConfigArgs {
	#[command(subcommand)]
	pub action: ConfigAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
	/// Add a configuration
	Add(AddArgs),
	/// List configurations
	List,
	/// Show one configuration (password redacted)
	Show { id: String },
	/// Remove a configuration
	Remove { id: String },
}

#[derive(Debug, Clone, Parser)]
pub struct AddArgs {
	/// Human-readable name
	#[arg(long)]
	pub name: String,

	/// MySQL host
	#[arg(long, default_value = "127.0.0.1")]
	pub mysql_host: String,

	#[arg(long, default_value_t = 3306)]
	pub mysql_port: u16,

	#[arg(long, default_value = "root")]
	pub mysql_user: String,

	#[arg(long, env = "COLDBAK_MYSQL_PASSWORD", hide_env_values = true, default_value = "")]
	pub mysql_password: String,

	/// Service-manager unit name
	#[arg(long, default_value = "mysql")]
	pub service: String,

	/// MySQL data directory to archive
	#[arg(long)]
	pub data_dir: std::path::PathBuf,

	/// Receiver host
	#[arg(long)]
	pub target_host: String,

	#[arg(long, default_value_t = 7115)]
	pub target_port: u16,

	/// Connect to the receiver over TLS
	#[arg(long)]
	pub tls: bool,

	/// `{server}` token in the archive name
	#[arg(long)]
	pub server_label: String,

	/// `{database}` token in the archive name
	#[arg(long)]
	pub database_label: String,

	#[arg(long, default_value = "default-client")]
	pub client_id: String,

	#[arg(long, env = "COLDBAK_CLIENT_SECRET", hide_env_values = true, default_value = "default-secret-2024")]
	pub client_secret: String,

	/// Transfer chunk size in bytes
	#[arg(long, default_value_t = 256 * 1024)]
	pub chunk_size: u64,
}

pub async fn run(ctx: Context<GlobalArgs, ConfigArgs>) -> Result<()> {
	let GlobalArgs { data_dir, json } = ctx.args_top.clone();
	let store = Arc::new(Store::open(&data_dir));

	match ctx.args_sub.action.clone() {
		ConfigAction::Add(add) => {
			let config = BackupConfiguration {
				id: uuid::Uuid::new_v4().to_string(),
				name: add.name,
				source: SourceConfig {
					host: add.mysql_host,
					port: add.mysql_port,
					username: add.mysql_user,
					password: add.mysql_password,
					service_name: add.service,
					data_dir: add.data_dir,
				},
				target: TargetConfig {
					host: add.target_host,
					port: add.target_port,
					tls: add.tls,
				},
				server_label: add.server_label,
				database_label: add.database_label,
				client_id: add.client_id,
				client_secret: add.client_secret,
				chunk_size: add.chunk_size,
				active: true,
				created_at: Utc::now(),
			};
			config.validate().into_diagnostic()?;
			store.config_put(config.clone()).await.into_diagnostic()?;
			if json {
				println!("{}", serde_json::json!({ "id": config.id }));
			} else {
				println!("{}", config.id);
			}
			Ok(())
		}

		ConfigAction::List => {
			let configs = store.config_list().await.into_diagnostic()?;
			if json {
				let rows: Vec<_> = configs
					.iter()
					.map(|c| {
						serde_json::json!({
							"id": c.id,
							"name": c.name,
							"target": format!("{}:{}", c.target.host, c.target.port),
							"active": c.active,
						})
					})
					.collect();
				println!("{}", serde_json::to_string_pretty(&rows).into_diagnostic()?);
			} else {
				for c in configs {
					println!(
						"{}\t{}\t{}:{}\tactive={}",
						c.id, c.name, c.target.host, c.target.port, c.active
					);
				}
			}
			Ok(())
		}

		ConfigAction::Show { id } => {
			let mut config = store
				.config_get(&id)
				.await
				.into_diagnostic()?
				.ok_or_else(|| miette!("no configuration {id:?}"))?;
			config.source.password = "<redacted>".into();
			config.client_secret = "<redacted>".into();
			println!(
				"{}",
				serde_json::to_string_pretty(&config).into_diagnostic()?
			);
			Ok(())
		}

		ConfigAction::Remove { id } => {
			if !store.config_remove(&id).await.into_diagnostic()? {
				return Err(miette!("no configuration {id:?}"));
			}
			if json {
				println!("{}", serde_json::json!({ "removed": id }));
			}
			Ok(())
		}
	}
}
