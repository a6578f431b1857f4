use clap::Subcommand;
use miette::Result;
use tracing::{debug, trace};

pub use context::Context;
pub mod context;

macro_rules! subcommands {
	(
		[$argtype:ty => $ctxcode:block]($ctxmethod:ident)
		$(
			$modname:ident => $enumname:ident($argname:ident)
		),+
	) => {
		$(
			pub mod $modname;
		)*

		#[derive(Debug, Clone, Subcommand)]
		pub enum Action {
			$(
				$enumname($modname::$argname),
			)*
		}

		pub async fn run(ctx: $argtype) -> Result<()> {
			let ctxfn = $ctxcode;
			match ctxfn(ctx)? {
				$(
					(Action::$enumname(args), ctx) => $modname::run(ctx.$ctxmethod(args)).await,
				)*
			}
		}
	};
}

use crate::args::Args;

/// Flags every subcommand can see: the data directory and output mode.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
	pub data_dir: std::path::PathBuf,
	pub json: bool,
}

subcommands! {
	[Args => {|args: Args| -> Result<(Action, Context<GlobalArgs>)> {
		debug!(version=%env!("CARGO_PKG_VERSION"), "starting up");
		trace!(action=?args.action, "action");
		let globals = GlobalArgs {
			data_dir: args.data_dir,
			json: args.json,
		};
		Ok((args.action, Context::new().with_top(globals)))
	}}](push)

	backup => Backup(BackupArgs),
	config => Config(ConfigArgs)
}
