use clap::{Parser, Subcommand};
use miette::Result;

use super::{Context, GlobalArgs};

pub mod run;
pub mod schedule;

/// Run backups and manage their schedules.
#[derive(Debug, Clone, Parser)]
pub struct BackupArgs {
	#[command(subcommand)]
	pub action: BackupAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum BackupAction {
	Run(run::RunArgs),
	Schedule(schedule::ScheduleArgs),
}

pub async fn run(ctx: Context<GlobalArgs, BackupArgs>) -> Result<()> {
	match ctx.args_sub.action.clone() {
		BackupAction::Run(args) => run::run(ctx.push(args)).await,
		BackupAction::Schedule(args) => schedule::run(ctx.push(args)).await,
	}
}
