//! Thin CLI shell: argument surface, interactive prompts, dispatch.

use crate::config_loader::load_config;
use crate::orchestrator::{run_inspect, run_restore, Confirmer, RestoreRequest};
use crate::scope::Scope;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Top-level CLI interface.
#[derive(Parser)]
#[command(
    name = "mxrestore",
    version,
    about = "Scoped restore of mail-server backups into a live system"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Restore one domain or mailbox from a backup bundle
    Restore {
        /// Backup bundle directory
        #[arg(long)]
        backup: PathBuf,

        /// Scope to restore: a domain ("example.org") or a mailbox
        /// ("user@example.org")
        scope: String,

        /// Replace the entity if it already exists live (takes a
        /// pre-restore snapshot first)
        #[arg(long)]
        overwrite: bool,

        /// Skip the interactive confirmation prompts
        #[arg(short = 'y', long)]
        yes: bool,

        /// Overwrite differing at-rest encryption keys without prompting
        #[arg(long)]
        force_key_restore: bool,

        /// Stage and plan only; touch nothing live
        #[arg(long)]
        dry_run: bool,
    },

    /// List the scopes and assets a backup bundle contains
    Inspect {
        /// Backup bundle directory
        #[arg(long)]
        backup: PathBuf,
    },
}

/// Interactive confirmation on stdin/stdout.
pub struct StdinConfirmer;

impl Confirmer for StdinConfirmer {
    fn confirm(&self, prompt: &str) -> bool {
        print!("{prompt} [y/N] ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }

    fn confirm_typed(&self, prompt: &str, expected: &str) -> bool {
        print!("{prompt}: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().lock().read_line(&mut line).is_err() {
            return false;
        }
        line.trim() == expected
    }
}

pub fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let cfg = load_config()?;

    match cli.command {
        Commands::Restore {
            backup,
            scope,
            overwrite,
            yes,
            force_key_restore,
            dry_run,
        } => {
            let request = RestoreRequest {
                scope: Scope::parse(&scope)?,
                bundle_path: backup,
                overwrite,
                assume_yes: yes,
                force_key_restore,
                dry_run,
            };
            let summary = run_restore(&cfg, &request, &StdinConfirmer)?;
            print!("{}", summary.render());
            Ok(())
        }
        Commands::Inspect { backup } => {
            run_inspect(&cfg, &backup)?;
            Ok(())
        }
    }
}
