use anyhow::Result;
use clap::{Parser, Subcommand};
use fprint_core::{DriverConfig, DriverKind};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the workspace
    Build,
    /// Run the test suite
    Test,
    /// Check formatting and run clippy
    Lint,
    /// Write a configuration file with every default filled in
    DefaultConfig {
        #[arg(default_value = "fprint.toml")]
        path: PathBuf,
    },
    /// List supported USB IDs
    Ids,
}

fn cargo(args: &[&str]) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("cargo {} failed", args.join(" "));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building workspace...");
            cargo(&["build", "--workspace"])?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"])?;
        }
        Commands::Lint => {
            cargo(&["fmt", "--all", "--", "--check"])?;
            cargo(&["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::DefaultConfig { path } => {
            DriverConfig::default().save_to_file(path)?;
            println!("Wrote {}", path.display());
        }
        Commands::Ids => {
            for kind in DriverKind::ALL {
                let info = kind.info();
                for (vid, pid) in info.id_table {
                    println!("{:04x}:{:04x}  {:<10} {}", vid, pid, info.name, info.full_name);
                }
            }
        }
    }

    Ok(())
}
