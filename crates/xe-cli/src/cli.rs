use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "xe",
    version,
    about = "Python project and package manager with a global content-addressed cache"
)]
pub struct XeCli {
    #[arg(short, long, action = ArgAction::Count, global = true, help = "Increase logging (-vvv reaches trace)")]
    pub verbose: u8,
    #[arg(long, global = true, help = "Force trace logging regardless of -v")]
    pub trace: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    /// Create an xe project in the current (or named) directory
    Init {
        name: Option<String>,
        #[arg(short, long, help = "Interpreter version, e.g. 3.12")]
        python: Option<String>,
    },
    /// Install requirements and record them as dependencies
    Add {
        #[arg(required = true)]
        requirements: Vec<String>,
        #[arg(long, help = "Fail on records without a sha256 digest")]
        require_hashes: bool,
    },
    /// Drop dependencies from the manifest
    Remove {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Resolve the manifest's dependencies and pin concrete versions
    Lock,
    /// Install everything the manifest declares
    Sync,
    /// Install dependencies declared in another xe.toml or requirements.txt
    Import { path: PathBuf },
    /// Inspect or clear the global cache
    #[command(subcommand)]
    Cache(CacheCli),
    /// Manage interpreters
    #[command(subcommand)]
    Python(PythonCli),
}

#[derive(Subcommand, Debug)]
pub enum CacheCli {
    /// Print the cache directory the project uses
    Dir,
    /// Delete the cache directory
    Clean,
}

#[derive(Subcommand, Debug)]
pub enum PythonCli {
    /// Install an interpreter version
    Install { version: String },
    /// Print the interpreter the project would use
    Find,
    /// Print the interpreter install root
    Dir,
}
