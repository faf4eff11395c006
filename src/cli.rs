//! Command-line argument parsing.

use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the Flatpak manifest to check.
    #[arg()]
    pub manifest: PathBuf,

    /// Name to register the Flathub remote under.
    #[arg(long, default_value = "flathub")]
    pub remote_name: String,

    /// URL of the Flathub repo file.
    #[arg(long, default_value = "https://flathub.org/repo/flathub.flatpakrepo")]
    pub remote_url: String,

    /// A submodule-referenced module file to check, relative to the
    /// manifest's directory. Repeatable.
    #[arg(long = "module")]
    pub modules: Vec<PathBuf>,

    /// Compute and print the outdated state without writing the manifest.
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity. Repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
