use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mkvm", about = "Provision NetBSD VM images for CI build workers")]
pub struct Cli {
    /// Path to config file (default: ./mkvm.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only show step spinners
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print the image URL, work directory and commands without booting
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision with a pinned pkgsrc bootstrap kit
    Kit {
        /// NetBSD port, e.g. amd64
        arch: String,
        /// Release branch, e.g. 10
        release: String,
        /// Bootstrap tarball name
        bootstrap_tar: String,
        /// SHA-1 of the bootstrap tarball
        bootstrap_sha: String,
    },

    /// Provision from the release's binary package repository
    Pkg {
        /// NetBSD port, e.g. amd64
        arch: String,
        /// Release branch, e.g. 10
        release: String,
        /// Package repository release, e.g. 10.0
        pkg_release: String,
    },

    /// Manage cached base images
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List cached images
    List,
    /// Delete a cached image by filename
    Delete {
        /// Filename as shown by `image list`
        name: String,
    },
    /// Delete all cached images
    Clear,
}
