use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mkvm::arch::GuestArch;
use mkvm::backend::{self, MachineSpec};
use mkvm::cli::{Cli, Command, ImageCommand};
use mkvm::config::{self, Config};
use mkvm::driver;
use mkvm::logging;
use mkvm::progress::{OutputMode, StepProgress};
use mkvm::recipe::{Recipe, Target, Variant};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mode = resolve_output_mode(cli.verbose, cli.quiet);

    // Tracing to stderr would corrupt indicatif's line tracking, so the
    // terminal layer is off whenever spinners own the terminal.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet | OutputMode::Silent => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("mkvm=info".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures mkvm=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("mkvm=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    // Image commands don't need a config file
    let (recipe, explicit_config) = match cli.command {
        Command::Image { action } => {
            let cache_dir = mkvm::paths::cache_dir();
            return match action {
                ImageCommand::List => mkvm::image::list_cached(&cache_dir).map_err(Into::into),
                ImageCommand::Delete { name } => {
                    mkvm::image::delete_cached(&cache_dir, &name).map_err(Into::into)
                }
                ImageCommand::Clear => mkvm::image::clear_cache(&cache_dir).map_err(Into::into),
            };
        }
        Command::Kit {
            arch,
            release,
            bootstrap_tar,
            bootstrap_sha,
        } => (
            Recipe::new(
                Target { arch, release },
                Variant::BootstrapKit {
                    tarball: bootstrap_tar,
                    sha1: bootstrap_sha,
                },
            ),
            cli.config,
        ),
        Command::Pkg {
            arch,
            release,
            pkg_release,
        } => (
            Recipe::new(Target { arch, release }, Variant::PkgRepo { pkg_release }),
            cli.config,
        ),
    };

    let config = config::load_config(explicit_config.as_deref())?;
    let commands = recipe.commands(&config.mirror);
    let workdir = PathBuf::from(recipe.workdir());
    let image_source = recipe.image_url(&config.mirror.daily_url);

    if cli.dry_run {
        print_plan(&image_source, &workdir, &commands);
        return Ok(());
    }

    let guest = GuestArch::lookup(&recipe.target.arch)?;

    let logs_dir = mkvm::paths::logs_dir(&workdir);
    if let Err(e) = file_handle.set_file(&logs_dir.join("mkvm.log")) {
        tracing::warn!(error = %e, "could not open log file");
    }
    tracing::info!(
        arch = %recipe.target.arch,
        release = %recipe.target.release,
        workdir = %workdir.display(),
        commands = commands.len(),
        "provisioning"
    );

    run_provision(&config, guest, image_source, workdir, &commands, mode).await?;
    Ok(())
}

async fn run_provision(
    config: &Config,
    guest: GuestArch,
    image_source: String,
    workdir: PathBuf,
    commands: &[String],
    mode: OutputMode,
) -> Result<(), mkvm::error::MkvmError> {
    let spec = MachineSpec {
        image_source,
        workdir: workdir.clone(),
        disk_size: config.vm.disk_size.clone(),
        memory_size: config.vm.memory_size.clone(),
        persist: config.vm.persist,
    };
    let mut machine = backend::create_backend(spec, guest, config);

    let mut progress = StepProgress::new(driver::total_steps(commands.len()), mode);
    driver::provision(
        &mut machine,
        commands,
        Duration::from_secs(config.vm.command_timeout_s),
        &mut progress,
    )
    .await?;

    let disk = mkvm::paths::disk_path(&workdir);
    if config.vm.persist {
        progress.println(&format!("Disk image ready: {}", disk.display()));
    } else {
        progress.println("Session finished (snapshot mode, disk unchanged)");
    }
    Ok(())
}

fn print_plan(image_source: &str, workdir: &std::path::Path, commands: &[String]) {
    println!("# image: {image_source}");
    println!("# workdir: {}", workdir.display());
    for command in commands {
        println!();
        println!("{command}");
    }
}

/// Pick the progress rendering from the terminal and `--verbose`/`--quiet`.
fn resolve_output_mode(verbose: bool, quiet: bool) -> OutputMode {
    let interactive = std::io::stdout().is_terminal() && std::io::stderr().is_terminal();
    if quiet {
        OutputMode::Quiet
    } else if verbose {
        OutputMode::Verbose
    } else if interactive {
        OutputMode::Normal
    } else {
        OutputMode::Plain
    }
}
