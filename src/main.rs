use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use namei::modules::inode::InodeMetadata;
use namei::{FilesystemManager, NamespaceConfig, OpenOptions, Process};
use std::io::{self, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Namespace description to build before running the command
    #[arg(short, long, global = true, default_value = "namespace.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical path a path resolves to
    Resolve {
        path: String,
        /// Do not follow a final symbolic link
        #[arg(long)]
        nofollow: bool,
    },
    /// Print inode metadata as JSON
    Stat {
        path: String,
        /// Do not follow a final symbolic link
        #[arg(long)]
        nofollow: bool,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file
    Cat { path: String },
    /// Write text to a file, creating it if needed
    Write {
        path: String,
        content: String,
        /// Append instead of truncating
        #[arg(short, long)]
        append: bool,
    },
    /// Create a directory
    Mkdir {
        path: String,
        /// Octal permission bits
        #[arg(short, long, default_value = "755", value_parser = parse_mode)]
        mode: u16,
    },
    /// Remove a file
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Rename a file or directory
    Mv { source: String, target: String },
    /// Create a link
    Ln {
        /// Create a symbolic link
        #[arg(short = 's', long = "symbolic")]
        symbolic: bool,
        target: String,
        link: String,
    },
    /// Change permission bits
    Chmod {
        #[arg(value_parser = parse_mode)]
        mode: u16,
        path: String,
    },
    /// List the mounts of the namespace
    Mounts,
    /// Show the configured process
    Info,
}

fn parse_mode(text: &str) -> Result<u16, String> {
    u16::from_str_radix(text, 8).map_err(|e| format!("invalid octal mode {}: {}", text, e))
}

fn type_letter(metadata: &InodeMetadata) -> char {
    let mode = metadata.mode;
    if mode.is_directory() {
        'd'
    } else if mode.is_symlink() {
        'l'
    } else if mode.is_char_device() {
        'c'
    } else if mode.is_block_device() {
        'b'
    } else if mode.is_fifo() {
        'p'
    } else if mode.is_socket() {
        's'
    } else {
        '-'
    }
}

fn run(process: &Process, command: &Commands) -> Result<()> {
    match command {
        Commands::Resolve { path, nofollow } => {
            let options = if *nofollow {
                OpenOptions::NOFOLLOW_NOERROR
            } else {
                OpenOptions::empty()
            };
            let resolved = process.resolve(path, options)?;
            println!("{}", resolved.custody.absolute_path());
        }
        Commands::Stat { path, nofollow } => {
            let metadata = if *nofollow {
                process.lstat(path)?
            } else {
                process.stat(path)?
            };
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }
        Commands::Ls { path } => {
            let directory = if path.ends_with('/') {
                path.clone()
            } else {
                format!("{}/", path)
            };
            for entry in process.list_directory(path)? {
                let metadata = process.lstat(&format!("{}{}", directory, entry.name))?;
                println!(
                    "{}{:04o} {:>5} {:>5} {:>8} {}",
                    type_letter(&metadata),
                    metadata.mode.permissions(),
                    metadata.uid,
                    metadata.gid,
                    metadata.size,
                    entry.name
                );
            }
        }
        Commands::Cat { path } => {
            let file = process.open(path, OpenOptions::READ, 0)?;
            io::stdout().write_all(&file.read_to_end()?)?;
        }
        Commands::Write {
            path,
            content,
            append,
        } => {
            let mut options = OpenOptions::WRITE | OpenOptions::CREATE;
            if !*append {
                options |= OpenOptions::TRUNCATE;
            }
            let file = process.open(path, options, 0o666)?;
            if *append {
                file.seek(file.metadata().size);
            }
            file.write(content.as_bytes())?;
        }
        Commands::Mkdir { path, mode } => process.mkdir(path, *mode)?,
        Commands::Rm { path } => process.unlink(path)?,
        Commands::Rmdir { path } => process.rmdir(path)?,
        Commands::Mv { source, target } => process.rename(source, target)?,
        Commands::Ln {
            symbolic,
            target,
            link,
        } => {
            if *symbolic {
                process.symlink(target, link)?
            } else {
                process.link(target, link)?
            }
        }
        Commands::Chmod { mode, path } => process.chmod(path, *mode)?,
        Commands::Mounts => {
            println!(
                "{}",
                serde_json::to_string_pretty(&process.context().mounts())?
            );
        }
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&process.info())?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new().filter_level(log_level).init();

    let config = NamespaceConfig::load(&cli.config)?;
    let manager = FilesystemManager::new();
    let process = config.build(&manager)?;
    info!(
        "Namespace {} ready with {} mounts",
        process.context().id(),
        process.context().mount_count()
    );

    let result = run(&process, &cli.command);
    manager.sync();

    result.map_err(|e| {
        let errno = e
            .downcast_ref::<namei::VfsError>()
            .map(|error| error.errno())
            .unwrap_or(0);
        error!("Command failed (errno {})", errno);
        e
    })
}
