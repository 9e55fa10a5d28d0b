use clap::{Parser, Subcommand};
use ferry::client::{self, UploadOptions};
use ferry::config::Config;
use ferry::groundfish::{stream::encrypt_file, CipherContext, FileDecryptTask, CURRENT_TABLE_FILE};
use ferry::progress::{Direction, ProgressDisplay, ProgressEvent};
use ferry::registry::{Registry, unix_timestamp};
use ferry::server::HostServer;
use ferry::utils::{format_bytes, format_duration};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Portion-acknowledged file hosting with Groundfish obfuscation")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "ferry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the hosting server
    Serve,
    /// Upload a file to the hosting server
    Send {
        /// File to upload
        file: PathBuf,

        /// Display title stored alongside the file
        #[arg(short, long, default_value = "")]
        title: String,

        /// Description stored alongside the file
        #[arg(short, long, default_value = "")]
        description: String,

        /// Content type identifier
        #[arg(long, default_value_t = 0)]
        type_id: u16,

        /// Content sub-type identifier
        #[arg(long, default_value_t = 0)]
        sub_type_id: u16,

        /// Encrypt the file with the active word list before sending
        #[arg(short, long)]
        encrypt: bool,
    },
    /// Generate the word list, or rotate to a new version if one exists
    Keygen,
    /// Encrypt a file with the active word list
    Encrypt {
        /// File to encrypt
        source: PathBuf,

        /// Output path, defaults to the source with a .gf suffix
        dest: Option<PathBuf>,
    },
    /// Decrypt a Groundfish-encrypted file
    Decrypt {
        /// File to decrypt
        source: PathBuf,

        /// Output path, defaults to the source without its .gf suffix
        dest: Option<PathBuf>,

        /// Remove the encrypted source after a successful decrypt
        #[arg(long)]
        delete_source: bool,
    },
    /// List files recorded in the hosting registry
    List,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load_or_create(&cli.config)?;
    config.validate()?;

    let table_directory = PathBuf::from(&config.cipher.table_directory);
    match cli.command {
        Commands::Serve => {
            let cipher = Arc::new(CipherContext::load_or_generate(&table_directory)?);
            let registry = Registry::load_or_create(Path::new(&config.server.registry_path))?;
            let server = HostServer::new(
                config.server.clone(),
                config.transfer.clone(),
                cipher,
                registry,
            );
            server.run().await?;
        }
        Commands::Send {
            file,
            title,
            description,
            type_id,
            sub_type_id,
            encrypt,
        } => {
            let cipher = Arc::new(CipherContext::load_or_generate(&table_directory)?);
            client::upload(
                &config,
                cipher,
                UploadOptions {
                    source: file,
                    title,
                    description,
                    type_id,
                    sub_type_id,
                    encrypt,
                    show_progress: true,
                },
            )
            .await?;
        }
        Commands::Keygen => {
            let had_table = table_directory.join(CURRENT_TABLE_FILE).exists();
            let mut cipher = CipherContext::load_or_generate(&table_directory)?;
            if had_table {
                let version = cipher.rotate()?;
                println!("Rotated word list to version {}", version);
            } else {
                println!("Generated word list version {}", cipher.version());
            }
            println!("Table directory: {}", table_directory.display());
        }
        Commands::Encrypt { source, dest } => {
            let cipher = CipherContext::load_or_generate(&table_directory)?;
            let dest = dest.unwrap_or_else(|| client::encrypted_artifact_path(&source));
            let written = encrypt_file(cipher.current(), &source, &dest, rand::random())?;
            info!(
                source = %source.display(),
                dest = %dest.display(),
                "File encrypted"
            );
            println!(
                "Encrypted {} ({}) -> {}",
                source.display(),
                format_bytes(written),
                dest.display()
            );
        }
        Commands::Decrypt {
            source,
            dest,
            delete_source,
        } => {
            let cipher = CipherContext::load_or_generate(&table_directory)?;
            let dest = dest.unwrap_or_else(|| default_decrypt_dest(&source));
            decrypt_with_progress(&cipher, &source, &dest, delete_source)?;
            println!("Decrypted {} -> {}", source.display(), dest.display());
        }
        Commands::List => {
            let cipher = CipherContext::load_or_generate(&table_directory)?;
            let registry = Registry::load_or_create(Path::new(&config.server.registry_path))?;
            print_hosted_files(&registry, &cipher);
        }
    }

    Ok(())
}

/// Output path for a decrypted file: the source minus its `.gf` suffix, or
/// the source with `.plain` appended when there is no suffix to strip.
fn default_decrypt_dest(source: &Path) -> PathBuf {
    if source.extension().is_some_and(|ext| ext == "gf") {
        source.with_extension("")
    } else {
        let mut name = source
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".plain");
        source.with_file_name(name)
    }
}

/// Drives the streaming decrypt task to completion with a progress bar.
fn decrypt_with_progress(
    cipher: &CipherContext,
    source: &Path,
    dest: &Path,
    delete_source: bool,
) -> Result<(), ferry::TransferError> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.display().to_string());
    let mut task = FileDecryptTask::new(source, dest, delete_source)?;
    let display = ProgressDisplay::new(&name, task.total_bytes());
    let started = Instant::now();

    let mut steps = 0u64;
    while !task.is_complete() {
        let percent = task.advance(cipher)?;
        steps += 1;
        if steps % 512 == 0 || task.is_complete() {
            display.apply(&ProgressEvent::new(
                &name,
                Direction::Download,
                percent,
                task.total_bytes(),
                started.elapsed(),
            ));
        }
    }
    display.finish();
    Ok(())
}

fn print_hosted_files(registry: &Registry, cipher: &CipherContext) {
    if registry.is_empty() {
        println!("No hosted files recorded");
        return;
    }

    let now = unix_timestamp();
    println!("Hosted files ({}):", registry.len());
    for entry in registry.entries() {
        let name = decrypt_label(cipher, &entry.encrypted_name);
        let title = decrypt_label(cipher, &entry.encrypted_title);
        let age = format_duration(now.saturating_sub(entry.uploaded_at));
        println!(
            "  {:30} {:25} {:>10}  type {:>3}/{:<3} crc {:08x}  {} ago",
            name,
            title,
            format_bytes(entry.file_size),
            entry.type_id,
            entry.sub_type_id,
            entry.checksum,
            age
        );
    }
}

/// Best-effort decryption of a registry label. Entries written under a lost
/// word list version still get a row, just not a readable one.
fn decrypt_label(cipher: &CipherContext, encrypted: &[u8]) -> String {
    match cipher.decrypt(encrypted) {
        Ok(bytes) if bytes.is_empty() => "-".to_string(),
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => "<unreadable>".to_string(),
    }
}
