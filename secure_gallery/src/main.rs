//! Secure Gallery - CLI
//!
//! Command-line front end for manual testing of a vault.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use secure_gallery::{GalleryVault, UnlockedGallery, VaultConfig};

#[derive(Parser)]
#[command(name = "calc-vault")]
#[command(author = "Karen Tonoyan")]
#[command(version = secure_gallery::VERSION)]
#[command(about = "Encrypted gallery vault - galleries unlocked by PIN")]
struct Cli {
    /// Vault path
    #[arg(short, long, default_value = "./calc_vault")]
    vault: PathBuf,

    /// JSON configuration file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new gallery
    Create {
        /// Gallery name
        name: String,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Check which gallery a PIN opens
    Unlock {
        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Rename the gallery the PIN opens
    Rename {
        /// New name
        name: String,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Delete the gallery the PIN opens, with all its files
    Delete {
        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Add a photo
    AddPhoto {
        /// Photo path
        path: PathBuf,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Add a note
    AddNote {
        title: String,
        body: String,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Show decrypted notes
    Notes {
        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// List media
    List {
        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Import photos and videos with progress
    Import {
        /// Files to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Render a thumbnail to a PNG file
    Thumbnail {
        /// Media ID
        id: Uuid,

        /// Output path
        output: PathBuf,

        /// Bounding box edge in pixels
        #[arg(short, long, default_value_t = 320)]
        size: u32,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Decrypt a video to a temp file and report progress
    Play {
        /// Media ID
        id: Uuid,

        /// PIN code
        #[arg(short, long)]
        pin: String,
    },

    /// Show vault and memory statistics
    Stats,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn unlock(vault: &GalleryVault, pin: &str) -> Result<UnlockedGallery> {
    vault
        .find_gallery_by_pin(pin)
        .await?
        .ok_or_else(|| anyhow!("No gallery found"))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => VaultConfig::default(),
    };
    config.root = cli.vault.clone();
    let vault = GalleryVault::open(config)?;

    match cli.command {
        Commands::Create { name, pin } => {
            println!("🔐 Creating gallery '{}'...", name);
            let gallery = vault.create_gallery(&name, &pin)?;
            println!("✅ Gallery created: {}", gallery.id());
        }

        Commands::Unlock { pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let info = vault.gallery(&gallery)?;
            println!("🔓 {} ({} notes, {} media)", info.name, info.notes.len(), info.media.len());
        }

        Commands::Rename { name, pin } => {
            let gallery = unlock(&vault, &pin).await?;
            vault.rename_gallery(&gallery, &name)?;
            println!("✅ Renamed to '{}'", name);
        }

        Commands::Delete { pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let removed = vault.delete_gallery(&gallery)?;
            println!("🗑️ Gallery deleted ({} files removed)", removed);
        }

        Commands::AddPhoto { path, pin } => {
            println!("📥 Adding photo: {}", path.display());
            let gallery = unlock(&vault, &pin).await?;
            let media = vault.add_photo(&gallery, &path)?;
            println!("✅ Photo added with ID: {}", media.id);
        }

        Commands::AddNote { title, body, pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let id = vault.add_note(&gallery, &title, &body)?;
            println!("✅ Note added with ID: {}", id);
        }

        Commands::Notes { pin } => {
            let gallery = unlock(&vault, &pin).await?;
            for note in vault.notes(&gallery)? {
                let marker = if note.is_canary { "📌" } else { "📝" };
                println!("{} {} - {}", marker, note.title, note.created_at.format("%Y-%m-%d %H:%M"));
                println!("   {}", note.body);
            }
        }

        Commands::List { pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let media = vault.media(&gallery)?;
            if media.is_empty() {
                println!("📭 No media in gallery");
            } else {
                println!("📷 Media in gallery ({}):", media.len());
                println!("{:-<60}", "");
                for item in media {
                    println!("{:?} {} - {} ({} bytes)", item.kind, item.id, item.original_name, item.size);
                }
            }
        }

        Commands::Import { paths, pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let handle = vault.start_import(paths, &gallery, |p| {
                let eta = p
                    .eta
                    .map(|d| format!("{}s left", d.as_secs()))
                    .unwrap_or_else(|| "estimating".into());
                println!(
                    "[{:>3.0}%] {} {}/{} {} ({})",
                    p.overall * 100.0,
                    p.phase,
                    p.index,
                    p.total,
                    p.item_name,
                    eta
                );
            });

            let report = handle.join().await?;
            println!("✅ Imported {} items, {} thumbnails", report.imported.len(), report.thumbnails);
            for failure in &report.failures {
                println!("⚠️ {} ({}): {}", failure.item_name, failure.phase, failure.error);
            }
        }

        Commands::Thumbnail { id, output, size, pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let thumb = vault.generate_thumbnail(&gallery, &id, size, size).await?;
            let img = thumb
                .to_rgb_image()
                .ok_or_else(|| anyhow!("thumbnail was recycled"))?;
            img.save(&output)?;
            let kind = if thumb.is_placeholder() { "placeholder" } else { "thumbnail" };
            println!("✅ {}x{} {} written to {}", thumb.width(), thumb.height(), kind, output.display());
        }

        Commands::Play { id, pin } => {
            let gallery = unlock(&vault, &pin).await?;
            let file = vault.prepare_video_for_playback(&gallery, &id).await?;
            println!("▶️ Playing from {}", file.path().display());
            file.wait_complete().await?;
            println!("✅ Fully decrypted ({} bytes), shredded on exit", file.available_len());
        }

        Commands::Stats => {
            println!("📊 Secure Gallery Statistics");
            println!("{:-<40}", "");
            println!("{}", vault.memory_stats());
        }
    }

    vault.shutdown().await?;
    Ok(())
}
