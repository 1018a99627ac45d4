//! metadump: extract .NET metadata from Unity IL2CPP games
//!
//! Takes the IL2CPP binary (libil2cpp.so, GameAssembly.dll, ...) and
//! global-metadata.dat in either order; the two are told apart by
//! their magic bytes.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use metadump_core::Config;
use metadump_il2cpp::{Il2CppDumper, ManualInputs, METADATA_MAGIC};

#[derive(Parser)]
#[command(name = "metadump", version, about = "Unity IL2CPP metadata dumper")]
struct Args {
    /// IL2CPP binary and global-metadata.dat, in either order.
    #[arg(num_args = 2)]
    files: Vec<PathBuf>,

    /// Output directory for dump.cs, script.json and il2cpp.h.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Path to a config.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// CodeRegistration address, hex, when the automatic search fails.
    #[arg(long, value_parser = parse_hex)]
    code_registration: Option<u64>,

    /// MetadataRegistration address, hex, when the automatic search fails.
    #[arg(long, value_parser = parse_hex)]
    metadata_registration: Option<u64>,

    /// Image base for memory dumps, hex.
    #[arg(long, value_parser = parse_hex)]
    image_base: Option<u64>,
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let trimmed = value.trim_start_matches("0x");
    u64::from_str_radix(trimmed, 16).map_err(|e| e.to_string())
}

fn is_metadata(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .with_context(|| format!("cannot read {path:?}"))?;
    Ok(u32::from_le_bytes(magic) == METADATA_MAGIC)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut binary_path = None;
    let mut metadata_path = None;
    for path in &args.files {
        if is_metadata(path)? {
            metadata_path = Some(path.clone());
        } else {
            binary_path = Some(path.clone());
        }
    }
    let Some(binary_path) = binary_path else {
        bail!("no IL2CPP binary among the inputs");
    };
    let Some(metadata_path) = metadata_path else {
        bail!("no global-metadata.dat among the inputs (or it is encrypted)");
    };

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let manual = ManualInputs {
        registration: match (args.code_registration, args.metadata_registration) {
            (Some(code), Some(meta)) => Some((code, meta)),
            _ => None,
        },
        dump_image_base: args.image_base,
    };

    std::fs::create_dir_all(&args.output)?;
    let dumper = Il2CppDumper::from_files(&binary_path, &metadata_path, &config, manual)
        .context("initialization failed")?;
    dumper
        .dump(&config, &args.output)
        .context("dump failed")?;
    info!("done");
    Ok(())
}
