//! forgebd demo - serve an in-memory disk as a kernel block device.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use forgebd::{Backend, BackendResult, BlockAligned, BlockBackend, Geometry};

#[derive(Parser)]
#[command(name = "forgebd", about = "Serve an in-memory disk as an NBD block device")]
struct Cli {
    /// Block size in bytes.
    #[arg(short = 's', long, default_value_t = 512)]
    size: u64,

    /// Total number of blocks.
    #[arg(short = 'c', long, default_value_t = 4096)]
    count: u64,

    /// Use the block-granular backend behind the alignment layer.
    #[arg(short = 'b', long)]
    block: bool,

    /// Path to the NBD device file.
    #[arg(short = 'd', long, default_value = "/dev/nbd0")]
    device: PathBuf,

    /// Disconnect an already-attached device and exit instead of serving.
    #[arg(long)]
    disconnect: bool,
}

/// Byte-addressable in-memory disk.
struct MemDisk {
    geometry: Geometry,
    buffer: Vec<u8>,
}

impl MemDisk {
    fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            buffer: vec![0u8; geometry.size_bytes() as usize],
        }
    }
}

impl Backend for MemDisk {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> BackendResult<()> {
        let start = offset as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> BackendResult<()> {
        let start = offset as usize;
        self.buffer[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn disconnect(&mut self) -> BackendResult<()> {
        info!("memory disk disconnected");
        Ok(())
    }

    fn flush(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn trim(&mut self, offset: u64, length: u64) -> BackendResult<()> {
        let start = offset as usize;
        self.buffer[start..start + length as usize].fill(0);
        Ok(())
    }
}

/// Block-granular in-memory disk; byte addressing comes from [`BlockAligned`].
struct BlockMemDisk {
    geometry: Geometry,
    buffer: Vec<u8>,
}

impl BlockMemDisk {
    fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            buffer: vec![0u8; geometry.size_bytes() as usize],
        }
    }
}

impl BlockBackend for BlockMemDisk {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_blocks(&mut self, block: u64, buf: &mut [u8]) -> BackendResult<()> {
        let start = (block * self.geometry.block_size) as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, block: u64, buf: &[u8]) -> BackendResult<()> {
        let start = (block * self.geometry.block_size) as usize;
        self.buffer[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn disconnect(&mut self) -> BackendResult<()> {
        info!("block memory disk disconnected");
        Ok(())
    }

    fn flush(&mut self) -> BackendResult<()> {
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.disconnect {
        forgebd::nbd::disconnect_device(&cli.device)
            .with_context(|| format!("Failed to disconnect: {}", cli.device.display()))?;
        info!(device = %cli.device.display(), "disconnect requested");
        return Ok(());
    }

    let geometry = Geometry::new(cli.size, cli.count);
    let result = if cli.block {
        let mut backend = BlockAligned::new(BlockMemDisk::new(geometry));
        forgebd::run(&cli.device, &mut backend)
    } else {
        let mut backend = MemDisk::new(geometry);
        forgebd::run(&cli.device, &mut backend)
    };

    if let Err(e) = result {
        error!(error = %e, "serving failed");
        process::exit(e.exit_code());
    }
    Ok(())
}
