#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use searchgate::server::bootstrap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "searchgate", about = "Write-aware reverse proxy for Elasticsearch clusters")]
struct Cli {
    /// Path to gateway config file
    #[arg(short, long, default_value = "searchgate.toml")]
    config: PathBuf,

    /// Listen address override
    #[arg(short, long)]
    listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
    }))
}
