use bddf_core::index::finalize_file;
use bddf_core::IndexedReader;
use bddf_storage::FileSource;
use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Parser)]
#[clap(about, version, author)]
struct Config {
    #[clap(long)]
    pub path: String,

    /// re-read every indexed block after finalizing
    #[clap(long)]
    pub verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    if config.path.is_empty() {
        println!("path MUST not be empty!");
        return Ok(());
    }

    if finalize_file(config.path.as_str()).await? {
        println!("{}: index written", config.path);
    } else {
        println!("{}: index up to date", config.path);
    }

    if config.verify {
        let reader = IndexedReader::open(FileSource::open(config.path.as_str()).await?).await?;
        reader.verify_index().await?;
        for descriptor in reader.channels() {
            println!(
                "{:>6} {} blocks {}",
                descriptor.channel_id,
                reader.block_count(descriptor.channel_id),
                descriptor.channel_name
            );
        }
    }

    Ok(())
}
