mod lanbridge;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "lanbridge",
    version,
    about = "lanbridge - expose a TCP service behind NAT through a public relay"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses LANBRIDGE_CONFIG; then auto-detects lanbridge.toml > lanbridge.yaml > lanbridge.yml from CWD; then falls back to the OS default path (Linux: /etc/lanbridge/lanbridge.toml; others: user config dir).
    #[arg(long, env = "LANBRIDGE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    lanbridge::run(cli.config).await
}
