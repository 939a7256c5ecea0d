mod rtun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "rtun",
    version,
    about = "rtun - reverse tunnel multiplexing many virtual connections over one TCP link"
)]
struct Cli {
    /// Path to rtun config file (.toml/.yaml/.yml). If omitted, uses RTUN_CONFIG; then auto-detects rtun.toml > rtun.yaml > rtun.yml from CWD; then falls back to the OS default path (Linux: /etc/rtun/rtun.toml; others: user config dir).
    #[arg(long, env = "RTUN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rtun::run(cli.config).await
}
