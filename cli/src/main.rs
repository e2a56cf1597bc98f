use clap::Parser;
use magus_cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = magus_cli::run_main(cli).await;
    std::process::exit(code);
}
