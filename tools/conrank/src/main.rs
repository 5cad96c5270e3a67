use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = conrank::Cli::parse();
    if let Err(e) = conrank::run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
