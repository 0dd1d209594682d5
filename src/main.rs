use clap::Parser;

use openhab_tunnel_gateway::app;
use openhab_tunnel_gateway::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    match app::run(config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("tunnel gateway exited: {e}");
            std::process::exit(e.exit_code());
        }
    }
}
