use std::process::exit;

use vspc::cli;
use vspc::config::Settings;
use vspc::server::VspcServer;

fn usage() {
    eprintln!("Usage: vspc [--config-file <file>] [options]");
    eprintln!();
    eprintln!("Options (each overrides the config file):");
    eprintln!("  --host <addr>            VM listener address (default 0.0.0.0)");
    eprintln!("  --port <port>            VM listener port (default 13370)");
    eprintln!("  --client-host <addr>     client listener address (default 127.0.0.1)");
    eprintln!("  --vm-start-port <port>   first client listener port (default 20000)");
    eprintln!("  --admin-host <addr>      admin listener address (default 127.0.0.1)");
    eprintln!("  --admin-port <port>      admin listener port (default 13371)");
    eprintln!("  --enable-clients         enable client listeners and the admin endpoint");
    eprintln!("  --cert <file>            TLS certificate for all listeners");
    eprintln!("  --key <file>             TLS key (defaults to the cert file)");
    eprintln!("  --uri <uri>              URI VMs must present in DO-PROXY (required)");
    eprintln!("  --serial-log-dir <dir>   directory for per-UUID serial logs (required)");
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("vspc: {e}");
            eprintln!();
            usage();
            exit(2);
        }
    };

    let mut settings = Settings::default();
    if let Some(path) = &args.config_file {
        settings = match Settings::load_file(path) {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("vspc: {}: {e}", path.display());
                exit(1);
            }
        };
    }
    let config = match settings.merge(args.overrides).into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("vspc: {e}");
            eprintln!();
            usage();
            exit(1);
        }
    };

    if !config.serial_log_dir.exists() {
        log::info!("Creating log directory: {}", config.serial_log_dir.display());
        if let Err(e) = std::fs::create_dir_all(&config.serial_log_dir) {
            eprintln!(
                "vspc: cannot create {}: {e}",
                config.serial_log_dir.display()
            );
            exit(1);
        }
    }

    let server = match VspcServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("vspc: {e}");
            exit(1);
        }
    };
    if let Err(e) = server.run().await {
        log::error!("server error: {e}");
        exit(1);
    }
}
