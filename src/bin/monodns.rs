use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{env, thread};

use getopts::Options;

use monodns::dns::cache::DnsCache;
use monodns::dns::client::DnsNetworkClient;
use monodns::dns::config::{ResolvedConfigParser, DEFAULT_CONFIG_PATH};
use monodns::dns::handler::DnsHandler;
use monodns::dns::pool::WorkerPool;
use monodns::dns::resolve::UpstreamResolver;
use monodns::dns::server::DnsServer;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn main() {
    simple_logger::init().expect("Failed to initialize logger");

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optopt(
        "c",
        "config",
        "Path to resolved.conf (default: /etc/systemd/resolved.conf)",
        "PATH",
    );

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            std::process::exit(2);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let config_path = opt_matches
        .opt_str("c")
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let parser = ResolvedConfigParser::new();
    let config = match parser.parse(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to resolve configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(warning) = &config.warning {
        log::warn!("{}", warning);
    }

    log::info!("Starting DNS proxy");
    log::info!(
        "Primary DNS: [{}]",
        config
            .dns
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    log::info!(
        "Fallback DNS: [{}]",
        config
            .fallback_dns
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    log::info!("Cache enabled: {}", config.cache);

    let resolver = UpstreamResolver::new(&config, Box::new(DnsNetworkClient::new()));
    let handler = Arc::new(DnsHandler::new(
        resolver,
        Arc::new(DnsCache::new()),
        config.cache,
    ));
    let pool = Arc::new(WorkerPool::new().expect("Failed to spawn worker pool"));

    let server = DnsServer::new(&config, handler, pool);
    if let Err(e) = server.start() {
        log::error!("Failed to start DNS server: {}", e);
        std::process::exit(1);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(signal, shutdown.clone()) {
            log::warn!("Failed to register signal handler: {}", e);
        }
    }

    while !shutdown.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(500));
    }

    log::info!("Shutting down DNS proxy");
    server.close();
}
