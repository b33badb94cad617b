use clap::{Arg, ArgAction, Command};
use known_senders::config::Config;
use known_senders::ignore_list::{IgnoreList, IgnoreListHandle};
use known_senders::milter::Milter;
use known_senders::relay::RelayPolicy;
use known_senders::store::{self, ReputationClient};
use known_senders::DomainUtils;
use log::LevelFilter;
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let matches = Command::new("known-senders")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Milter that tracks which remote domains local users write to")
        .long_about(
            "known-senders counts, per organizational domain, the remote domains that\n\
             local users send mail to. Inbound mail whose sender domain is verified by\n\
             FCrDNS, SPF or DKIM is annotated when the recipient's domain has written\n\
             to that sender before.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/known-senders.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("query")
                .long("query")
                .value_names(["LOCAL", "REMOTE"])
                .num_args(2)
                .help("Show how often LOCAL's users have written to REMOTE"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "/etc/known-senders.yaml".to_string());

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if matches.get_flag("daemon") {
        #[cfg(unix)]
        daemonize(config.pid_file.as_deref());

        #[cfg(not(unix))]
        log::warn!("Daemon mode not supported on this platform, running in foreground");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Some(mut pair) = matches.get_many::<String>("query") {
        let (Some(local), Some(remote)) = (pair.next(), pair.next()) else {
            eprintln!("--query needs LOCAL and REMOTE");
            process::exit(2);
        };
        let code = runtime.block_on(query(&config, local, remote));
        process::exit(code);
    }

    let result = runtime.block_on(serve(config, config_path));
    if let Err(e) = result {
        log::error!("Milter error: {e:#}");
        process::exit(1);
    }
}

async fn serve(config: Config, config_path: String) -> anyhow::Result<()> {
    let store = store::from_config(&config.store)?;
    let milter = Milter::new(&config, store)?;

    #[cfg(unix)]
    spawn_reload_on_hangup(milter.ignore_list(), config_path);
    #[cfg(not(unix))]
    let _ = config_path;

    log::info!("Starting known-senders...");
    let result = milter.run(&config.socket_path, shutdown_signal()).await;

    if let Some(pid_file) = config.pid_file.as_deref() {
        if std::path::Path::new(pid_file).exists() {
            if let Err(e) = std::fs::remove_file(pid_file) {
                log::warn!("Failed to remove PID file: {e}");
            }
        }
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    log::info!("Received shutdown signal, stopping");
}

/// Re-read the ignore list on SIGHUP. A broken file keeps the current list.
#[cfg(unix)]
fn spawn_reload_on_hangup(handle: Arc<IgnoreListHandle>, config_path: String) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                log::warn!("Cannot listen for SIGHUP, ignore list will not reload: {e}");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            if let Err(e) = handle.reload_from_file(&config_path) {
                log::error!("{e}; keeping previous ignore list");
            }
        }
    });
}

async fn query(config: &Config, local: &str, remote: &str) -> i32 {
    let (Some(local_od), Some(remote_od)) = (
        DomainUtils::organizational_domain(local),
        DomainUtils::organizational_domain(remote),
    ) else {
        eprintln!("❌ Not a valid domain: {local} / {remote}");
        return 2;
    };

    let store = match store::from_config(&config.store) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("❌ Failed to open store: {e:#}");
            return 1;
        }
    };
    let client = ReputationClient::new(store, Duration::from_millis(config.store.timeout_ms));

    match client.query(&local_od, &remote_od).await {
        Ok(Some(count)) => {
            println!("{local_od} -> {remote_od}: {count}");
            0
        }
        Ok(None) => {
            println!("{local_od} -> {remote_od}: never");
            0
        }
        Err(e) => {
            eprintln!("❌ Store query failed: {e}");
            1
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Socket: {}", config.socket_path);
    println!("Store: {:?} {}", config.store.backend, config.store.url);

    let mut ok = true;
    match IgnoreList::new(config.ignored_ods.iter().cloned()) {
        Ok(list) => println!("Ignored organizational domains: {}", list.len()),
        Err(e) => {
            println!("❌ {e}");
            ok = false;
        }
    }
    match RelayPolicy::from_config(&config.relay) {
        Ok(_) => println!("Relay networks: {}", config.relay.networks.join(", ")),
        Err(e) => {
            println!("❌ {e:#}");
            ok = false;
        }
    }
    if let Err(e) = store::from_config(&config.store) {
        println!("❌ {e:#}");
        ok = false;
    }
    match config.milter.authserv_id.as_deref() {
        Some(id) => println!("Trusted authserv-id: {id}"),
        None => println!("⚠️  No authserv-id: DKIM verdicts will not be read"),
    }

    if ok {
        println!("✅ Configuration validated");
    } else {
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

/// Detach from the terminal. Must run before the async runtime starts threads.
#[cfg(unix)]
fn daemonize(pid_file: Option<&str>) {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    log::info!("Starting known-senders in daemon mode...");

    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to fork process");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        log::error!("Failed to create new session");
        process::exit(1);
    }

    // Second fork: never reacquire a controlling terminal.
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to second fork");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if std::env::set_current_dir("/").is_err() {
        log::warn!("Failed to change working directory to /");
    }
    unsafe {
        libc::umask(0o022);
    }

    match OpenOptions::new().read(true).write(true).open("/dev/null") {
        Ok(dev_null) => {
            let null_fd = dev_null.as_raw_fd();
            unsafe {
                libc::dup2(null_fd, 0);
                libc::dup2(null_fd, 1);
                libc::dup2(null_fd, 2);
            }
        }
        Err(e) => log::warn!("Failed to open /dev/null: {e}"),
    }

    if let Some(pid_file) = pid_file {
        let pid = process::id();
        if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
            log::warn!("Failed to write PID file: {e}");
        } else {
            log::info!("PID file written: {pid_file} ({pid})");
        }
    }
}
