use std::{env, error::Error, fmt, net::SocketAddr, str::FromStr};

use getopts::{Matches, Options};
use graphite_exporter::{
    interval::parse_duration, ClientSettings, Config, ConfigError, GraphiteExporterBuilder,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

fn parse_or<T>(matches: &Matches, name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match matches.opt_str(name) {
        Some(value) => {
            value.parse().map_err(|e| format!("invalid value `{}` for --{}: {}", value, name, e))
        }
        None => Ok(default),
    }
}

/// Scheduled refreshes log from both the scheduler and the jobs it runs.
fn log_directives(log_level: &str, scheduler_level: &str) -> String {
    format!(
        "{},graphite_exporter::scheduler={},graphite_exporter::jobs={}",
        log_level, scheduler_level, scheduler_level
    )
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

fn client_settings(matches: &Matches) -> Result<ClientSettings, Box<dyn Error>> {
    let defaults = ClientSettings::default();
    let hosts = matches.opt_str("ip").map(|ip| split_list(&ip)).unwrap_or(defaults.hosts);
    let timeout = match matches.opt_str("timeout") {
        Some(timeout) => parse_duration(&timeout, "")?,
        None => defaults.timeout,
    };
    let basic_auth = matches.opt_str("username").map(|user| (user, matches.opt_str("password")));

    Ok(ClientSettings {
        hosts,
        port: parse_or(matches, "port", defaults.port)?,
        pool_maxsize: parse_or(matches, "pool-maxsize", defaults.pool_maxsize)?,
        pool_block: matches.opt_present("pool-block"),
        max_retries: parse_or(matches, "max-retries", defaults.max_retries)?,
        timeout,
        basic_auth,
        ..defaults
    })
}

fn load_config(path: &str) -> Result<Option<Config>, ConfigError> {
    match Config::load(path) {
        Ok(config) => Ok(Some(config)),
        Err(ConfigError::Io { path, source }) => {
            error!(path = %path.display(), error = %source, "can't read metric config, serving system metrics only");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!(error = %e, "can't listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("i", "ip", "comma-separated graphite-web hosts (default: 127.0.0.1)", "HOSTS");
    opts.optopt("p", "port", "graphite-web port (default: 5000)", "PORT");
    opts.optopt("P", "listen-port", "port to serve metrics on (default: 9108)", "PORT");
    opts.optopt("c", "config", "path to the metric configuration file", "FILE");
    opts.optopt(
        "s",
        "system-metric",
        "comma-separated system metrics to expose, empty to disable (default: all)",
        "NAMES",
    );
    opts.optopt("", "pool-maxsize", "idle connections kept per host (default: 10)", "COUNT");
    opts.optflag("", "pool-block", "wait for a free connection instead of opening a new one");
    opts.optopt("", "max-retries", "retries on transport errors (default: 3)", "COUNT");
    opts.optopt("", "timeout", "graphite request timeout, e.g. 10 or 10s (default: 10s)", "TIME");
    opts.optopt("", "username", "graphite-web basic auth user", "USER");
    opts.optopt("", "password", "graphite-web basic auth password", "PASSWORD");
    opts.optmulti("", "allow", "address or subnet allowed to scrape (default: any)", "CIDR");
    opts.optopt("l", "log-level", "log level (default: info)", "LEVEL");
    opts.optopt("L", "scheduler-log-level", "log level of scheduled refreshes (default: warn)", "LEVEL");
    opts.optflag("h", "help", "print this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("Failed to parse command line args: {}", f);
            return Ok(());
        }
    };

    if matches.opt_present("help") {
        print_usage(&program, &opts);
        return Ok(());
    }

    let log_level = matches.opt_str("log-level").unwrap_or_else(|| "info".to_owned());
    let scheduler_level =
        matches.opt_str("scheduler-log-level").unwrap_or_else(|| "warn".to_owned());
    let filter = EnvFilter::try_new(log_directives(&log_level, &scheduler_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listen_port: u16 = parse_or(&matches, "listen-port", 9108)?;
    let settings = client_settings(&matches)?;

    let mut builder = GraphiteExporterBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], listen_port)))
        .with_client_settings(settings);
    if let Some(names) = matches.opt_str("system-metric") {
        builder = builder.with_system_metrics(split_list(&names));
    }
    for address in matches.opt_strs("allow") {
        builder = builder.add_allowed_address(address)?;
    }
    if let Some(path) = matches.opt_str("config") {
        if let Some(config) = load_config(&path)? {
            info!(path = %path, metrics = config.metrics.len(), "loaded metric config");
            builder = builder.with_config(config);
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let (exporter, server) = builder.build()?;
        info!(address = %exporter.local_address(), "serving metrics");

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(error = %e, "metrics endpoint stopped");
                    return Err(e.into());
                }
            }
            signal = shutdown_signal() => {
                info!(signal, "received signal, shutting down");
            }
        }

        exporter.scheduler().shutdown();
        Ok::<_, Box<dyn Error>>(())
    })
}

#[cfg(test)]
mod tests {
    use super::{log_directives, split_list};

    #[test]
    fn test_scheduler_level_covers_jobs() {
        assert_eq!(
            log_directives("info", "error"),
            "info,graphite_exporter::scheduler=error,graphite_exporter::jobs=error"
        );
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(" a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
