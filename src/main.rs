//! Linkwire - Command-line client for line-oriented instruments
//!
//! Sends commands to an instrument server and prints the replies. Runs in
//! one of three ways:
//!
//! - commands given on the command line, once or polled with `--repeat`
//! - commands read line by line from stdin
//! - `--bench N`, pipelining the commands N times and reporting throughput

use linkwire::{
    ChannelConfig, ChannelState, Command, CommandChannel, Endpoint, ReconnectPolicy,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variable consulted when no endpoint flag is given
const ENDPOINT_ENV: &str = "LINKWIRE_ENDPOINT";

/// Client configuration
struct Config {
    /// Instrument to talk to
    endpoint: Endpoint,
    /// Per-command response timeout
    timeout: Duration,
    /// Pause between polled commands
    interval: Duration,
    /// Cycle through the commands until interrupted
    repeat: bool,
    /// Number of passes over the commands in bench mode
    bench: Option<usize>,
    /// Outstanding commands in bench mode
    concurrency: usize,
    /// Reconnect automatically after a connection loss
    reconnect: bool,
    /// Commands given on the command line
    commands: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            timeout: Duration::from_secs(5),
            interval: Duration::ZERO,
            repeat: false,
            bench: None,
            concurrency: 1,
            reconnect: true,
            commands: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();
        let mut endpoint_flag = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--tcp" | "-t" => {
                    let value = value_of(&args, i, "--tcp");
                    config.endpoint = parse_or_exit(&format!("tcp://{}", value), "endpoint");
                    endpoint_flag = true;
                    i += 2;
                }
                "--unix" | "-u" => {
                    config.endpoint = Endpoint::unix(value_of(&args, i, "--unix"));
                    endpoint_flag = true;
                    i += 2;
                }
                "--timeout" => {
                    let ms: u64 = parse_or_exit(value_of(&args, i, "--timeout"), "timeout");
                    config.timeout = Duration::from_millis(ms);
                    i += 2;
                }
                "--interval" => {
                    let ms: u64 = parse_or_exit(value_of(&args, i, "--interval"), "interval");
                    config.interval = Duration::from_millis(ms);
                    i += 2;
                }
                "--repeat" | "-r" => {
                    config.repeat = true;
                    i += 1;
                }
                "--bench" => {
                    config.bench = Some(parse_or_exit(value_of(&args, i, "--bench"), "count"));
                    i += 2;
                }
                "--concurrency" | "-c" => {
                    config.concurrency =
                        parse_or_exit(value_of(&args, i, "--concurrency"), "concurrency");
                    i += 2;
                }
                "--no-reconnect" => {
                    config.reconnect = false;
                    i += 1;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("linkwire version {}", linkwire::VERSION);
                    std::process::exit(0);
                }
                flag if flag.starts_with("--") => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
                command => {
                    config.commands.push(command.to_string());
                    i += 1;
                }
            }
        }

        if !endpoint_flag {
            if let Ok(value) = std::env::var(ENDPOINT_ENV) {
                config.endpoint = parse_or_exit(&value, ENDPOINT_ENV);
            }
        }

        config
    }

    fn channel_config(&self) -> ChannelConfig {
        let reconnect = if !self.reconnect {
            ReconnectPolicy::disabled()
        } else if self.repeat {
            // Polling keeps going however long the instrument is away
            ReconnectPolicy {
                max_attempts: None,
                ..ReconnectPolicy::default()
            }
        } else {
            ReconnectPolicy::default()
        };
        ChannelConfig::new(self.endpoint.clone())
            .with_call_timeout(self.timeout)
            .with_reconnect(reconnect)
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_or_exit<T: std::str::FromStr>(value: &str, what: &str) -> T
where
    T::Err: std::fmt::Display,
{
    value.parse().unwrap_or_else(|e| {
        eprintln!("Error: invalid {} '{}': {}", what, value, e);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
Linkwire - Command-line client for line-oriented instruments

USAGE:
    linkwire [OPTIONS] [COMMAND ...]

OPTIONS:
    -t, --tcp <HOST:PORT>     Connect over TCP (default: localhost:5001)
    -u, --unix <PATH>         Connect over a Unix socket (e.g. /var/tmp/reg-socket)
        --timeout <MS>        Response timeout per command (default: 5000)
        --interval <MS>       Pause between commands (default: 0)
    -r, --repeat              Cycle through the commands until Ctrl+C
        --bench <N>           Pipeline the commands N times and report throughput
    -c, --concurrency <N>     Commands in flight during --bench (default: 1)
        --no-reconnect        Do not reconnect after the connection drops
    -v, --version             Print version information
    -h, --help                Print this help message

ENVIRONMENT:
    LINKWIRE_ENDPOINT         Endpoint used when neither --tcp nor --unix is given,
                              e.g. tcp://10.0.0.7:5001 or unix:///var/tmp/reg-socket
    RUST_LOG                  Log filter (default: info)

With no COMMAND, commands are read from stdin, one per line.

EXAMPLES:
    linkwire getDebug                                # One command over TCP
    linkwire --unix /var/tmp/reg-socket getDebug     # Same over a Unix socket
    linkwire -r --interval 500 getVoltage getCurrent # Poll two readings
    linkwire --bench 10000 -c 16 getDebug            # Measure throughput
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging on stderr so replies stay alone on stdout
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let channel = open_channel(&config).await?;

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Interrupted, closing channel...");
    };

    let outcome = tokio::select! {
        result = run(&channel, &config) => result,
        _ = shutdown => Ok(()),
    };

    let stats = channel.stats();
    channel.close();
    info!(
        sent = stats.commands_sent,
        matched = stats.responses_matched,
        timeouts = stats.timeouts,
        reconnects = stats.reconnects,
        mean_latency = ?stats.mean_latency,
        "Channel closed"
    );

    outcome
}

/// Polling tolerates an instrument that is not up yet; everything else
/// fails fast when the first connect fails.
async fn open_channel(config: &Config) -> anyhow::Result<CommandChannel> {
    if config.repeat {
        info!(endpoint = %config.endpoint, "Connecting in the background");
        return Ok(CommandChannel::open(config.channel_config()));
    }
    Ok(CommandChannel::connect(config.channel_config()).await?)
}

async fn run(channel: &CommandChannel, config: &Config) -> anyhow::Result<()> {
    if let Some(passes) = config.bench {
        return bench(channel, config, passes).await;
    }

    if config.commands.is_empty() {
        return run_stdin(channel).await;
    }

    let mut failures = 0usize;
    loop {
        for command in &config.commands {
            if !call_and_print(channel, command, config.timeout).await {
                failures += 1;
            }
            if !config.interval.is_zero() {
                tokio::time::sleep(config.interval).await;
            }
        }

        if !config.repeat {
            break;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} commands failed", failures, config.commands.len());
    }
    Ok(())
}

/// Sends one command and prints the exchange. Returns false on failure.
async fn call_and_print(channel: &CommandChannel, command: &str, timeout: Duration) -> bool {
    println!("> {}", command);
    match channel.call(command, timeout).await {
        Ok(reply) => {
            println!("< {}", reply);
            true
        }
        Err(e) => {
            eprintln!("! {}", e);
            if channel.state() != ChannelState::Ready {
                warn!(state = %channel.state(), "Channel not ready");
            }
            false
        }
    }
}

async fn run_stdin(channel: &CommandChannel) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let timeout = channel.config().call_timeout;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        call_and_print(channel, line, timeout).await;
    }
    Ok(())
}

async fn bench(channel: &CommandChannel, config: &Config, passes: usize) -> anyhow::Result<()> {
    if config.commands.is_empty() {
        anyhow::bail!("--bench needs at least one command");
    }

    let commands = config
        .commands
        .iter()
        .map(|text| Command::new(text.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let total = commands.len() * passes;
    let batch = commands.iter().cycle().take(total).cloned();

    info!(
        endpoint = %channel.endpoint(),
        commands = total,
        concurrency = config.concurrency,
        "Starting benchmark"
    );

    let report = channel.call_batch(batch, config.concurrency).collect().await;

    println!("Commands:     {}", report.results.len());
    println!("Failures:     {}", report.failures());
    println!("Elapsed:      {:.3}s", report.elapsed.as_secs_f64());
    println!("Throughput:   {:.0} commands/sec", report.throughput());

    if let Some((command, Err(e))) = report.results.iter().find(|(_, r)| r.is_err()) {
        warn!(command = %command, error = %e, "First failure");
    }
    Ok(())
}
