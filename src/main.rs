//! Striped Storage - command line entry point
//!
//! One binary runs every role: the coordinator, a storage node, an
//! interactive user, or a self-contained demo cluster.

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::fs::File;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};
use StripedStorage::client::repl::{self, Outcome};
use StripedStorage::coordinator::{CoordinatorHandle, CoordinatorServer};
use StripedStorage::protocol::Registration;
use StripedStorage::{demo, Client, Config, Dashboard, DiskNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let mut config = Config::default();
    if let Some(ms) = matches.get_one::<u64>("timeout") {
        config.request_timeout = Duration::from_millis(*ms);
    }
    if let Some(attempts) = matches.get_one::<usize>("attempts") {
        config.attempts = *attempts;
    }
    if let Some(segment) = matches.get_one::<usize>("segment-size") {
        config.segment_size = *segment;
    }

    let level = if matches.get_flag("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };

    match matches.subcommand() {
        Some(("coordinator", sub)) => {
            if let Some(n) = sub.get_one::<usize>("max-disks") {
                config.max_disks = *n;
            }
            if let Some(n) = sub.get_one::<usize>("max-users") {
                config.max_users = *n;
            }
            config.validate()?;
            run_coordinator(sub, &config, level).await
        }
        Some(("disk", sub)) => {
            config.validate()?;
            init_logging(level);
            run_disk(sub, &config).await
        }
        Some(("user", sub)) => {
            config.validate()?;
            init_logging(level);
            run_user(sub, &config).await
        }
        Some(("demo", sub)) => {
            config.validate()?;
            init_logging(level);
            let disks = sub.get_one::<usize>("disks").copied().unwrap_or(4);
            demo::run(&config, disks).await
        }
        _ => Err(anyhow!("no role given; see --help")),
    }
}

fn cli() -> Command {
    let manager = Arg::new("manager")
        .short('m')
        .long("manager")
        .value_name("IP:PORT")
        .help("Coordinator address")
        .value_parser(clap::value_parser!(SocketAddr))
        .required(true);
    let ip = Arg::new("ip")
        .long("ip")
        .value_name("IP")
        .help("Address to bind and advertise")
        .value_parser(clap::value_parser!(IpAddr))
        .default_value("127.0.0.1");
    let mport = Arg::new("mport")
        .long("mport")
        .value_name("PORT")
        .help("Control port")
        .value_parser(clap::value_parser!(u16).range(1..))
        .required(true);
    let cport = Arg::new("cport")
        .long("cport")
        .value_name("PORT")
        .help("Data port")
        .value_parser(clap::value_parser!(u16).range(1..))
        .required(true);

    Command::new("striped-storage")
        .version("0.1.0")
        .about("Distributed striped storage with rotating XOR parity")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Log every datagram")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Reply timeout per attempt")
                .value_parser(clap::value_parser!(u64))
                .global(true),
        )
        .arg(
            Arg::new("attempts")
                .long("attempts")
                .value_name("COUNT")
                .help("Attempts per request before a peer counts as unreachable")
                .value_parser(clap::value_parser!(usize))
                .global(true),
        )
        .arg(
            Arg::new("segment-size")
                .long("segment-size")
                .value_name("BYTES")
                .help("Largest block payload per datagram")
                .value_parser(clap::value_parser!(usize))
                .global(true),
        )
        .subcommand(
            Command::new("coordinator")
                .about("Run the coordinator")
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16))
                        .default_value("5000"),
                )
                .arg(
                    Arg::new("bind")
                        .long("bind")
                        .value_name("IP")
                        .value_parser(clap::value_parser!(IpAddr))
                        .default_value("0.0.0.0"),
                )
                .arg(
                    Arg::new("max-disks")
                        .long("max-disks")
                        .value_name("COUNT")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("max-users")
                        .long("max-users")
                        .value_name("COUNT")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("dashboard")
                        .long("dashboard")
                        .help("Show a live view of disks, groups and activity")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("log-file")
                        .long("log-file")
                        .value_name("PATH")
                        .help("Where logs go while the dashboard is shown"),
                ),
        )
        .subcommand(
            Command::new("disk")
                .about("Run a storage node")
                .arg(Arg::new("name").required(true))
                .arg(manager.clone())
                .arg(ip.clone())
                .arg(mport.clone())
                .arg(cport.clone()),
        )
        .subcommand(
            Command::new("user")
                .about("Run an interactive client")
                .arg(Arg::new("name").required(true))
                .arg(manager)
                .arg(ip)
                .arg(mport)
                .arg(cport),
        )
        .subcommand(
            Command::new("demo")
                .about("Run the scenarios against an in-process cluster")
                .arg(
                    Arg::new("disks")
                        .short('n')
                        .long("disks")
                        .value_name("COUNT")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("4"),
                ),
        )
}

fn init_logging(level: Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn required<'a, T: Clone + Send + Sync + 'static>(m: &'a ArgMatches, id: &str) -> anyhow::Result<&'a T> {
    m.get_one::<T>(id).ok_or_else(|| anyhow!("missing --{}", id))
}

async fn run_coordinator(m: &ArgMatches, config: &Config, level: Level) -> anyhow::Result<()> {
    let addr = SocketAddr::new(*required::<IpAddr>(m, "bind")?, *required::<u16>(m, "port")?);
    let dashboard = m.get_flag("dashboard");

    if dashboard {
        // the dashboard owns the terminal; logs go to a file or nowhere
        if let Some(path) = m.get_one::<String>("log-file") {
            let file = File::create(path).with_context(|| format!("creating {}", path))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
    } else {
        init_logging(level);
    }

    let handle = CoordinatorHandle::spawn(config);
    let server = CoordinatorServer::bind(addr, handle.clone()).await?;
    let listen = server.local_addr()?;
    let server = tokio::spawn(server.run());

    if dashboard {
        let mut ui = Dashboard::new(listen)?;
        ui.run(handle).await?;
        server.abort();
        return Ok(());
    }

    tokio::select! {
        joined = server => joined??,
        _ = tokio::signal::ctrl_c() => info!("Coordinator shutting down"),
    }
    Ok(())
}

async fn run_disk(m: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let name = required::<String>(m, "name")?;
    let manager = *required::<SocketAddr>(m, "manager")?;
    let node = DiskNode::bind(
        name.clone(),
        *required::<IpAddr>(m, "ip")?,
        *required::<u16>(m, "mport")?,
        *required::<u16>(m, "cport")?,
        config,
    )
    .await?;
    Arc::new(node).run(manager).await?;
    Ok(())
}

async fn run_user(m: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let registration = Registration::new(
        required::<String>(m, "name")?.clone(),
        *required::<IpAddr>(m, "ip")?,
        *required::<u16>(m, "mport")?,
        *required::<u16>(m, "cport")?,
    );
    let client = Client::new(registration, *required::<SocketAddr>(m, "manager")?, config);
    client.register().await?;
    println!("{}", repl::USAGE);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{}> ", client.name());
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match repl::execute(&client, &line).await {
            Ok(Outcome::Print(text)) if text.is_empty() => {}
            Ok(Outcome::Print(text)) => println!("{}", text),
            Ok(Outcome::Quit) => break,
            Err(e) => println!("error: {}", e),
        }
    }

    client.deregister().await?;
    Ok(())
}
