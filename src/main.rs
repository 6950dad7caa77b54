//! The dnsload command line.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dnsload::config::{
    self, Config, Diag, DropLimit, Family, MIN_RANDOM_OFFSET,
};
use dnsload::error::Error;
use dnsload::run::{Driver, ExitReason};
use dnsload::template::Template;

/// The TCP port DNS servers listen on.
const DNS_PORT: u16 = 53;

//------------ Args ----------------------------------------------------------

/// Generate paced TCP DNS load against a server.
#[derive(Debug, Parser)]
#[command(
    name = "dnsload",
    version,
    disable_version_flag = true,
    about = "Generate paced TCP DNS load against a server",
    after_help = "Errors:\n\
                  - local limits: reached local system limits when opening \
                  a connection\n\
                  - bad connects: connection failed (from \
                  getsockopt(SO_ERROR))\n\
                  - connect time outs: connect timed out\n\
                  - bad sends: send failed\n\
                  - bad recvs: recv failed transiently\n\
                  - recv time outs: timed out waiting for a response\n\
                  - too shorts: received a too short message\n\
                  - bad IDs: the ID mismatches between the query and the \
                  response\n\
                  - not responses: received a message without the QR bit\n\
                  \n\
                  The exit status is 0 on complete success, 1 for a \
                  general error, 2 for an error in the command line \
                  arguments, and 3 if the run completed but one or more \
                  exchanges did not."
)]
struct Args {
    /// TCP/IPv4 operation (default). Incompatible with -6.
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// TCP/IPv6 operation. Incompatible with -4.
    #[arg(short = '6')]
    ipv6: bool,

    /// Add an EDNS0 option with the DO flag.
    #[arg(short = '0')]
    edns0: bool,

    /// Change the default template to get NXDOMAIN responses.
    #[arg(short = 'X')]
    nxdomain: bool,

    /// Initiate this many TCP DNS connections per second.
    #[arg(short = 'r', value_name = "rate", default_value_t = config::DEFAULT_RATE)]
    rate: u32,

    /// Delay in seconds between two periodic reports.
    #[arg(short = 't', value_name = "report")]
    report: Option<u32>,

    /// Initiate this many transactions, then drain and stop.
    #[arg(short = 'n', value_name = "num-request")]
    num_req: Option<u64>,

    /// Send requests for this test period, in seconds.
    #[arg(short = 'p', value_name = "test-period")]
    period: Option<u32>,

    /// Time in seconds after which a query is treated as lost.
    #[arg(short = 'd', value_name = "drop-time", default_value_t = 1.0)]
    drop_time: f64,

    /// Abort after this many dropped requests, or after "N%" of them.
    #[arg(short = 'D', value_name = "max-drop", value_parser = parse_max_drop)]
    max_drop: Option<DropLimit>,

    /// Local hostname/address to use when communicating with the server.
    #[arg(short = 'l', value_name = "local-addr")]
    local: Option<String>,

    /// Initiate this many exchanges back to back at startup.
    #[arg(short = 'P', value_name = "preload", default_value_t = 0)]
    preload: u32,

    /// Connections initiated before the next pause when behind the rate.
    #[arg(short = 'a', value_name = "aggressivity", default_value_t = config::DEFAULT_AGGRESSIVITY)]
    aggressivity: u32,

    /// Size of the exchange tables (must be greater than 1000).
    #[arg(short = 'M', value_name = "memory", default_value_t = config::DEFAULT_CAPACITY)]
    capacity: usize,

    /// Seed for randomization, making runs repeatable.
    #[arg(short = 's', value_name = "seed")]
    seed: Option<u64>,

    /// File containing the query template as hexadecimal digits.
    #[arg(short = 'T', value_name = "template-file")]
    template_file: Option<PathBuf>,

    /// Offset of the last octet to randomize in the template.
    #[arg(short = 'O', value_name = "random-offset")]
    random_offset: Option<usize>,

    /// Diagnostic selectors: a=arguments, e=exit reason, i=rate details,
    /// T=template dump.
    #[arg(short = 'x', value_name = "diagnostic-selector")]
    diag: Option<String>,

    /// Report the version number of this program.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Name or address of the DNS server to contact.
    #[arg(value_name = "server")]
    server: String,
}

/// Parses the argument of `-D`: a count or a percentage.
fn parse_max_drop(arg: &str) -> Result<DropLimit, String> {
    if let Some(percent) = arg.strip_suffix('%') {
        let value: f64 = percent
            .parse()
            .map_err(|_| "invalid max-drop percentage".to_string())?;
        if value <= 0. || value >= 100. {
            return Err("invalid max-drop percentage".into());
        }
        Ok(DropLimit::Percent(value))
    } else {
        let value: u64 = arg
            .parse()
            .map_err(|_| "max-drop must be a positive integer".to_string())?;
        if value == 0 {
            return Err("max-drop must be a positive integer".into());
        }
        Ok(DropLimit::Count(value))
    }
}

//------------ Setup Helpers -------------------------------------------------

/// Rejects argument combinations clap cannot express.
fn validate(args: &Args) -> Result<(), String> {
    if args.rate == 0 {
        return Err("rate must be a positive integer".into());
    }
    if args.aggressivity == 0 {
        return Err("aggressivity must be a positive integer".into());
    }
    if args.capacity <= config::MIN_CAPACITY {
        return Err("memory must be greater than 1000".into());
    }
    if args.drop_time <= 0. {
        return Err("drop-time must be a positive number".into());
    }
    if matches!(args.report, Some(0)) {
        return Err("report must be a positive integer".into());
    }
    if matches!(args.num_req, Some(0)) {
        return Err("num-request must be a positive integer".into());
    }
    if matches!(args.period, Some(0)) {
        return Err("test-period must be a positive integer".into());
    }
    if let Some(offset) = args.random_offset {
        if args.template_file.is_none() {
            return Err(
                "-T<template-file> must be set to use -O<random-offset>"
                    .into(),
            );
        }
        if offset < MIN_RANDOM_OFFSET {
            return Err(format!(
                "random-offset must be at least {}",
                MIN_RANDOM_OFFSET
            ));
        }
    }
    Ok(())
}

/// Resolves a name to the single address the run will use.
///
/// The first address of the requested family wins.
fn resolve(name: &str, family: Family) -> Result<SocketAddr, Error> {
    let addrs = (name, DNS_PORT)
        .to_socket_addrs()
        .map_err(|_| Error::NoAddress(name.into()))?;
    addrs
        .into_iter()
        .find(|addr| family.matches(addr))
        .ok_or_else(|| Error::NoAddress(name.into()))
}

/// Builds the template the way the arguments ask for.
fn make_template(args: &Args, family: Family) -> Result<Template, Error> {
    match args.template_file {
        Some(ref path) => {
            Ok(Template::from_file(path, args.random_offset)?)
        }
        None => Ok(Template::build(family, args.edns0, args.nxdomain)),
    }
}

/// Prints the internal view of the command line (diagnostic `a`).
fn echo_args(args: &Args, cfg: &Config, family: Family) {
    let mut line = format!(
        "IPv{} rate={}",
        match family {
            Family::V4 => 4,
            Family::V6 => 6,
        },
        cfg.rate
    );
    if args.edns0 {
        line.push_str(" EDNS0");
    }
    if let Some(report) = args.report {
        line.push_str(&format!(" report={}", report));
    }
    if let Some(num_req) = cfg.num_req {
        line.push_str(&format!(" num-request={}", num_req));
    }
    if let Some(period) = args.period {
        line.push_str(&format!(" test-period={}", period));
    }
    line.push_str(&format!(" drop-time={}", args.drop_time));
    match cfg.max_drop {
        Some(DropLimit::Count(count)) => {
            line.push_str(&format!(" max-drop={}", count));
        }
        Some(DropLimit::Percent(percent)) => {
            line.push_str(&format!(" max-drop={:2.2}%", percent));
        }
        None => {}
    }
    if cfg.preload != 0 {
        line.push_str(&format!(" preload={}", cfg.preload));
    }
    line.push_str(&format!(" aggressivity={}", cfg.aggressivity));
    if let Some(seed) = cfg.seed {
        line.push_str(&format!(" seed={}", seed));
    }
    if let Some(ref path) = args.template_file {
        line.push_str(&format!(" template-file='{}'", path.display()));
    } else if args.nxdomain {
        line.push_str(" Xflag");
    }
    if let Some(offset) = args.random_offset {
        line.push_str(&format!(" rnd-offset={}", offset));
    }
    if let Some(ref diag) = args.diag {
        line.push_str(&format!(" diagnostic-selectors='{}'", diag));
    }
    println!("{}", line);
    println!("server='{}'", cfg.server);
    if let Some(local) = cfg.local {
        println!("local-addr='{}'", local);
    }
}

/// Dumps the template (diagnostic `T`).
fn dump_template(template: &Template) {
    println!("length = {:#x}", template.len());
    if let Some(offset) = template.random_offset() {
        println!("random offset = {}", offset);
    }
    println!("content:");
    for (i, octet) in template.as_slice().iter().enumerate() {
        if i % 16 == 0 {
            if i != 0 {
                println!();
            }
        } else {
            print!(" ");
        }
        print!("{:02x}", octet);
    }
    println!();
    println!();
}

//------------ Entry Point ---------------------------------------------------

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .without_time()
        .try_init()
        .ok();

    if let Err(msg) = validate(&args) {
        eprintln!("{}", msg);
        return ExitCode::from(2);
    }

    match run(&args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("dnsload: {}", err);
            ExitCode::from(err.exit_code())
        }
    }
}

/// Sets up and runs the load, returning the process exit code.
fn run(args: &Args) -> Result<ExitCode, Error> {
    let family = match (args.ipv4, args.ipv6) {
        (false, true) => Family::V6,
        _ => Family::V4,
    };
    let server = resolve(&args.server, family)?;
    let local = match args.local {
        Some(ref name) => Some(resolve(name, family)?),
        None => None,
    };
    let template = make_template(args, family)?;

    let mut cfg = Config::new(server);
    cfg.local = local;
    cfg.rate = args.rate;
    cfg.aggressivity = args.aggressivity;
    cfg.preload = args.preload;
    cfg.capacity = args.capacity;
    cfg.drop_time = Duration::from_secs_f64(args.drop_time);
    cfg.report = args.report.map(|secs| Duration::from_secs(secs.into()));
    cfg.num_req = args.num_req;
    cfg.period = args.period.map(|secs| Duration::from_secs(secs.into()));
    cfg.max_drop = args.max_drop;
    cfg.seed = args.seed;
    cfg.diag = match args.diag {
        Some(ref selectors) => Diag::from_selectors(selectors),
        None => Diag::default(),
    };

    if cfg.diag.args {
        echo_args(args, &cfg, family);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    if let Err(err) =
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
    {
        warn!("cannot install the interrupt handler: {}", err);
    }

    let mut driver = Driver::new(cfg.clone(), template.clone(), interrupted)?;
    let reason = match driver.run() {
        Ok(reason) => reason,
        Err(err) => {
            eprintln!("initial connect failed: {}", err);
            return Ok(ExitCode::from(1));
        }
    };

    let instrumentation = if cfg.diag.rate {
        Some((driver.pool().used(), driver.pool().capacity()))
    } else {
        None
    };
    let stats = driver.stats();
    stats.final_report(driver.elapsed(), cfg.rate, instrumentation);
    if cfg.diag.template {
        dump_template(&template);
    }

    Ok(if reason == ExitReason::Fatal {
        ExitCode::from(1)
    } else if stats.sends_ok == stats.receives_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(3)
    })
}
