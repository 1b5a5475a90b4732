//! Foreman relay daemon.
//!
//! This binary runs the relay tier as a standalone process. It connects
//! upstream to a master hub, listens for workers downstream, and relays
//! dispatch traffic until the master orders a shutdown.
//!
//! The bound downstream address is printed to stdout so launch scripts
//! can hand it to workers.
//!
//! # Usage
//!
//! ```sh
//! foreman-proxy --master tcp://10.1.0.5:5555 --listen 'tcp://*:6000'
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: terminate; both sides observe the disconnect

use std::time::Duration;

use foreman::net::{Endpoint, NetError, Timeout};
use foreman::proxy::{Proxy, ProxyConfig, ProxyError};

/// Default downstream listen address (any free port).
const DEFAULT_LISTEN: &str = "tcp://*:0";

/// How long to wait for the startup command after `--request-cmd`.
const CMD_WAIT_SECS: u64 = 30;

fn main() {
    if let Err(e) = run() {
        eprintln!("foreman-proxy: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), ProxyError> {
    foreman::trace::init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    eprintln!("foreman-proxy: connecting to {}", args.master);

    let mut proxy = Proxy::new(args.master, &args.listen, &args.config)?;
    let addr = proxy.address()?;

    // Launch scripts read the bound address from stdout.
    println!("{}", addr.to_url());
    eprintln!("foreman-proxy: listening on {addr}");

    if args.request_cmd {
        proxy.request_cmd()?;
        let cmd = proxy.receive_cmd(Timeout::Duration(Duration::from_secs(CMD_WAIT_SECS)))?;
        println!("{}", String::from_utf8_lossy(&cmd));
        eprintln!("foreman-proxy: startup command received");
    }

    eprintln!("foreman-proxy: ready");

    // SIGTERM/SIGINT keep their default disposition: the process dies
    // and the peers on both links observe the dropped connections.
    proxy.run()?;

    eprintln!("foreman-proxy: stopped");
    Ok(())
}

/// Parsed command line.
struct ProxyArgs {
    master: Endpoint,
    listen: Vec<Endpoint>,
    config: ProxyConfig,
    request_cmd: bool,
}

fn arg_error(msg: String) -> ProxyError {
    ProxyError::Net(NetError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        msg,
    )))
}

/// Parses command line arguments into a ProxyArgs.
fn parse_args(args: &[String]) -> Result<ProxyArgs, ProxyError> {
    let mut master: Option<Endpoint> = None;
    let mut listen: Vec<Endpoint> = Vec::new();
    let mut config = ProxyConfig::default();
    let mut request_cmd = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--master" | "-m" => {
                i += 1;
                if i >= args.len() {
                    return Err(arg_error("missing value for --master".into()));
                }
                master = Some(Endpoint::parse(&args[i])?);
            }
            "--listen" | "-l" => {
                i += 1;
                if i >= args.len() {
                    return Err(arg_error("missing value for --listen".into()));
                }
                listen.push(Endpoint::parse(&args[i])?);
            }
            "--timeout" | "-t" => {
                i += 1;
                if i >= args.len() {
                    return Err(arg_error("missing value for --timeout".into()));
                }
                let secs: u64 = args[i]
                    .parse()
                    .map_err(|e| arg_error(format!("invalid --timeout: {e}")))?;
                config.connect_timeout = Duration::from_secs(secs);
            }
            "--heartbeat" | "-b" => {
                i += 1;
                if i >= args.len() {
                    return Err(arg_error("missing value for --heartbeat".into()));
                }
                let secs: u64 = args[i]
                    .parse()
                    .map_err(|e| arg_error(format!("invalid --heartbeat: {e}")))?;
                config.heartbeat_interval = Duration::from_secs(secs);
            }
            "--request-cmd" | "-r" => {
                request_cmd = true;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => {
                return Err(arg_error(format!("unknown argument: {arg}")));
            }
        }
        i += 1;
    }

    let Some(master) = master else {
        return Err(arg_error("missing required --master".into()));
    };

    // Any free port if no listen pool was given
    if listen.is_empty() {
        listen.push(Endpoint::parse(DEFAULT_LISTEN)?);
    }

    Ok(ProxyArgs {
        master,
        listen,
        config,
        request_cmd,
    })
}

fn print_usage() {
    eprintln!(
        r#"foreman-proxy - relay tier for the foreman dispatch hub

USAGE:
    foreman-proxy --master <ADDR> [OPTIONS]

OPTIONS:
    -m, --master <ADDR>      Master hub address to connect upstream (required)
    -l, --listen <ADDR>      Downstream listen address, first free one is
                             bound (can be repeated; default: tcp://*:0)
    -t, --timeout <SECS>     Upstream connect timeout in seconds (default: 10)
    -b, --heartbeat <SECS>   Idle report interval in seconds (default: 10)
    -r, --request-cmd        Ask the master for a startup command and print it
    -h, --help               Print this help message

SIGNALS:
    SIGTERM, SIGINT          Terminate; both sides observe the disconnect

EXAMPLE:
    foreman-proxy --master tcp://10.1.0.5:5555 --listen 'tcp://*:6000'
    foreman-proxy -m tcp://10.1.0.5:5555 -l 'tcp://*:6000' -l 'tcp://*:6001'
"#
    );
}
