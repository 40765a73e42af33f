use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use proteus::{
    dispatch::{serve_tcp, serve_udp},
    endpoint::RemoteSpec,
    rule::RuleSet,
};

#[derive(Debug, Parser)]
#[command(about = "transparent packet-altering stream editor")]
struct Cli {
    /// forwarded protocol, tcp or udp
    proto: String,
    /// local port to listen on
    local_port: u16,
    /// remote host, the literal 0 forwards to each flow's original
    /// destination
    remote_host: String,
    /// remote port, 0 keeps each flow's original destination port
    remote_port: u16,
    /// substitution rules, s/from/to[/count] with %XX hex escapes
    #[arg(required = true)]
    rules: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Proto {
    Tcp,
    Udp,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::SUCCESS
                }
                _ => ExitCode::FAILURE,
            };
        }
    };
    let proto = match cli.proto.to_ascii_lowercase().as_str() {
        "tcp" => Proto::Tcp,
        "udp" => Proto::Udp,
        other => {
            eprintln!("unrecognized protocol {other:?}, expected tcp or udp");
            return ExitCode::FAILURE;
        }
    };
    let rules = match RuleSet::parse(&cli.rules) {
        Ok(rules) => rules,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::FAILURE;
        }
    };
    match run(proto, cli, rules) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run(proto: Proto, cli: Cli, rules: RuleSet) -> anyhow::Result<()> {
    let remote = RemoteSpec::resolve(&cli.remote_host, cli.remote_port).await?;
    info!("{} rules loaded, {remote}", rules.len());
    let serve = async {
        match proto {
            Proto::Tcp => serve_tcp(cli.local_port, rules, remote).await,
            Proto::Udp => serve_udp(cli.local_port, rules, remote).await,
        }
    };
    tokio::select! {
        result = serve => result,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("interrupted");
            Ok(())
        }
    }
}
