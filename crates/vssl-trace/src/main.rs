use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::Serialize;
use tracing::info;
use vssl_bridge::loopback::{self, HandshakeOutcome, HandshakeScript, PeerCertificate};
use vssl_bridge::{
    BridgeConfig, Connection, Context, LogFormat, ProtocolVersion, ServernameStatus, VerifyMode,
};

#[derive(Parser, Debug)]
#[command(
    name = "vssl-trace",
    version,
    about = "Drive a loopback TLS handshake through the vssl callback bridge"
)]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log format; overrides the config file.
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Report format.
    #[arg(long, value_enum, default_value_t = Output::Text)]
    output: Output,

    /// Bridge config file (.json, .yaml or .yml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server name the client sends.
    #[arg(long)]
    server_name: Option<String>,

    /// Host served from a second context; selecting it rebinds the session.
    #[arg(long)]
    alt_host: Option<String>,

    /// Subject of the client certificate. Enables peer verification.
    #[arg(long)]
    peer: Option<String>,

    /// Present the client certificate as expired.
    #[arg(long, requires = "peer")]
    expired_peer: bool,

    /// Accept every certificate regardless of the engine's verdict.
    #[arg(long, requires = "peer")]
    override_verify: bool,

    /// Negotiate TLS 1.2 instead of TLS 1.3.
    #[arg(long)]
    tls12: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event {
    Message {
        direction: &'static str,
        version: String,
        content_type: String,
        length: usize,
    },
    Verify {
        depth: i32,
        subject: String,
        preverified: bool,
        error: String,
        accepted: bool,
    },
    Servername {
        name: String,
        rebound: bool,
    },
}

#[derive(Debug, Serialize)]
struct Report {
    established: bool,
    detail: String,
    servername: String,
    version: String,
    events: Vec<Event>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    vssl_bridge::init(&config);

    let report = run(&cli)?;
    match cli.output {
        Output::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialise report")?
        ),
        Output::Text => print_text(&report),
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<BridgeConfig> {
    let mut config = match &cli.config {
        Some(path) => BridgeConfig::from_path(path)
            .with_context(|| format!("load bridge config from {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    match cli.verbose {
        0 => {}
        1 => config.log.filter = "debug".to_string(),
        _ => config.log.filter = "trace".to_string(),
    }
    if let Some(format) = cli.log_format {
        config.log.format = format.into();
    }
    Ok(config)
}

fn run(cli: &Cli) -> Result<Report> {
    let engine = loopback::install().context("install loopback engine")?;
    let default = Context::new().context("create default context")?;
    let events = Arc::new(Mutex::new(Vec::new()));

    if let Some(alt_host) = cli.alt_host.clone() {
        let alternate = Arc::new(Context::new().context("create alternate context")?);
        let events = Arc::clone(&events);
        default.set_servername_callback(move |conn| {
            let name = conn.servername();
            let rebound = name.eq_ignore_ascii_case(&alt_host);
            if rebound {
                conn.rebind_context(&alternate);
            }
            record(&events, Event::Servername { name, rebound });
            ServernameStatus::Ok
        });
    }

    let conn = Connection::new(&default).context("create session")?;
    {
        let events = Arc::clone(&events);
        conn.set_msg_callback(move |_, message| {
            record(
                &events,
                Event::Message {
                    direction: if message.direction.is_sending() {
                        "sent"
                    } else {
                        "received"
                    },
                    version: message.version.to_string(),
                    content_type: message.content_type.to_string(),
                    length: message.content.len(),
                },
            );
        });
    }

    let mut script = HandshakeScript::new();
    if cli.tls12 {
        script = script.version(ProtocolVersion::TLS1_2);
    }
    if let Some(name) = &cli.server_name {
        script = script.server_name(name.clone());
    }
    if let Some(subject) = &cli.peer {
        let mut peer = PeerCertificate::new(subject.clone());
        if cli.expired_peer {
            peer = peer.expired();
        }
        script = script.peer(peer);

        let events = Arc::clone(&events);
        let override_verify = cli.override_verify;
        conn.set_verify_callback(VerifyMode::PEER, move |ok, store| {
            let accepted = ok || override_verify;
            record(
                &events,
                Event::Verify {
                    depth: store.error_depth(),
                    subject: store
                        .current_cert()
                        .map(|cert| cert.subject())
                        .unwrap_or_default(),
                    preverified: ok,
                    error: store.error().to_string(),
                    accepted,
                },
            );
            accepted
        });
    }

    info!(server_name = ?cli.server_name, peer = ?cli.peer, "running loopback handshake");
    let outcome = engine.accept(&conn, &script);
    let (established, detail) = match outcome {
        HandshakeOutcome::Established { context_id, .. } => {
            (true, format!("established on context {context_id}"))
        }
        HandshakeOutcome::Rejected(failure) => (false, failure.to_string()),
    };

    let events = events
        .lock()
        .map(|events| events.clone())
        .unwrap_or_default();
    Ok(Report {
        established,
        detail,
        servername: conn.servername(),
        version: conn.version(),
        events,
    })
}

fn record(events: &Mutex<Vec<Event>>, event: Event) {
    if let Ok(mut events) = events.lock() {
        events.push(event);
    }
}

fn print_text(report: &Report) {
    for event in &report.events {
        match event {
            Event::Message {
                direction,
                version,
                content_type,
                length,
            } => println!("{direction:>8} {version:<8} {content_type:<18} {length:>5} bytes"),
            Event::Verify {
                depth,
                subject,
                preverified,
                error,
                accepted,
            } => println!(
                "  verify depth={depth} subject={subject:?} preverified={preverified} error={error:?} accepted={accepted}"
            ),
            Event::Servername { name, rebound } => {
                println!("  servername {name:?} rebound={rebound}")
            }
        }
    }
    let status = if report.established { "OK" } else { "FAILED" };
    println!("{status}: {}", report.detail);
    if !report.servername.is_empty() {
        println!("server name: {}", report.servername);
    }
    if !report.version.is_empty() {
        println!("version: {}", report.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_and_format_override_config() {
        let cli = Cli::parse_from(["vssl-trace", "-vv", "--log-format", "json"]);
        let config = load_config(&cli).expect("config");
        assert_eq!(config.log.filter, "trace");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn expired_peer_requires_a_peer() {
        assert!(Cli::try_parse_from(["vssl-trace", "--expired-peer"]).is_err());
    }

    #[test]
    fn override_verify_requires_a_peer() {
        let err = Cli::try_parse_from(["vssl-trace", "--override-verify"])
            .expect_err("override without a peer");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
        assert!(Cli::try_parse_from(["vssl-trace", "--peer", "CN=client", "--override-verify"]).is_ok());
    }

    #[test]
    fn override_accepts_expired_peer() {
        let cli = Cli::parse_from([
            "vssl-trace",
            "--peer",
            "CN=client",
            "--expired-peer",
            "--override-verify",
        ]);
        let report = run(&cli).expect("run");
        assert!(report.established, "{}", report.detail);
        assert!(report.events.iter().any(|event| matches!(
            event,
            Event::Verify {
                preverified: false,
                accepted: true,
                ..
            }
        )));
    }

    #[test]
    fn alternate_host_is_selected_by_name() {
        let cli = Cli::parse_from([
            "vssl-trace",
            "--server-name",
            "alt.example",
            "--alt-host",
            "alt.example",
        ]);
        let report = run(&cli).expect("run");
        assert!(report.established);
        assert_eq!(report.servername, "alt.example");
        assert!(report.events.iter().any(|event| matches!(
            event,
            Event::Servername { rebound: true, .. }
        )));
    }
}
