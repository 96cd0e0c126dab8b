//! GroupCA command line
//!
//! Runs a single CA operation against the configured storage and exits.

use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use groupca::config::{LogFormat, LogOutput, LoggingConfig};
use groupca::errors::ErrorResponse;
use groupca::{GroupCA, GroupCaConfig, GroupCaError, IssuedCertificate, RevocationOutcome};

fn cli() -> Command {
    Command::new("groupca")
        .version("0.1.0")
        .about("Group-based internal Certificate Authority")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (.toml, .yaml or .json)")
                .global(true),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Built-in configuration when no file is given: production, testing")
                .value_parser(["production", "testing"])
                .default_value("production")
                .global(true),
        )
        .subcommand(
            Command::new("request")
                .about("Authorize an identity and issue it a certificate for its group")
                .arg(Arg::new("identity").required(true)),
        )
        .subcommand(
            Command::new("create")
                .about("Issue a certificate without authorization or group")
                .arg(Arg::new("subject").required(true))
                .arg(
                    Arg::new("private-key")
                        .long("private-key")
                        .help("Include the private key in the output")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("revoke")
                .about("Revoke a certificate and issue its replacement")
                .arg(Arg::new("serial").required(true)),
        )
        .subcommand(
            Command::new("validate")
                .about("Check whether a serial is currently valid")
                .arg(Arg::new("serial").required(true)),
        )
        .subcommand(
            Command::new("current")
                .about("Show the current valid certificate of a subject")
                .arg(Arg::new("subject").required(true)),
        )
        .subcommand(
            Command::new("check")
                .about("Replace the subject's latest certificate if it has been revoked")
                .arg(Arg::new("subject").required(true)),
        )
        .subcommand(Command::new("list").about("List every issued certificate"))
}

fn load_config(matches: &ArgMatches) -> Result<GroupCaConfig> {
    match matches.get_one::<String>("config") {
        Some(path) => GroupCaConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => match matches.get_one::<String>("mode").map(String::as_str) {
            Some("testing") => Ok(GroupCaConfig::localhost_testing()),
            _ => Ok(GroupCaConfig::production()),
        },
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let writer = match &config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File { path } => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory for {}", path))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Compact => builder.compact().init(),
    }
    Ok(())
}

fn print_certificate(cert: &IssuedCertificate) {
    println!("Serial:      {}", cert.serial_number);
    println!("Subject:     {}", cert.distinguished_name());
    println!("Not before:  {}", chrono::DateTime::<chrono::Utc>::from(cert.not_before));
    println!("Not after:   {}", chrono::DateTime::<chrono::Utc>::from(cert.not_after));
    println!("Fingerprint: {}", cert.fingerprint_hex());
}

fn print_outcome(outcome: &RevocationOutcome) {
    match outcome {
        RevocationOutcome::Revoked { revoked, replacement } => {
            println!("Revoked {} ({})", revoked.serial_number, revoked.subject);
            println!("Replacement:");
            print_certificate(replacement);
        }
        RevocationOutcome::AlreadyRevoked { serial, replacement } => {
            println!("{} was already revoked", serial);
            if let Some(replacement) = replacement {
                println!("Replacement:");
                print_certificate(replacement);
            }
        }
        RevocationOutcome::UnknownSerial { serial } => {
            println!("No certificate with serial {} was issued; nothing revoked", serial);
        }
    }
}

/// Emit a structured report for failures raised by the CA itself
fn report_error(error: &anyhow::Error) {
    let Some(ca_error) = error.downcast_ref::<GroupCaError>() else {
        return;
    };
    if let Ok(json) = serde_json::to_string_pretty(&ErrorResponse::new(ca_error)) {
        eprintln!("{}", json);
    }
}

async fn run(ca: &GroupCA, matches: &ArgMatches) -> Result<bool> {
    let arg = |sub: &ArgMatches, name: &str| -> Result<String> {
        sub.get_one::<String>(name)
            .cloned()
            .with_context(|| format!("missing argument <{}>", name))
    };

    match matches.subcommand() {
        Some(("request", sub)) => {
            let identity = arg(sub, "identity")?;
            let granted = ca.request_certificate(&identity).await?;
            if granted {
                if let Some(cert) = ca.current_certificate(&identity).await? {
                    print_certificate(&cert);
                }
            } else {
                println!("{} is not a member of an allowed group", identity);
            }
            Ok(granted)
        }
        Some(("create", sub)) => {
            let subject = arg(sub, "subject")?;
            let include_private_key = sub.get_flag("private-key");
            let cert = ca.create_certificate(&subject, include_private_key).await?;
            print_certificate(&cert);
            if let Some(key) = &cert.private_key_pem {
                println!("{}", key);
            }
            Ok(true)
        }
        Some(("revoke", sub)) => {
            let outcome = ca.revoke_certificate(&arg(sub, "serial")?).await?;
            print_outcome(&outcome);
            Ok(!matches!(outcome, RevocationOutcome::UnknownSerial { .. }))
        }
        Some(("validate", sub)) => {
            let serial = arg(sub, "serial")?;
            let valid = ca.validate(&serial).await?;
            println!("{}: {}", serial, if valid { "valid" } else { "not valid" });
            Ok(valid)
        }
        Some(("current", sub)) => {
            let subject = arg(sub, "subject")?;
            match ca.current_certificate(&subject).await? {
                Some(cert) => {
                    print_certificate(&cert);
                    Ok(true)
                }
                None => {
                    println!("{} has no valid certificate", subject);
                    Ok(false)
                }
            }
        }
        Some(("check", sub)) => {
            let subject = arg(sub, "subject")?;
            match ca.check_subject(&subject).await? {
                Some(outcome) => print_outcome(&outcome),
                None => println!("Latest certificate of {} is not revoked", subject),
            }
            Ok(true)
        }
        Some(("list", _)) => {
            for (key, certificates) in ca.certificates().await? {
                println!("{}:", key);
                for cert in certificates {
                    let state = if ca.validate(&cert.serial_number).await? {
                        "valid"
                    } else {
                        "revoked or expired"
                    };
                    println!("  {}  {}  {}", cert.serial_number, cert.distinguished_name(), state);
                }
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config = load_config(&matches)?;
    init_logging(&config.logging)?;

    info!("GroupCA {} starting", config.ca.ca_id);
    let outcome = match GroupCA::new(config)
        .await
        .context("Failed to initialize GroupCA")
    {
        Ok(ca) => run(&ca, &matches).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Operation failed: {:#}", e);
            report_error(&e);
            Err(e)
        }
    }
}
