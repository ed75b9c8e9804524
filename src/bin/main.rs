//! SentryStr CLI - Send telemetry events to Nostr relays
//!
//! Publishes events and direct messages, reads events back from relays, shows
//! the signing pubkey, and opens encrypted units addressed to you.

use clap::{Parser, Subcommand};
use colored::Colorize;
use nostr::nips::nip19::ToBech32;
use nostr::{Event as NostrEvent, JsonUtil, Keys};
use sentrystr::config::parse_signing_key;
use sentrystr::{
    from_canonical_json, open_envelope, CaptureReport, Client, CollectedEvent, Collector,
    Config, DirectMessagePolicy, DirectMessageProtocol, Event, EventFilter, Level,
    MemoryTransport, PublishReport, RelayStatus, DEFAULT_RELAYS,
};
use std::io::Read;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sentrystr")]
#[command(about = "Serverless error reporting over Nostr relays")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Connection {
    /// Your private key (hex or nsec)
    #[arg(short, long, env = "SENTRYSTR_PRIVKEY")]
    privkey: String,

    /// Relay URLs to publish to
    #[arg(
        short,
        long,
        env = "SENTRYSTR_RELAYS",
        value_delimiter = ',',
        default_values_t = DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
    )]
    relays: Vec<String>,

    /// Per-relay timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Build and sign units without contacting relays
    #[arg(long)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture an event
    Send {
        #[command(flatten)]
        connection: Connection,

        /// Event message
        message: String,

        /// Level: debug, info, warning, error, fatal
        #[arg(short, long, default_value = "info")]
        level: Level,

        /// Tag as key=value (repeatable)
        #[arg(short, long = "tag", value_parser = parse_key_value)]
        tags: Vec<(String, String)>,

        /// Extra as key=value; JSON values are kept typed (repeatable)
        #[arg(short, long = "extra", value_parser = parse_key_value)]
        extras: Vec<(String, String)>,

        /// Encrypt the event for this pubkey (hex or npub)
        #[arg(long, env = "SENTRYSTR_ENCRYPT_TO")]
        encrypt_to: Option<String>,

        /// Also DM events at or above --dm-min-level to this pubkey
        #[arg(long, env = "SENTRYSTR_DM_TO")]
        dm_to: Option<String>,

        /// Minimum level for the DM copy
        #[arg(long, default_value = "warning")]
        dm_min_level: Level,

        /// DM envelope: nip17 or nip04
        #[arg(long, default_value = "nip17")]
        dm_protocol: DmProtocol,
    },

    /// Send a raw direct message
    Dm {
        #[command(flatten)]
        connection: Connection,

        /// Recipient pubkey (hex or npub)
        #[arg(long, env = "SENTRYSTR_DM_TO")]
        to: String,

        /// DM envelope: nip17 or nip04
        #[arg(long, default_value = "nip17")]
        protocol: DmProtocol,

        /// Message text
        text: String,
    },

    /// Read captured events back from relays
    Collect {
        /// Relay URLs to read from
        #[arg(
            short,
            long,
            env = "SENTRYSTR_RELAYS",
            value_delimiter = ',',
            default_values_t = DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        )]
        relays: Vec<String>,

        /// Private key (hex or nsec) for opening encrypted units and DMs
        #[arg(short, long, env = "SENTRYSTR_PRIVKEY")]
        privkey: Option<String>,

        /// Only events signed by this pubkey (hex or npub, repeatable)
        #[arg(short, long = "author")]
        authors: Vec<String>,

        /// Lowest level to show
        #[arg(short, long)]
        min_level: Option<Level>,

        /// Required tag as key=value (repeatable)
        #[arg(short, long = "tag", value_parser = parse_key_value)]
        tags: Vec<(String, String)>,

        /// Only events from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,

        /// Maximum number of events
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Read direct messages addressed to --privkey instead
        #[arg(long)]
        direct_messages: bool,

        /// Per-relay timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// Show the pubkey for a private key
    Pubkey {
        /// Your private key (hex or nsec)
        #[arg(short, long, env = "SENTRYSTR_PRIVKEY")]
        privkey: String,
    },

    /// Decrypt an encrypted unit addressed to you
    Open {
        /// Your private key (hex or nsec)
        #[arg(short, long, env = "SENTRYSTR_PRIVKEY")]
        privkey: String,

        /// File containing the signed event JSON (or - for stdin)
        #[arg(short, long, default_value = "-")]
        input: String,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum DmProtocol {
    Nip17,
    Nip04,
}

impl From<DmProtocol> for DirectMessageProtocol {
    fn from(protocol: DmProtocol) -> Self {
        match protocol {
            DmProtocol::Nip17 => Self::Nip17,
            DmProtocol::Nip04 => Self::Nip04,
        }
    }
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {input:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentrystr=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            connection,
            message,
            level,
            tags,
            extras,
            encrypt_to,
            dm_to,
            dm_min_level,
            dm_protocol,
        } => {
            let mut event = Event::new().with_message(message).with_level(level);
            for (key, value) in tags {
                event = event.with_tag(key, value);
            }
            for (key, value) in extras {
                event = match serde_json::from_str::<serde_json::Value>(&value) {
                    Ok(json) => event.try_with_extra(key, json)?,
                    Err(_) => event.with_extra(key, value),
                };
            }

            let mut config = build_config(&connection)?;
            if let Some(recipient) = encrypt_to {
                config = config.with_encryption(&recipient)?;
            }
            if let Some(recipient) = dm_to {
                let recipient = sentrystr::crypto::parse_recipient(&recipient)?;
                config = config.with_direct_message_policy(
                    DirectMessagePolicy::new(recipient)
                        .with_min_level(dm_min_level)
                        .with_protocol(dm_protocol.into()),
                );
            }

            if connection.dry_run {
                let transport = MemoryTransport::new();
                let client = Client::with_transport(config, transport.clone());
                let report = client.capture_event(&event).await?;
                print_capture(&report);
                print_units(&transport).await;
            } else {
                let report = Client::new(config).capture_event(&event).await?;
                print_capture(&report);
            }
        }
        Commands::Dm {
            connection,
            to,
            protocol,
            text,
        } => {
            let recipient = sentrystr::crypto::parse_recipient(&to)?;
            let config = build_config(&connection)?.with_direct_message_policy(
                DirectMessagePolicy::new(recipient).with_protocol(protocol.into()),
            );

            if connection.dry_run {
                let transport = MemoryTransport::new();
                let client = Client::with_transport(config, transport.clone());
                print_report("Direct message", &client.send_direct_message(&text).await?);
                print_units(&transport).await;
            } else {
                let report = Client::new(config).send_direct_message(&text).await?;
                print_report("Direct message", &report);
            }
        }
        Commands::Collect {
            relays,
            privkey,
            authors,
            min_level,
            tags,
            since_hours,
            limit,
            direct_messages,
            timeout,
        } => {
            let mut filter = EventFilter::new().with_limit(limit);
            for author in authors {
                filter = filter.with_author(sentrystr::crypto::parse_recipient(&author)?);
            }
            if let Some(level) = min_level {
                filter = filter.with_min_level(level);
            }
            for (key, value) in tags {
                filter = filter.with_tag(key, value);
            }
            if let Some(hours) = since_hours {
                filter = filter.with_since(chrono::Utc::now() - chrono::Duration::hours(hours));
            }

            let mut collector =
                Collector::new(relays)?.with_fetch_timeout(Duration::from_secs(timeout));
            if let Some(privkey) = privkey {
                collector = collector.with_keys(Keys::new(parse_signing_key(&privkey)?));
            }

            let collected = if direct_messages {
                collector.collect_direct_messages(&filter).await?
            } else {
                collector.collect_events(&filter).await?
            };
            print_collected(&collected);
        }
        Commands::Pubkey { privkey } => {
            show_pubkey(&privkey)?;
        }
        Commands::Open { privkey, input } => {
            open_unit(&privkey, &input)?;
        }
    }

    Ok(())
}

fn build_config(connection: &Connection) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(Config::new(&connection.privkey, connection.relays.clone())?
        .with_relay_timeout(Duration::from_secs(connection.timeout)))
}

fn show_pubkey(privkey: &str) -> Result<(), Box<dyn std::error::Error>> {
    let keys = Keys::new(parse_signing_key(privkey)?);
    let pubkey = keys.public_key();

    println!("Sender pubkey:");
    println!("  npub: {}", pubkey.to_bech32()?);
    println!("  hex:  {}", pubkey.to_hex());
    println!();
    println!("Share this pubkey with whoever reads your events.");

    Ok(())
}

fn open_unit(privkey: &str, input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let keys = Keys::new(parse_signing_key(privkey)?);

    let json = if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input)?
    };
    let unit = NostrEvent::from_json(json.trim())?;
    let opened = open_envelope(&keys, &unit)?;

    println!("{}", "━".repeat(60).dimmed());
    println!("{}: {}", "From".cyan(), opened.author);
    println!("{}: {} (kind {})", "Unit".cyan(), unit.id, unit.kind.as_u16());
    println!("{}", "━".repeat(60).dimmed());

    match from_canonical_json(&opened.plaintext) {
        Ok(event) => print_event(&event),
        Err(_) => println!("{}", opened.plaintext),
    }

    Ok(())
}

fn print_event(event: &Event) {
    let level = match event.level {
        Level::Debug | Level::Info => event.level.as_str().blue(),
        Level::Warning => event.level.as_str().yellow(),
        Level::Error | Level::Fatal => event.level.as_str().red().bold(),
    };
    println!(
        "{} {}",
        level,
        event.message.as_deref().unwrap_or_default().bold()
    );
    println!("{}: {}", "Time".cyan(), event.timestamp);
    for (key, value) in event.tags.iter() {
        println!("  {} {}={}", "tag".dimmed(), key, value);
    }
    for (key, value) in event.extras.iter() {
        let value = serde_json::to_string(value).unwrap_or_default();
        println!("  {} {}={}", "extra".dimmed(), key, value);
    }
    if let Some(exception) = &event.exception {
        println!();
        println!(
            "{}: {}: {}",
            "Exception".yellow().bold(),
            exception.exception_type,
            exception.message
        );
        if let Some(stacktrace) = &exception.stacktrace {
            for (i, frame) in stacktrace.frames().iter().enumerate() {
                let function = frame.function.as_deref().unwrap_or("?");
                let location = match frame.lineno {
                    Some(line) => format!("{}:{}", frame.filename, line),
                    None => frame.filename.clone(),
                };
                println!("  {} {} {}", format!("#{i}").cyan(), function, location.dimmed());
            }
        }
    }
}

fn print_capture(report: &CaptureReport) {
    print_report("Event", &report.primary);
    match &report.direct_message {
        Some(Ok(dm)) => print_report("Direct message", dm),
        Some(Err(e)) => println!("{} Direct message {}", "✗".red(), e.to_string().red()),
        None => {}
    }
}

fn print_collected(collected: &[CollectedEvent]) {
    if collected.is_empty() {
        println!("{}", "No matching events.".dimmed());
        return;
    }
    for item in collected {
        println!("{}", "━".repeat(60).dimmed());
        println!("{}: {}", "From".cyan(), item.author.to_hex());
        println!("{}: {}", "Unit".cyan(), item.unit_id.to_hex().dimmed());
        print_event(&item.event);
    }
    println!("{}", "━".repeat(60).dimmed());
    println!("{} event(s)", collected.len());
}

fn print_report(label: &str, report: &PublishReport) {
    println!(
        "{} {} {} ({}/{} relays)",
        "✓".green(),
        label,
        report.event_id.to_hex().dimmed(),
        report.accepted(),
        report.outcomes.len()
    );
    for outcome in &report.outcomes {
        let status = match &outcome.status {
            RelayStatus::Accepted => outcome.status.to_string().green(),
            RelayStatus::TimedOut => outcome.status.to_string().yellow(),
            _ => outcome.status.to_string().red(),
        };
        println!("    {} {}", outcome.relay, status);
    }
}

async fn print_units(transport: &MemoryTransport) {
    println!();
    println!("{}", "Dry run, units not sent:".yellow());
    for unit in transport.units().await {
        println!("{}", unit.as_json());
    }
}
