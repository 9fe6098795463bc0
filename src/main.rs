use clap::{Parser, Subcommand, ValueEnum};
use forensic_engine::configuration::config::Config;
use forensic_engine::controller::Controller;
use forensic_engine::error_handling::types::ForensicError;
use forensic_engine::stream_reconstruction::{DirectionFilter, MatchMode, SearchOptions};
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "forensic-engine")]
#[command(version)]
#[command(about = "Offline and live packet-capture forensics on top of tshark")]
struct Args {
    /// TOML configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Explicit tshark binary (overrides the config file and TSHARK_PATH).
    #[arg(long, global = true)]
    tshark: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Correlate a capture file into sessions and a timeline (JSON).
    Analyze {
        pcap: PathBuf,
        /// Write the artifact here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        max_packets: Option<u64>,
        #[arg(long)]
        sample_frames_per_session: Option<usize>,
        /// Do not compute the capture's sha256.
        #[arg(long)]
        skip_hash: bool,
    },
    /// List the TCP streams of a capture file.
    Streams {
        pcap: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        max_packets: Option<u64>,
    },
    /// Reconstruct one TCP stream as printable text.
    Follow {
        pcap: PathBuf,
        stream_id: u64,
        #[arg(long, value_enum, default_value_t = DirectionArg::Both)]
        direction: DirectionArg,
        /// Only report segments around packets containing this term.
        #[arg(long)]
        search: Option<String>,
        /// Treat the search term as a regular expression.
        #[arg(long, requires = "search")]
        regex: bool,
        #[arg(long, requires = "search")]
        case_sensitive: bool,
        /// Packets kept on each side of a match.
        #[arg(long, requires = "search")]
        context_packets: Option<usize>,
        #[arg(long, requires = "search")]
        max_matches: Option<usize>,
        #[arg(long)]
        frame_min: Option<u64>,
        #[arg(long)]
        frame_max: Option<u64>,
        /// Earliest packet time, in epoch seconds.
        #[arg(long)]
        ts_min: Option<f64>,
        #[arg(long)]
        ts_max: Option<f64>,
    },
    /// List capture interfaces.
    Interfaces,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Both,
    ClientToServer,
    ServerToClient,
}

impl From<DirectionArg> for DirectionFilter {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Both => DirectionFilter::Both,
            DirectionArg::ClientToServer => DirectionFilter::ClientToServer,
            DirectionArg::ServerToClient => DirectionFilter::ServerToClient,
        }
    }
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string())?,
        None => Config::default(),
    };
    if let Some(tshark) = &args.tshark {
        config.dissector.tshark_path = Some(tshark.clone());
    }
    Ok(config)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ForensicError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| ForensicError::MalformedInput(format!("unable to serialize output: {}", e)))
}

async fn execute(controller: &Controller, command: Command) -> Result<(), ForensicError> {
    match command {
        Command::Analyze {
            pcap,
            output,
            max_packets,
            sample_frames_per_session,
            skip_hash,
        } => {
            let mut options = controller.extraction_options();
            if max_packets.is_some() {
                options.max_packets = max_packets;
            }
            if let Some(frames) = sample_frames_per_session {
                options.sample_frames_per_session = frames;
            }
            if skip_hash {
                options.include_sha256 = false;
            }
            let artifact = controller.analyze_file(&pcap, options).await?;
            let json = to_json(&artifact)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, format!("{}\n", json)).await?;
                    info!("Artifact written to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Command::Streams {
            pcap,
            limit,
            max_packets,
        } => {
            let streams = controller.list_streams_in(&pcap, limit, max_packets).await?;
            println!("{}", to_json(&streams)?);
        }
        Command::Follow {
            pcap,
            stream_id,
            direction,
            search,
            regex,
            case_sensitive,
            context_packets,
            max_matches,
            frame_min,
            frame_max,
            ts_min,
            ts_max,
        } => {
            let mut request = controller.follow_request(stream_id);
            request.direction = direction.into();
            request.range.frame_min = frame_min;
            request.range.frame_max = frame_max;
            request.range.ts_min = ts_min;
            request.range.ts_max = ts_max;
            request.search = search.map(|term| {
                let mut options = SearchOptions::contains(term, &controller.config().follow);
                options.case_sensitive = case_sensitive;
                if let Some(context) = context_packets {
                    options.context_packets = context;
                }
                if let Some(max) = max_matches {
                    options.max_matches = max;
                }
                if regex {
                    options.mode = MatchMode::Regex;
                }
                options
            });
            let result = controller.follow_stream_in(&pcap, request).await?;
            println!("{}", to_json(&result)?);
        }
        Command::Interfaces => {
            let interfaces = controller.interfaces().await?;
            println!("{}", to_json(&interfaces)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration: {}", e);
            std::process::exit(2);
        }
    };

    let controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = execute(&controller, args.command).await {
        error!("{}", e);
        let code = match e {
            ForensicError::Configuration(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
