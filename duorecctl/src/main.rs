use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use duorec_ipc::{
    read_message, write_message, Command, IpcError, RecordingStatus, RenameMetadata,
    RenameOutcome, Response, SessionPatch, SessionRecord, StopReason, TimerStartPayload,
    TimerState, SOCKET_PATH,
};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::BufReader;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "duorecctl")]
#[command(about = "Control the duorec recording daemon", long_about = None)]
struct Cli {
    /// Control socket of the daemon
    #[arg(long, global = true, default_value = SOCKET_PATH)]
    socket: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Session timer
    #[command(subcommand)]
    Timer(TimerCommand),
    /// Recording directory watcher
    #[command(subcommand)]
    Watch(WatchCommand),
    /// Rename a recording to the canonical scheme
    Rename(RenameArgs),
    /// Worker subprocess
    #[command(subcommand)]
    Worker(WorkerCommand),
    /// Persisted session record
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Stream daemon events until interrupted
    Events,
}

#[derive(Subcommand)]
enum TimerCommand {
    /// Start a new run
    Start {
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long)]
        intro: Option<f64>,
        #[arg(long)]
        outro: Option<f64>,
        #[arg(long)]
        interval: Option<f64>,
        #[arg(long)]
        break_length: Option<f64>,
    },
    /// Stop the current run
    Stop {
        #[arg(long, value_enum, default_value_t = ReasonArg::Manual)]
        reason: ReasonArg,
    },
    /// Stop and zero the timer
    Reset,
    /// Show the timer state
    Status,
    /// Switch between counting up and down (only while idle)
    Mode { mode: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReasonArg {
    Manual,
    Completed,
    Aborted,
}

impl From<ReasonArg> for StopReason {
    fn from(reason: ReasonArg) -> Self {
        match reason {
            ReasonArg::Manual => StopReason::Manual,
            ReasonArg::Completed => StopReason::Completed,
            ReasonArg::Aborted => StopReason::Aborted,
        }
    }
}

#[derive(Subcommand)]
enum WatchCommand {
    /// Watch a directory (defaults to the persisted recording directory)
    Start { directory: Option<PathBuf> },
    /// Stop watching
    Stop,
    /// Show the last recording status
    Status,
}

#[derive(Args)]
struct RenameArgs {
    file: PathBuf,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    pair: Option<String>,
    #[arg(long)]
    segment: Option<u64>,
    #[arg(long)]
    theme_id: Option<String>,
    #[arg(long)]
    theme_title: Option<String>,
    /// A or B
    #[arg(long)]
    channel: Option<String>,
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Send one action to the worker and print its result
    Invoke {
        action: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the session record
    Show,
    /// Update fields of the session record
    Set {
        #[arg(long)]
        recording_dir: Option<PathBuf>,
        #[arg(long)]
        project_dir: Option<PathBuf>,
        #[arg(long)]
        project_code: Option<String>,
        #[arg(long)]
        pair_id: Option<String>,
        #[arg(long)]
        segment: Option<u64>,
        #[arg(long)]
        theme_source: Option<PathBuf>,
        #[arg(long)]
        theme_id: Option<String>,
        #[arg(long)]
        theme_title: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Timer(TimerCommand::Start {
            duration,
            intro,
            outro,
            interval,
            break_length,
        }) => Command::TimerStart {
            payload: Some(TimerStartPayload {
                duration_sec: duration,
                intro_sec: intro,
                outro_sec: outro,
                interval_sec: interval,
                break_length_sec: break_length,
            }),
        },
        Commands::Timer(TimerCommand::Stop { reason }) => Command::TimerStop {
            reason: Some(reason.into()),
        },
        Commands::Timer(TimerCommand::Reset) => Command::TimerReset,
        Commands::Timer(TimerCommand::Status) => Command::TimerStatus,
        Commands::Timer(TimerCommand::Mode { mode }) => Command::TimerSetMode { mode },
        Commands::Watch(WatchCommand::Start { directory }) => Command::WatchStart { directory },
        Commands::Watch(WatchCommand::Stop) => Command::WatchStop,
        Commands::Watch(WatchCommand::Status) => Command::WatchStatus,
        Commands::Rename(args) => Command::Rename {
            file: args.file,
            metadata: RenameMetadata {
                project_code: args.project,
                pair_id: args.pair,
                segment_counter: args.segment,
                theme_id: args.theme_id,
                theme_title: args.theme_title,
                channel: args.channel,
            },
        },
        Commands::Worker(WorkerCommand::Invoke {
            action,
            payload,
            timeout_ms,
        }) => Command::WorkerInvoke {
            action,
            payload: serde_json::from_str(&payload).context("--payload is not valid JSON")?,
            timeout_ms,
        },
        Commands::Config(ConfigCommand::Show) => Command::ConfigGet,
        Commands::Config(ConfigCommand::Set {
            recording_dir,
            project_dir,
            project_code,
            pair_id,
            segment,
            theme_source,
            theme_id,
            theme_title,
        }) => Command::ConfigUpdate {
            patch: SessionPatch {
                zoom_recording_dir: recording_dir,
                project_dir,
                project_code,
                pair_id,
                segment_counter: segment,
                theme_source_path: theme_source,
                current_theme_id: theme_id,
                current_theme_title: theme_title,
                ..SessionPatch::default()
            },
        },
        Commands::Events => Command::Subscribe,
    };

    let (mut reader, mut writer) = connect(&cli.socket).await?;
    write_message(&mut writer, &command).await?;

    if let Command::Subscribe = command {
        return stream_events(&mut reader).await;
    }

    let response: Response = read_message(&mut reader).await?;
    print_response(response)
}

async fn connect(socket: &Path) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = match UnixStream::connect(socket).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            return Err(IpcError::ConnectionRefused.into())
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to connect to {}", socket.display()))
        }
    };
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn stream_events(reader: &mut BufReader<OwnedReadHalf>) -> Result<()> {
    loop {
        let response: Response = match read_message(reader).await {
            Ok(response) => response,
            Err(IpcError::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match response {
            Response::Ok => {}
            Response::Event(envelope) => {
                println!("{} {}", envelope.channel, envelope.payload);
            }
            Response::Error(e) => bail!(e),
            other => println!("{}", serde_json::to_string(&other)?),
        }
    }
}

fn print_response(response: Response) -> Result<()> {
    match response {
        Response::Ok => println!("OK"),
        Response::Timer(state) => print_timer(&state),
        Response::Mode(change) => {
            if change.success {
                println!("Mode: {}", change.mode);
            } else {
                bail!("mode change refused (mode stays {})", change.mode);
            }
        }
        Response::Recording(status) => print_recording(status.as_ref()),
        Response::Rename(RenameOutcome::Renamed(result)) => {
            println!("{}", result.new_path.display());
        }
        Response::Rename(RenameOutcome::Failed { error }) => bail!(error),
        Response::Worker(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        Response::Config(record) => print_record(&record)?,
        Response::Event(envelope) => println!("{} {}", envelope.channel, envelope.payload),
        Response::Error(e) => bail!(e),
    }
    Ok(())
}

fn print_timer(state: &TimerState) {
    println!("Phase: {:?}", state.phase);
    println!("Mode: {}", state.mode);
    println!("Elapsed: {}s", state.elapsed_sec);
    println!("Remaining: {}s", state.remaining_sec);
    if state.intro_remaining > 0 {
        println!("Intro: {}s", state.intro_remaining);
    }
}

fn print_recording(status: Option<&RecordingStatus>) {
    let Some(status) = status else {
        println!("State: not watching");
        return;
    };
    println!("State: {:?}", status.state);
    if let Some(path) = &status.path {
        println!("Directory: {}", path.display());
    }
    if let Some(file) = &status.file {
        println!("File: {}", file.display());
    }
    if let Some(bytes) = status.bytes {
        println!("Bytes: {}", bytes);
    }
    if let Some(error) = &status.error {
        println!("Error: {}", error);
    }
}

fn print_record(record: &SessionRecord) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}
