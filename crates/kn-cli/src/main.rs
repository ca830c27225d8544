mod backend;

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use backend::Backend;
use clap::{Parser, Subcommand};
use kn_tasks::{
    decode_event, select_transport, AsyncFinished, CallBridge, ClientConfig, MessageChannel,
    Signal, Task, TaskPhase, TaskTracker,
};
use serde_json::{json, Value};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kn-cli", version, about = "Knossos task tracker CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a simulated mirror speed test and follow its progress
    Speedtest {
        #[arg(long, default_value_t = 5)]
        mirrors: u32,
        /// Make the given mirror fail
        #[arg(long)]
        fail_at: Option<u32>,
        /// Write every raw event received to this file (length-delimited)
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Run a simulated archive scan and follow its progress
    Scan {
        #[arg(long, default_value_t = 8)]
        files: u32,
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Decode captured event payloads and print them as JSON
    Decode {
        path: PathBuf,
        /// The file holds length-delimited events instead of a single one
        #[arg(long)]
        delimited: bool,
    },
    /// Print the effective client configuration
    Config {
        /// Persist the effective configuration to the state file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    kn_util::init_tracing()?;
    let cli = Cli::parse();
    let config = ClientConfig::load();

    match cli.cmd {
        Cmd::Speedtest {
            mirrors,
            fail_at,
            record,
        } => {
            let args = vec![json!(mirrors), json!(fail_at)];
            run_task(&config, "Speedtest", "speedTest", args, record).await?;
        }
        Cmd::Scan { files, record } => {
            run_task(&config, "Scan archives", "scanArchives", vec![json!(files)], record).await?;
        }
        Cmd::Decode { path, delimited } => {
            let data = fs::read(&path)?;
            let payloads = if delimited {
                split_delimited(&data)?
            } else {
                vec![data.as_slice()]
            };
            for payload in payloads {
                let event = decode_event(payload)?;
                println!("{}", serde_json::to_string_pretty(&event)?);
            }
        }
        Cmd::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                config.save()?;
            }
        }
    }

    Ok(())
}

/// Starts a tracked task, invokes `method` with the task ref prepended and
/// follows the tracker until the backend answers.
async fn run_task(
    config: &ClientConfig,
    label: &str,
    method: &str,
    extra_args: Vec<Value>,
    record: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let messages = MessageChannel::new();
    let finished: Signal<AsyncFinished> = Signal::new();
    let backend = Backend::new(messages.clone(), finished.clone());

    let transport = select_transport(config.bridge, None, backend.methods())?;
    let bridge = Arc::new(CallBridge::new(transport));
    info!("{label}: calling {method} over the {} bridge", bridge.transport_name());
    let _dispatcher = bridge.attach(&finished);

    let tracker = TaskTracker::new(config);
    let _listener = tracker.listen(&messages);

    let recorded = Arc::new(Mutex::new(Vec::<u8>::new()));
    let _recorder = record.as_ref().map(|_| {
        let sink = Arc::clone(&recorded);
        messages.connect_scoped(move |bytes: &[u8]| {
            let mut out = sink.lock().unwrap_or_else(|e| e.into_inner());
            if prost::encode_length_delimiter(bytes.len(), &mut *out).is_ok() {
                out.extend_from_slice(bytes);
            }
        })
    });

    let id = tracker.start_task(label);
    let mut changes = tracker.subscribe();
    let mut args = vec![json!(id.0)];
    args.extend(extra_args);

    let call = bridge.call_async_promise(method, args);
    tokio::pin!(call);
    let mut last_line = String::new();
    let result = loop {
        tokio::select! {
            result = &mut call => break result?,
            Ok(()) = changes.changed() => {
                if let Some(task) = tracker.get(id) {
                    let line = status_line(&task);
                    if line != last_line {
                        println!("{line}");
                        last_line = line;
                    }
                }
            }
        }
    };

    if let Some(task) = tracker.get(id) {
        print_summary(&task, tracker.active());
    }
    println!("result: {result}");

    if let Some(path) = record {
        let data = recorded.lock().unwrap_or_else(|e| e.into_inner()).clone();
        fs::write(&path, data)?;
        println!("recorded events to {}", path.display());
    }

    // The user has seen the outcome; acknowledge it.
    tracker.remove_task(id);
    Ok(())
}

fn status_line(task: &Task) -> String {
    if task.indeterminate {
        format!("[{}] {}: {} ...", task.id, task.label, task.status)
    } else {
        format!(
            "[{}] {}: {:>5.1}% {}",
            task.id,
            task.label,
            task.progress * 100.0,
            task.status
        )
    }
}

fn print_summary(task: &Task, active: usize) {
    let phase = match task.phase() {
        TaskPhase::Created => "created",
        TaskPhase::Running => "running",
        TaskPhase::Completed => "completed",
        TaskPhase::Failed => "FAILED",
    };
    println!("{} {phase} ({active} background tasks)", task.label);
    for entry in &task.log_messages {
        println!("  {:?} {}: {}", entry.level, entry.sender, entry.message);
    }
    if task.phase() == TaskPhase::Failed {
        warn!("task {} failed: {}", task.id, task.status);
    }
    if let Some(outcome) = &task.outcome {
        match (&outcome.error, outcome.success) {
            (Some(error), _) => println!("backend result: failed ({error})"),
            (None, true) => println!("backend result: ok"),
            (None, false) => println!("backend result: failed"),
        }
    }
}

fn split_delimited(mut data: &[u8]) -> Result<Vec<&[u8]>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        let len = prost::decode_length_delimiter(&mut data)?;
        if len > data.len() {
            return Err(format!("truncated event: need {len} bytes, have {}", data.len()).into());
        }
        let (payload, rest) = data.split_at(len);
        out.push(payload);
        data = rest;
    }
    Ok(out)
}
