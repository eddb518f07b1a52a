//! Worker process hosting database connections for one client over
//! length-prefixed frames on stdin/stdout. Logs go to stderr.

use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use localsync_db::config::LocalSyncConfig;
use localsync_db::logging::{self, LogFormat};
use localsync_db::rpc::{self, WireCodec};
use localsync_db::worker::{ClientSession, ConnectionRegistry, FrameSink};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_PENDING_REPLIES: usize = 64;

#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    codec: Option<WireCodec>,
    config: Option<PathBuf>,
    log_format: Option<LogFormat>,
    ignored: Vec<String>,
}

fn parse_args<I>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--codec" => {
                let value = args.next().context("--codec needs a value")?;
                parsed.codec = Some(value.parse()?);
            }
            "--config" => {
                let value = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--log-format" => {
                let value = args.next().context("--log-format needs a value")?;
                parsed.log_format = Some(value.parse()?);
            }
            "--stdio" => {}
            _ => parsed.ignored.push(arg),
        }
    }
    Ok(parsed)
}

/// Hands reply frames to the stdout writer thread.
struct StdoutSink(Sender<Vec<u8>>);

impl FrameSink for StdoutSink {
    fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.0.send(frame).is_ok()
    }
}

fn read_loop(requests: mpsc::UnboundedSender<Vec<u8>>) {
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    loop {
        match rpc::read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if requests.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("stdin closed");
                break;
            }
            Err(err) => {
                error!(error = %err, "invalid request frame");
                break;
            }
        }
    }
}

fn write_loop(replies: Receiver<Vec<u8>>) {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    while let Ok(frame) = replies.recv() {
        if let Err(err) = rpc::write_frame(&mut writer, &frame) {
            error!(error = %err, "failed to write reply");
            break;
        }
    }
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let mut config = LocalSyncConfig::resolve(args.config.as_deref())?;
    if let Some(codec) = args.codec {
        config.worker.codec = codec;
    }
    if let Some(format) = args.log_format {
        config.log.format = format;
    }
    let _log = logging::init(&config.log)?;
    for arg in &args.ignored {
        warn!(arg = %arg, "ignoring unknown argument");
    }
    info!(codec = config.worker.codec.as_str(), pid = std::process::id(), "worker started");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let (request_tx, request_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (reply_tx, reply_rx) = bounded::<Vec<u8>>(MAX_PENDING_REPLIES);
    let writer = thread::spawn(move || write_loop(reply_rx));
    // Not joined: it stays blocked on stdin when the client stops reading
    // replies but keeps its end open.
    thread::spawn(move || read_loop(request_tx));

    let registry = ConnectionRegistry::new();
    let session = ClientSession::new(registry.clone(), Arc::new(StdoutSink(reply_tx)));
    runtime.block_on(session.serve(request_rx));
    info!(open = registry.open_count(), "client hung up; worker exiting");
    drop(runtime);
    if writer.join().is_err() {
        error!("reply writer panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Args, parse_args};
    use localsync_db::logging::LogFormat;
    use localsync_db::rpc::WireCodec;
    use std::path::PathBuf;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_known_flags() {
        let parsed = parse_args(args(&[
            "--stdio",
            "--codec",
            "json",
            "--config",
            "/etc/localsync.json",
            "--log-format",
            "json",
            "--verbose",
        ]))
        .expect("args");
        assert_eq!(
            parsed,
            Args {
                codec: Some(WireCodec::Json),
                config: Some(PathBuf::from("/etc/localsync.json")),
                log_format: Some(LogFormat::Json),
                ignored: vec!["--verbose".to_string()],
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_args(args(&["--codec", "cbor"])).is_err());
        assert!(parse_args(args(&["--codec"])).is_err());
        assert_eq!(parse_args(args(&[])).expect("empty"), Args::default());
    }
}
