//! Trace Client - replays one process lifecycle into a running collector.
//!
//! This example demonstrates:
//! - Encoding client messages with `MessageEncoder`
//! - Reporting a start, a failed spawn and an exit over one connection
//!
//! # Running
//!
//! ```text
//! cargo run -- --pipe SpawnCamper            # terminal 1
//! cargo run --example trace_client SpawnCamper  # terminal 2
//! ```
//!
//! The collector prints one JSON line when this client disconnects.

use chrono::Utc;
use spawn_tracer::protocol::{ClientMessage, MessageEncoder};
use spawn_tracer::transport::pipe_path;
use tokio::io::AsyncWriteExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| spawn_tracer::DEFAULT_PIPE_NAME.to_string());
    let path = pipe_path(&name);

    let mut encoder = MessageEncoder::new();
    encoder
        .encode(&ClientMessage::Info {
            timestamp: Utc::now(),
            parent_pid: 0,
            exe_path: std::env::current_exe()?.to_string_lossy().into_owned(),
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            working_directory: std::env::current_dir()?.to_string_lossy().into_owned(),
            environment: std::env::vars().collect(),
        })?
        .encode(&ClientMessage::CreateFailure {
            timestamp: Utc::now(),
            code_page: 65001,
            exe_path: Some("does-not-exist.exe".to_string()),
            command_line: Some("does-not-exist.exe --help".to_string()),
        })?
        .encode(&ClientMessage::Exit {
            timestamp: Utc::now(),
            exit_code: 0,
        })?;
    let bytes = encoder.take();

    #[cfg(unix)]
    let mut stream = tokio::net::UnixStream::connect(&path).await?;

    #[cfg(windows)]
    let mut stream = tokio::net::windows::named_pipe::ClientOptions::new().open(&path)?;

    stream.write_all(&bytes).await?;
    stream.shutdown().await?;

    println!("Sent {} bytes to {}", bytes.len(), path);
    Ok(())
}
