//! Load and smoke client for `server_relay`.
//!
//! Opens several browser-like sessions against the relay, sends heartbeats,
//! signaling and (optionally) image frames, and prints a per-interval summary
//! of what came back.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

// 1x1 transparent PNG
const TINY_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Relay endpoint
    #[clap(short, long, default_value = "ws://localhost:8080/numberws")]
    url: String,

    /// Number of concurrent client sessions
    #[clap(short, long, default_value_t = 3)]
    clients: usize,

    /// Seconds between each client's send round
    #[clap(short, long, default_value_t = 2)]
    send_interval_seconds: u64,

    /// Seconds between summaries
    #[clap(short, long, default_value_t = 10)]
    report_interval_seconds: u64,

    /// Also send an image frame every round
    #[clap(long)]
    images: bool,
}

#[derive(Default)]
struct Stats {
    sent: BTreeMap<&'static str, usize>,
    received: BTreeMap<&'static str, usize>,
}

impl Stats {
    fn sent(&mut self, kind: &'static str) {
        *self.sent.entry(kind).or_default() += 1;
    }

    fn received(&mut self, text: &str) {
        let kind = if text == "pong" {
            "pong"
        } else if text.starts_with("错误：") {
            "error"
        } else if text.starts_with('{') {
            "signaling"
        } else {
            "upstream"
        };
        *self.received.entry(kind).or_default() += 1;
    }
}

fn summary(map: &BTreeMap<&'static str, usize>) -> String {
    if map.is_empty() {
        return "nothing".to_string();
    }
    map.iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

async fn run_client(index: usize, args: Arc<Args>, stats: Arc<Mutex<Stats>>) -> Result<()> {
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("client {} failed to connect to {}", index, args.url))?;
    let (mut write, mut read) = ws_stream.split();

    let reader_stats = Arc::clone(&stats);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                if let Ok(mut data) = reader_stats.lock() {
                    data.received(text.as_str());
                }
            }
        }
    });

    let mut ticker = interval(Duration::from_secs(args.send_interval_seconds.max(1)));
    let mut round: u64 = 0;
    loop {
        ticker.tick().await;
        round += 1;

        let mut outgoing: Vec<(&'static str, String)> = vec![
            ("ping", "ping".to_string()),
            (
                "signaling",
                json!({ "type": "candidate", "from": index, "round": round }).to_string(),
            ),
        ];
        if args.images {
            outgoing.push(("image", TINY_PNG.to_string()));
        }

        for (kind, text) in outgoing {
            if write.send(Message::Text(text.into())).await.is_err() {
                reader.abort();
                anyhow::bail!("client {} lost its connection", index);
            }
            if let Ok(mut data) = stats.lock() {
                data.sent(kind);
            }
        }

        if reader.is_finished() {
            anyhow::bail!("client {} was closed by the relay", index);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arc::new(Args::parse());
    let stats = Arc::new(Mutex::new(Stats::default()));

    let stats_reporter = Arc::clone(&stats);
    let report_every = Duration::from_secs(args.report_interval_seconds.max(1));
    tokio::spawn(async move {
        loop {
            sleep(report_every).await;
            let Ok(mut data) = stats_reporter.lock() else {
                break;
            };
            let snapshot = std::mem::take(&mut *data);
            drop(data);

            println!("\n----- Summary {} -----", Utc::now().format("%H:%M:%S"));
            println!("Sent:     {}", summary(&snapshot.sent));
            println!("Received: {}", summary(&snapshot.received));
            println!("------------------------------\n");
        }
    });

    println!("Connecting {} clients to {}...", args.clients, args.url);
    let mut handles = Vec::with_capacity(args.clients);
    for index in 0..args.clients {
        handles.push(tokio::spawn(run_client(index, Arc::clone(&args), Arc::clone(&stats))));
    }
    println!("Running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => println!("Stopping."),
        _ = async {
            for handle in handles {
                match handle.await {
                    Ok(Err(e)) => eprintln!("{:#}", e),
                    Err(e) => eprintln!("client task failed: {}", e),
                    Ok(Ok(())) => {}
                }
            }
        } => println!("All clients finished."),
    }

    Ok(())
}
