use anyhow::{Result, anyhow};
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use ringside::CallClient;
use ringside::config::CallConfig;
use ringside::memory::{MemoryCallStore, MemoryChannel, SimulatedMedia, SimulatedPeerFactory};
use ringside::types::{CallEvent, CallType, ConnectionState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// Two parties calling each other over the in-memory channel, store and
// simulated peer connections.
//
// Usage:
//   cargo run                                     # video call, hang up after 3s
//   cargo run -- --call-type audio --hold-secs 1
//   cargo run -- --drop-broadcast                 # only OFFER/ANSWER get through
//   cargo run -- --config call.json

#[derive(Parser, Debug)]
#[command(name = "ringside", about = "Loopback call between two local parties")]
struct Args {
    #[arg(long, default_value = "video")]
    call_type: CallType,
    /// Seconds to stay connected before the caller hangs up.
    #[arg(long, default_value_t = 3)]
    hold_secs: u64,
    /// Lose every broadcast message; the durable path still delivers.
    #[arg(long)]
    drop_broadcast: bool,
    /// JSON call configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "alice")]
    caller: String,
    #[arg(long, default_value = "bob")]
    callee: String,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(args)) {
        error!("Demo failed: {:#}", e);
        std::process::exit(1);
    }
}

fn party(
    user: &str,
    channel: &MemoryChannel,
    store: &MemoryCallStore,
    config: CallConfig,
) -> Result<(CallClient, mpsc::UnboundedReceiver<CallEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let label = user.to_string();
    let client = CallClient::builder()
        .with_user(user)
        .with_channel(Arc::new(channel.clone()))
        .with_store(Arc::new(store.clone()))
        .with_peer_factory(Arc::new(SimulatedPeerFactory::new()))
        .with_media(Arc::new(SimulatedMedia::new()))
        .with_config(config)
        .on_event(Arc::new(move |event: &CallEvent| {
            info!("[{}] {:?}", label, event);
            let _ = tx.send(event.clone());
        }))
        .build()?;
    Ok((client, rx))
}

async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    what: &str,
    mut matches: F,
) -> Result<CallEvent>
where
    F: FnMut(&CallEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if matches(&event) {
                return Ok(event);
            }
        }
        Err(anyhow!("event stream closed while waiting for {}", what))
    })
    .await
    .map_err(|_| anyhow!("timed out waiting for {}", what))?
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => CallConfig::from_file(path)?,
        None => CallConfig::default(),
    };

    let channel = MemoryChannel::new();
    channel.set_drop_broadcast(args.drop_broadcast);
    let store = MemoryCallStore::new();

    let (caller, mut caller_events) = party(&args.caller, &channel, &store, config.clone())?;
    let (callee, mut callee_events) = party(&args.callee, &channel, &store, config)?;
    caller.init().await?;
    callee.init().await?;

    let call = caller
        .initiate_call(args.callee.as_str(), args.call_type)
        .await?;
    info!("{} is calling {} ({})", args.caller, args.callee, call.id);

    let outcome = async {
        wait_for(&mut callee_events, "the incoming call", |e| {
            matches!(e, CallEvent::Incoming(_))
        })
        .await?;
        callee.accept_call().await?;

        wait_for(&mut caller_events, "the connection", |e| {
            matches!(
                e,
                CallEvent::ConnectionStateChanged {
                    state: ConnectionState::Connected,
                    ..
                }
            )
        })
        .await?;
        info!("Connected, holding for {}s", args.hold_secs);
        tokio::time::sleep(Duration::from_secs(args.hold_secs)).await;

        let ended = caller.end_call().await?;
        Ok::<_, anyhow::Error>(ended)
    }
    .await;

    match outcome {
        Ok(ended) => info!(
            "Call {} {} after {}s",
            ended.id,
            ended.status,
            ended.duration_seconds.unwrap_or(0)
        ),
        Err(e) => warn!("Call {} did not complete: {:#}", call.id, e),
    }

    if let Some(record) = store.snapshot(&call.id) {
        info!(
            "Stored record: status={} started_at={:?} ended_at={:?} duration={:?}",
            record.status, record.started_at, record.ended_at, record.duration_seconds
        );
    }
    info!(
        "Durable rows written: {}, broadcasts to {}: {}",
        channel.rows().len(),
        args.callee,
        channel.published_count(&caller.signaling().config().topic_for(callee.user_id()))
    );

    caller.shutdown().await;
    callee.shutdown().await;
    Ok(())
}
