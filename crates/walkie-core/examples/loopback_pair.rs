//! Loopback Walkie Pair Example
//!
//! Two walkie agents share an in-process broker. Alpha calls bravo, talks,
//! mutes, then hangs up. Every event bravo sees is printed.
//!
//! Run with: cargo run --example loopback_pair
//! Set RUST_LOG=walkie_core=debug for the state machine trace.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing_subscriber::EnvFilter;
use walkie_core::loopback::{
    LoopbackBroker, LoopbackCapture, LoopbackOutput, LoopbackWakeLock, PermissionMode,
};
use walkie_core::storage::MemoryStore;
use walkie_core::{Phase, Walkie, WalkieEvent, WalkieHandle};

async fn start(
    broker: &LoopbackBroker,
    id: &str,
) -> anyhow::Result<(WalkieHandle, tokio::task::JoinHandle<()>)> {
    let walkie = Walkie::builder()
        .store(MemoryStore::with_entries([("walkie-id", id)]))
        .broker(broker.clone())
        .capture(LoopbackCapture::new(PermissionMode::Grant))
        .output(LoopbackOutput::new())
        .wake_lock(LoopbackWakeLock::new(true))
        .build()
        .await?;
    Ok(walkie.spawn())
}

async fn wait_for_phase(handle: &WalkieHandle, phase: Phase) -> anyhow::Result<()> {
    timeout(Duration::from_secs(2), async {
        loop {
            if handle.status().await?.session.phase == phase {
                return Ok::<_, anyhow::Error>(());
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("📻 Loopback Walkie Pair");
    println!("=======================\n");

    let broker = LoopbackBroker::new();
    let (alpha, alpha_task) = start(&broker, "alpha").await?;
    let (bravo, bravo_task) = start(&broker, "bravo").await?;

    let mut bravo_events = bravo.subscribe_simple();
    let printer = tokio::spawn(async move {
        while let Some(event) = bravo_events.next().await {
            match &event {
                WalkieEvent::SessionChanged(info) => println!(
                    "  bravo: {} -> {} (talking: {})",
                    info.previous_phase, info.session.phase, info.session.talking
                ),
                WalkieEvent::CallEnded { reason, .. } => {
                    println!("  bravo: call ended ({})", reason);
                    break;
                }
                other => println!("  bravo: {:?}", other),
            }
        }
    });

    println!("🔗 alpha calls bravo");
    alpha.connect("bravo")?;
    wait_for_phase(&alpha, Phase::Active).await?;
    println!("🎙️  alpha is talking");

    alpha.toggle_talk()?;
    let status = alpha.status().await?;
    println!("🔇 alpha muted (talking: {})", status.session.talking);

    alpha.hang_up()?;
    wait_for_phase(&bravo, Phase::Idle).await?;
    printer.await?;
    println!("📴 call over\n");

    alpha.shutdown()?;
    bravo.shutdown()?;
    alpha_task.await?;
    bravo_task.await?;
    Ok(())
}
