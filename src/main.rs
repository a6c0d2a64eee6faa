//! # IPC Channels - Utility Entry Point
//!
//! Command line front end for the channel library. With no action flag it
//! runs a loopback self test: a send comm pushes a batch of tagged messages
//! through a shared transport resource and a recv comm verifies content
//! and order on the other side.
//!
//! Action flags:
//! - `--list-queues`: print the System V message queues visible to this user
//! - `--cleanup`: remove every System V message queue visible to this user
//! - `--show-config`: print the effective configuration as JSON
//!
//! Log output is controlled via the `RUST_LOG` environment variable, e.g.
//! `RUST_LOG=debug ipc-channels -t sysv -c 1000`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use ipc_channels::{
    admin, cli::Args, Comm, CommConfig, CommContext, CommOptions, Direction, RecvResult, Timeout,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Log level comes from RUST_LOG; nothing is printed by default.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = CommConfig::from_env();

    if args.show_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if args.list_queues {
        let keys = admin::list_queues().await?;
        println!("{}", serde_json::to_string_pretty(&keys)?);
        return Ok(());
    }

    if args.cleanup {
        let removed = admin::remove_queues(None).await?;
        info!("Removed {} message queue(s)", removed);
        return Ok(());
    }

    run_self_test(&args, config).await
}

/// Push `count` tagged messages through a send/recv comm pair on the chosen
/// transport, then verify that every one arrives intact and in order.
///
/// The sender keeps its default driver role, so a transport narrower than
/// the batch exercises the send backlog instead of blocking.
async fn run_self_test(args: &Args, config: CommConfig) -> Result<()> {
    info!(
        "Self test: {} message(s) of {} byte(s) over a {}",
        args.count, args.message_size, args.transport
    );
    let ctx = CommContext::with_config(config);

    let sender = Comm::new(
        Arc::clone(&ctx),
        CommOptions::new("self-test-tx", Direction::Send, args.transport),
    );
    sender.open().await?;
    let address = sender
        .address()
        .context("sender has no address after open")?;

    let receiver = Comm::new(
        Arc::clone(&ctx),
        CommOptions::new("self-test-rx", Direction::Recv, args.transport).with_address(&address),
    );
    receiver.open().await?;

    for i in 0..args.count {
        let payload = self_test_payload(i, args.message_size);
        if !sender.send(&payload).await? {
            bail!("send {} was dropped: the comm closed early", i);
        }
    }
    sender.send_eof().await?;

    let mut received = 0;
    loop {
        match receiver
            .recv(Timeout::Bounded(Duration::from_secs(5)))
            .await?
        {
            result if result.is_eof() => break,
            RecvResult::Payload(payload) => {
                let expected = self_test_payload(received, args.message_size);
                if payload != expected {
                    bail!("message {} arrived corrupted or out of order", received);
                }
                received += 1;
            }
            RecvResult::Empty => bail!("channel stalled after {} message(s)", received),
            RecvResult::Closed => bail!("channel closed after {} message(s)", received),
        }
    }
    if received != args.count {
        bail!("expected {} message(s), received {}", args.count, received);
    }

    receiver.close(false).await?;
    sender.close(true).await?;
    ctx.shutdown().await;

    info!("Self test passed: {} message(s) verified", received);
    Ok(())
}

/// Deterministic payload for message `i`: an ordinal tag padded out to
/// `size` bytes. Smaller sizes keep the full tag so ordering stays
/// checkable.
fn self_test_payload(i: usize, size: usize) -> Vec<u8> {
    let mut payload = format!("message-{:08}", i).into_bytes();
    let target = payload.len().max(size);
    payload.resize(target, b'x');
    payload
}
