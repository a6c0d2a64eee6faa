//! System V queue administration via the `ipcs`/`ipcrm` command line
//! tools, for listing and cleaning up queue resources left behind by
//! crashed or lingering processes.

use crate::error::Result;
use anyhow::{anyhow, Context};
use tokio::process::Command;
use tracing::{debug, warn};

/// Leading fragments of `ipcs` banner and column-header lines, which carry
/// no queue entries.
const HEADER_MARKERS: &[&str] = &[
    "------",
    "key ",
    "IPC status from",
    "Message Queues",
    "T ",
];

/// Column index of the queue key in `ipcs -q` output for this platform.
fn key_column() -> Result<usize> {
    if cfg!(target_os = "linux") {
        Ok(0)
    } else if cfg!(target_os = "macos") {
        Ok(2)
    } else {
        Err(anyhow!("no ipcs column layout known for this platform").into())
    }
}

fn is_header_line(line: &str) -> bool {
    HEADER_MARKERS.iter().any(|marker| line.starts_with(marker))
}

/// Run `ipcs` with the given flags and capture its stdout.
pub async fn ipcs_output(args: &[&str]) -> Result<String> {
    let output = Command::new("ipcs")
        .args(args)
        .output()
        .await
        .context("running ipcs")?;
    if !output.status.success() {
        return Err(anyhow!(
            "ipcs {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run `ipcrm` with the given flags.
pub async fn ipcrm(args: &[&str]) -> Result<()> {
    let output = Command::new("ipcrm")
        .args(args)
        .output()
        .await
        .context("running ipcrm")?;
    if !output.status.success() {
        return Err(anyhow!(
            "ipcrm {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )
        .into());
    }
    Ok(())
}

/// Extract queue keys from an `ipcs -q` listing.
///
/// Rows whose key column is missing are skipped with a warning rather than
/// failing the whole listing.
pub fn parse_queue_keys(listing: &str) -> Result<Vec<String>> {
    let column = key_column()?;
    let mut keys = Vec::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() || is_header_line(line) {
            continue;
        }
        let columns: Vec<&str> = line.split_whitespace().collect();
        match columns.get(column) {
            Some(key) => keys.push((*key).to_string()),
            None => warn!("Skipping unparseable ipcs line: '{}'", line),
        }
    }
    Ok(keys)
}

/// Keys of every System V message queue currently visible to this user.
pub async fn list_queues() -> Result<Vec<String>> {
    let listing = ipcs_output(&["-q"]).await?;
    let keys = parse_queue_keys(&listing)?;
    debug!("ipcs reports {} message queue(s)", keys.len());
    Ok(keys)
}

/// Remove message queues by key, or every visible queue when `keys` is
/// `None`. Returns how many were removed; individual failures are logged
/// and skipped so one stale entry cannot block the sweep.
pub async fn remove_queues(keys: Option<&[String]>) -> Result<usize> {
    let targets = match keys {
        Some(keys) => keys.to_vec(),
        None => list_queues().await?,
    };
    let mut removed = 0;
    for key in &targets {
        match ipcrm(&["-Q", key]).await {
            Ok(()) => {
                debug!("Removed message queue '{}'", key);
                removed += 1;
            }
            Err(e) => warn!("Failed to remove message queue '{}': {}", key, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_linux_listing() {
        let listing = "\n------ Message Queues --------\n\
                       key        msqid      owner      perms      used-bytes   messages\n\
                       0x52524d91 32768      root       600        0            1\n\
                       0x0000abcd 32769      root       600        128          0\n";
        let keys = parse_queue_keys(listing).unwrap();
        assert_eq!(keys, vec!["0x52524d91", "0x0000abcd"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_parse_empty_listing() {
        let listing = "\n------ Message Queues --------\n\
                       key        msqid      owner      perms      used-bytes   messages\n";
        assert!(parse_queue_keys(listing).unwrap().is_empty());
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_parse_macos_listing() {
        let listing = "IPC status from <running system> as of Thu Jan  1 00:00:00 UTC 1970\n\
                       T     ID     KEY        MODE       OWNER    GROUP\n\
                       Message Queues:\n\
                       q  65536 0x52524d91 --rw-------     root    wheel\n";
        let keys = parse_queue_keys(listing).unwrap();
        assert_eq!(keys, vec!["0x52524d91"]);
    }

    #[test]
    fn test_header_lines_are_skipped() {
        assert!(is_header_line("------ Message Queues --------"));
        assert!(is_header_line("key        msqid      owner"));
        assert!(is_header_line("IPC status from <running system>"));
        assert!(is_header_line("Message Queues:"));
        assert!(is_header_line("T     ID     KEY"));
        assert!(!is_header_line("0x52524d91 32768      root"));
    }
}
