//! # The command line interface
//!
//! Commands for listing installed images and rebooting into one of them.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::activator::{Activation, SystemActivator};
use crate::config::Capabilities;
use crate::consts::{DEFAULT_CONFIG, MODE_12, MODE_DEFAULT};
use crate::menu::{MenuEntry, Placeholder};

const MODE_HINT: &str = "Mode 1 supports Kodi, PiP may not work.\nMode 12 supports PiP, Kodi may not work.";

/// Choose the image the box boots next.
#[derive(Debug, Parser)]
#[clap(name = "bootslot", version)]
struct Opt {
    /// Path to the box capabilities file
    #[clap(long, global = true, default_value = DEFAULT_CONFIG)]
    config: Utf8PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Show the images installed in each slot.
    List {
        /// Output JSON
        #[clap(long)]
        json: bool,
    },
    /// Pick an image interactively and reboot into it.
    Select,
    /// Reboot into the image in a given slot.
    Activate {
        /// The slot number
        #[clap(long)]
        slot: u32,
        /// The boot mode
        #[clap(long, default_value_t = MODE_DEFAULT, value_parser = parse_mode)]
        mode: u32,
    },
    /// Print the slot and mode the running image was booted from.
    Current,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    match s.parse() {
        Ok(m) if m == MODE_DEFAULT || m == MODE_12 => Ok(m),
        _ => Err(format!("expected {MODE_DEFAULT} or {MODE_12}")),
    }
}

/// Whether an interrupt should end the process rather than cancel the
/// session: once the list is ready, or on a second Ctrl-C.
fn interrupt_exits(session: &CancellationToken, opened: &CancellationToken) -> bool {
    opened.is_cancelled() || session.is_cancelled()
}

/// Ctrl-C cancels the session while it is mounting and enumerating. The
/// handler stays installed for the life of the process, so afterwards it
/// exits like the default SIGINT action would.
fn handle_interrupts(activator: &SystemActivator) -> DropGuard {
    let session = activator.cancellation_token();
    let opened = CancellationToken::new();
    let guard = opened.clone().drop_guard();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt_exits(&session, &opened) {
                std::process::exit(130);
            }
            tracing::debug!("Interrupted");
            session.cancel();
        }
    });
    guard
}

/// Open a session; `None` if it was cancelled before the list was ready.
async fn open(caps: Capabilities) -> Result<Option<SystemActivator>> {
    let mut activator = SystemActivator::system(caps);
    let opening = handle_interrupts(&activator);
    eprintln!("{}", Placeholder::Waiting);
    let opened = activator.open().await?.is_some();
    drop(opening);
    Ok(opened.then_some(activator))
}

fn print_entries(entries: &[MenuEntry]) -> Result<()> {
    let mut out = std::io::stdout().lock();
    for entry in entries {
        match entry {
            MenuEntry::Selectable {
                label,
                current: true,
                ..
            } => writeln!(out, "{}", label.bold())?,
            MenuEntry::Selectable { label, .. } => writeln!(out, "{label}")?,
            MenuEntry::Separator => writeln!(out)?,
            MenuEntry::Placeholder { reason } => writeln!(out, "{}", reason.dimmed())?,
        }
    }
    Ok(())
}

async fn list(caps: Capabilities, json: bool) -> Result<()> {
    let Some(mut activator) = open(caps).await? else {
        return Ok(());
    };
    if json {
        let mut out = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut out, activator.entries())?;
        writeln!(out)?;
    } else {
        print_entries(activator.entries())?;
    }
    activator.cancel().await
}

async fn current(caps: Capabilities) -> Result<()> {
    let Some(mut activator) = open(caps).await? else {
        return Ok(());
    };
    let current = activator.current();
    match current.slot {
        Some(slot) => println!("Slot {slot} - Mode {}", current.mode.unwrap_or(MODE_DEFAULT)),
        None => println!("Unknown"),
    }
    activator.cancel().await
}

async fn activate(caps: Capabilities, slot: u32, mode: u32) -> Result<()> {
    let Some(mut activator) = open(caps).await? else {
        return Ok(());
    };
    let entry = match activator.entry_for(slot, mode) {
        Ok(entry) => entry.clone(),
        Err(e) => {
            activator.cancel().await?;
            return Err(e.into());
        }
    };
    let r = match activator.activate(&entry).await {
        Ok(r) => r,
        Err(e) => {
            activator.cancel().await?;
            return Err(e);
        }
    };
    report(r);
    Ok(())
}

fn report(r: Activation) {
    match r {
        Activation::Rebooting { slot, mode } => {
            println!("Rebooting into slot {slot} mode {mode}")
        }
        Activation::Cancelled => println!("Cancelled"),
        Activation::Ignored => {}
    }
}

/// Show the list until an image is picked or the prompt is dismissed.
async fn select(caps: Capabilities) -> Result<()> {
    let supports_mode12 = caps.supports_mode12();
    let Some(mut activator) = open(caps).await? else {
        return Ok(());
    };
    let entries = activator.entries().to_vec();
    if !entries.iter().any(|e| e.selection().is_some()) {
        print_entries(&entries)?;
        return activator.cancel().await;
    }
    if supports_mode12 {
        println!("{MODE_HINT}");
    }
    let mut default = entries
        .iter()
        .position(|e| matches!(e, MenuEntry::Selectable { current: true, .. }))
        .or_else(|| entries.iter().position(|e| e.selection().is_some()))
        .unwrap_or_default();
    loop {
        let items = entries.clone();
        let chosen = tokio::task::spawn_blocking(move || {
            dialoguer::Select::with_theme(&dialoguer::theme::ColorfulTheme::default())
                .with_prompt("Boot into")
                .items(&items)
                .default(default)
                .interact_opt()
        })
        .await
        .context("Prompt task")??;
        let Some(idx) = chosen else {
            // Escape or q
            println!("Cancelled");
            return activator.cancel().await;
        };
        match activator.activate(&entries[idx]).await {
            Ok(Activation::Ignored) => default = idx,
            Ok(r) => {
                report(r);
                return Ok(());
            }
            Err(e) => {
                activator.cancel().await?;
                return Err(e);
            }
        }
    }
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    let caps = Capabilities::load(&opt.config)?;
    match opt.cmd {
        Cmd::List { json } => list(caps, json).await,
        Cmd::Select => select(caps).await,
        Cmd::Activate { slot, mode } => activate(caps, slot, mode).await,
        Cmd::Current => current(caps).await,
    }
}
