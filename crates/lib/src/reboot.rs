//! Handling of system restarts/reboot

use std::future::Future;
use std::io::Write;
use std::process::Command;

use anyhow::Result;
use bootslot_utils::CommandRunExt;
use fn_error_context::context;

/// What kind of restart is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// Restart the whole box so the bootloader picks up the new record
    Reboot,
}

/// Something able to restart the system.
pub trait Restarter {
    /// Request the restart. Real implementations only return on error.
    fn restart(&self, kind: RestartKind) -> impl Future<Output = Result<()>> + Send;
}

/// Runs the configured reboot command.
#[derive(Debug)]
pub struct CommandRestarter {
    argv: Vec<String>,
}

impl CommandRestarter {
    /// Use `argv` as the reboot command; it must not be empty.
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    #[context("Initiating reboot")]
    fn run(&self) -> Result<()> {
        let Some((prog, args)) = self.argv.split_first() else {
            anyhow::bail!("Empty reboot command");
        };
        // Flush output streams
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        Command::new(prog).args(args).log_debug().run_capture_stderr()
    }
}

impl Restarter for CommandRestarter {
    async fn restart(&self, kind: RestartKind) -> Result<()> {
        tracing::info!("Requesting {kind:?}");
        self.run()?;
        // We expect to be terminated here. Waiting instead of exiting
        // keeps callers from racing the shutdown.
        tracing::debug!("Initiated reboot, waiting");
        std::future::pending::<()>().await;
        Ok(())
    }
}
