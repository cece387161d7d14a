//! Terminal signal handling: the first interrupt asks tasks to shut down
//! gracefully; a second one within the grace window kills everything on
//! the spot.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::process::ProcessManager;

const FORCE_KILL_WINDOW: Duration = Duration::from_secs(2);
const SIGINT_EXIT_CODE: i32 = 130;

/// Installs the two-stage interrupt handler for the duration of the run.
pub fn install(manager: ProcessManager) {
    tokio::spawn(async move {
        let mut last_interrupt: Option<Instant> = None;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("unable to listen for interrupt signals");
                return;
            }
            match last_interrupt {
                Some(previous) if previous.elapsed() < FORCE_KILL_WINDOW => {
                    eprintln!("turbo: killing tasks");
                    manager.kill().await;
                    std::process::exit(SIGINT_EXIT_CODE);
                }
                _ => {
                    eprintln!("turbo: shutting down, interrupt again to force");
                    last_interrupt = Some(Instant::now());
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        manager.stop().await;
                    });
                }
            }
        }
    });
}
