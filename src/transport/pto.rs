//! Probe timeout (PTO) timer for the QRT transport.
//!
//! A single worker thread owns the deadline. The endpoint arms or
//! cancels it over a command channel and polls fired packet numbers
//! from a bounded expiration channel between receive attempts, so the
//! timer never touches endpoint state directly.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};

/// Capacity of the expiration channel; one armed probe at a time means
/// the channel rarely holds more than a single entry.
const EXPIRATION_QUEUE: usize = 8;

enum Command {
    Arm {
        packet_number: u64,
        deadline: SystemTime,
    },
    Cancel,
    Shutdown,
}

/// Handle to the PTO worker thread.
#[derive(Debug)]
pub struct ProbeTimer {
    commands: Sender<Command>,
    expirations: Receiver<u64>,
    worker: Option<JoinHandle<()>>,
}

impl ProbeTimer {
    /// Spawn the timer worker.
    #[must_use]
    pub fn spawn() -> Self {
        let (commands, command_rx) = mpsc::channel();
        let (expiration_tx, expirations) = mpsc::sync_channel(EXPIRATION_QUEUE);
        let worker = thread::Builder::new()
            .name("qrt-pto".into())
            .spawn(move || run_worker(&command_rx, &expiration_tx))
            .ok();
        Self {
            commands,
            expirations,
            worker,
        }
    }

    /// Arm the timer for the given packet number. Re-arming replaces
    /// any previously armed deadline.
    pub fn arm(&self, packet_number: u64, deadline: SystemTime) {
        trace!(packet_number, "arming probe timer");
        let _ = self.commands.send(Command::Arm {
            packet_number,
            deadline,
        });
    }

    /// Cancel the armed deadline, if any.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    /// Drain one fired packet number, if the timer has expired.
    pub fn poll_expired(&self) -> Option<u64> {
        match self.expirations.try_recv() {
            Ok(packet_number) => Some(packet_number),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

impl Drop for ProbeTimer {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(commands: &Receiver<Command>, expirations: &SyncSender<u64>) {
    let mut armed: Option<(u64, SystemTime)> = None;
    loop {
        let command = match armed {
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            },
            Some((packet_number, deadline)) => {
                let wait = deadline
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO);
                match commands.recv_timeout(wait) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => {
                        debug!(packet_number, "probe timer expired");
                        armed = None;
                        // Dropped when the endpoint is not draining; the
                        // next arm will produce a fresh expiration.
                        let _ = expirations.try_send(packet_number);
                        None
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        };

        match command {
            Some(Command::Arm {
                packet_number,
                deadline,
            }) => armed = Some((packet_number, deadline)),
            Some(Command::Cancel) => armed = None,
            Some(Command::Shutdown) => return,
            None => {}
        }
    }
}
