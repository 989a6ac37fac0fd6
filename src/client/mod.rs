//! Reference client: requests a challenge, brute-forces the counter
//! across worker threads, and exchanges the solution for a quote.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::pow;
use crate::protocol::consts::{CMD_CHL, CMD_ERR, CMD_QOT, CMD_REQ, CMD_RES};
use crate::protocol::{read_message, write_message, HashcashHeader, Message};

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Parallel counter search over a parsed challenge.
pub struct Solver {
    workers: usize,
    timeout: Duration,
}

impl Solver {
    /// `workers == 0` sizes the search to the machine.
    pub fn new(workers: usize, timeout: Duration) -> Self {
        let workers = if workers == 0 {
            num_cpus::get()
        } else {
            workers
        };
        Self { workers, timeout }
    }

    /// Returns the serialized solution header, or fails once the search
    /// deadline lapses. Worker `i` of `W` walks counters `i, i+W, ...`;
    /// the stride partition keeps workers free of shared mutable state.
    pub async fn solve(&self, challenge: &HashcashHeader) -> Result<String> {
        let started = Instant::now();
        info!(
            difficulty = challenge.difficulty,
            workers = self.workers,
            "solving challenge"
        );

        let stop = Arc::new(AtomicBool::new(false));
        let (solution_tx, mut solution_rx) = mpsc::channel::<String>(1);

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let header = challenge.clone();
            let stop = Arc::clone(&stop);
            let solution_tx = solution_tx.clone();
            let stride = self.workers as i64;

            handles.push(tokio::task::spawn_blocking(move || {
                search(header, worker_id as i64, stride, stop, solution_tx)
            }));
        }
        drop(solution_tx);

        let outcome = tokio::time::timeout(self.timeout, solution_rx.recv()).await;

        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            let _ = handle.await;
        }

        match outcome {
            Ok(Some(solution)) => {
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "challenge solved");
                Ok(solution)
            }
            Ok(None) => Err(anyhow!("solver workers exited without a solution")),
            Err(_) => Err(anyhow!(
                "no solution within {:?} at difficulty {}",
                self.timeout,
                challenge.difficulty
            )),
        }
    }
}

impl Default for Solver {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS, DEFAULT_SEARCH_TIMEOUT)
    }
}

fn search(
    mut header: HashcashHeader,
    start: i64,
    stride: i64,
    stop: Arc<AtomicBool>,
    solution_tx: mpsc::Sender<String>,
) {
    let mut counter = start;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }

        header.counter = counter;
        let candidate = header.to_string();
        if pow::verify(&candidate, header.difficulty) {
            debug!(counter, "worker found solution");
            // Capacity-1 channel: the first sender wins, everyone else
            // observes the stop flag and exits.
            let _ = solution_tx.try_send(candidate);
            stop.store(true, Ordering::Relaxed);
            return;
        }

        counter += stride;
    }
}

/// One full session: REQ, solve the CHL, RES, read the QOT.
pub async fn fetch_quote(addr: &str, solver: &Solver) -> Result<String> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_message(&mut write_half, &Message::new(CMD_REQ))
        .await
        .context("failed to request challenge")?;

    let challenge_msg = read_message(&mut reader)
        .await
        .context("failed to read challenge")?;
    let challenge = expect_command(&challenge_msg, CMD_CHL)?;
    let header: HashcashHeader = challenge
        .parse()
        .map_err(|_| anyhow!("server sent an unparseable challenge: {challenge}"))?;

    let solution = solver.solve(&header).await?;

    write_message(&mut write_half, &Message::with_body(CMD_RES, solution))
        .await
        .context("failed to submit solution")?;

    let quote_msg = read_message(&mut reader)
        .await
        .context("failed to read quote")?;
    expect_command(&quote_msg, CMD_QOT)
}

fn expect_command(msg: &Message, wanted: &str) -> Result<String> {
    if msg.command == CMD_ERR {
        bail!("server error: {}", msg.body);
    }
    if msg.command != wanted {
        bail!("expected {wanted}, got {}", msg.command);
    }
    Ok(msg.body.clone())
}
