//! The TCP front: accept loop, per-connection read loop, and graceful
//! drain. All protocol behavior lives in the middleware chain; this
//! module only moves frames and enforces connection-level limits.

pub mod middleware;
pub mod rate_limit;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocol::consts::CMD_ERR;
use crate::protocol::{read_message, Message};
use crate::quotes::QuoteSource;
use crate::server::middleware::{
    ChallengeMiddleware, ErrorAdapter, Handler, LoggingMiddleware, MessageWriter,
    RateLimitMiddleware, ReqContext, TimeoutMiddleware, VerifyMiddleware,
};
use crate::server::rate_limit::RateLimiter;
use crate::server::routes::{
    DisconnectTerminal, NoopTerminal, QuoteTerminal, Router, UnknownTerminal,
};
use crate::store::ChallengeStore;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Server {
    port: u16,
    write_timeout: Duration,
    idle_timeout: Duration,
    max_connections: usize,
    rate_window: Duration,
    store: Arc<dyn ChallengeStore>,
    limiter: Arc<RateLimiter>,
    router: Arc<Router>,
}

impl Server {
    pub fn new(
        cfg: &Config,
        store: Arc<dyn ChallengeStore>,
        quotes: Arc<dyn QuoteSource>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(cfg.rate_limit, cfg.rate_window()));

        let chain = |terminal: Arc<dyn Handler>| -> Arc<dyn Handler> {
            // Composed innermost-first; the adapter must stay innermost so
            // outer stages still observe the original error.
            let handler: Arc<dyn Handler> = Arc::new(ErrorAdapter::new(terminal));
            let handler = Arc::new(VerifyMiddleware::new(
                store.clone(),
                cfg.pow_difficulty,
                cfg.spent_ttl(),
                handler,
            ));
            let handler = Arc::new(ChallengeMiddleware::new(
                store.clone(),
                cfg.pow_difficulty,
                cfg.challenge_ttl(),
                handler,
            ));
            let handler = Arc::new(RateLimitMiddleware::new(limiter.clone(), handler));
            let handler = Arc::new(LoggingMiddleware::new(handler));
            Arc::new(TimeoutMiddleware::new(cfg.read_timeout(), handler))
        };

        let router = Router::new(
            chain(Arc::new(NoopTerminal)),
            chain(Arc::new(QuoteTerminal::new(quotes))),
            chain(Arc::new(DisconnectTerminal)),
            chain(Arc::new(UnknownTerminal)),
        );

        Self {
            port: cfg.port,
            write_timeout: cfg.write_timeout(),
            idle_timeout: cfg.idle_timeout(),
            max_connections: cfg.max_connections,
            rate_window: cfg.rate_window(),
            store,
            limiter,
            router: Arc::new(router),
        }
    }

    /// Binds the configured port and serves until `shutdown` fires.
    pub async fn run(self, shutdown: oneshot::Receiver<()>) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        info!(addr = %addr, "powgate listening");
        self.serve(listener, shutdown).await
    }

    /// Serves on an already-bound listener. Split out so tests can bind an
    /// ephemeral port themselves.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let mut conns = JoinSet::new();

        let sweeper = {
            let limiter = self.limiter.clone();
            let window = self.rate_window;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(window);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    limiter.sweep();
                }
            })
        };

        loop {
            // Reap connection tasks that have already finished.
            while conns.try_join_next().is_some() {}

            // A permit is taken before accept, so the listener simply
            // stops accepting at the connection cap.
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (socket, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                        continue;
                    }
                },
            };

            info!(addr = %peer, "new connection");
            conns.spawn(handle_connection(
                socket,
                peer.to_string(),
                self.router.clone(),
                self.write_timeout,
                self.idle_timeout,
                permit,
            ));
        }

        drop(listener);
        info!("shutting down, draining connections");

        let drain = async {
            while conns.join_next().await.is_some() {}
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("drain deadline expired, abandoning remaining connections");
            conns.abort_all();
        }

        sweeper.abort();
        // The store is closed last; in-flight handlers may still touch it
        // during the drain above.
        self.store.close().await?;
        info!("powgate stopped");
        Ok(())
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: String,
    router: Arc<Router>,
    write_timeout: Duration,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let (read_half, write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = MessageWriter::new(write_half, write_timeout);

    loop {
        let msg = match tokio::time::timeout(idle_timeout, read_message(&mut reader)).await {
            Err(_) => {
                debug!(addr = %peer, "idle timeout");
                break;
            }
            Ok(Err(err)) if err.is_fatal() => {
                debug!(addr = %peer, error = %err, "read failed");
                break;
            }
            Ok(Err(err)) => {
                // A malformed line leaves the stream LF-synced; report it
                // and keep reading.
                let reply = Message::with_body(CMD_ERR, format!("ERROR: {err}"));
                if writer.send(&reply).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Ok(msg)) => msg,
        };

        // Context is per message; the verified flag never outlives one
        // request.
        let mut ctx = ReqContext::new(peer.clone());
        if let Err(err) = router.dispatch(&mut ctx, &mut writer, &msg).await {
            if err.is_fatal() {
                error!(addr = %peer, error = %err, "closing connection");
                break;
            }
            // Already answered with ERR by the adapter.
            debug!(addr = %peer, error = %err, "request rejected");
        }
    }

    info!(addr = %peer, "connection closed");
}
