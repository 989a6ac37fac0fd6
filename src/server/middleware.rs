//! The per-message handler chain. Each middleware is a struct holding the
//! next handler; the server composes them outermost-first: timeout,
//! logging, rate limit, challenge issuer, solution verifier, error
//! adapter, terminal. The adapter sits innermost so outer stages still see
//! the original error for logging after the client has been told.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::error::GateError;
use crate::pow;
use crate::protocol::consts::{ALGORITHM_SHA256, CMD_CHL, CMD_ERR, CMD_REQ, CMD_RES, HEADER_VERSION};
use crate::protocol::{write_message, HashcashHeader, Message};
use crate::server::rate_limit::RateLimiter;
use crate::store::ChallengeStore;

/// Typed per-message context; created fresh for every decoded message.
pub struct ReqContext {
    pub peer: String,
    pub verified: bool,
}

impl ReqContext {
    pub fn new(peer: String) -> Self {
        Self {
            peer,
            verified: false,
        }
    }
}

/// Write side of a connection with the configured write deadline applied
/// to every frame.
pub struct MessageWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
    timeout: Duration,
}

impl MessageWriter {
    pub fn new<W>(writer: W, timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(writer),
            timeout,
        }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), GateError> {
        match tokio::time::timeout(self.timeout, write_message(&mut self.inner, msg)).await {
            Ok(result) => result,
            Err(_) => Err(GateError::Timeout),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError>;
}

/// Bounds the handling of one message by the read deadline.
pub struct TimeoutMiddleware {
    limit: Duration,
    next: Arc<dyn Handler>,
}

impl TimeoutMiddleware {
    pub fn new(limit: Duration, next: Arc<dyn Handler>) -> Self {
        Self { limit, next }
    }
}

#[async_trait]
impl Handler for TimeoutMiddleware {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        match tokio::time::timeout(self.limit, self.next.call(ctx, io, msg)).await {
            Ok(result) => result,
            Err(_) => Err(GateError::Timeout),
        }
    }
}

/// Tags the request trace with peer and command before anything else runs.
pub struct LoggingMiddleware {
    next: Arc<dyn Handler>,
}

impl LoggingMiddleware {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for LoggingMiddleware {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        debug!(peer = %ctx.peer, command = %msg.command, "handling message");
        self.next.call(ctx, io, msg).await
    }
}

/// Sliding-window admission, keyed by the peer's host so reconnecting on a
/// fresh ephemeral port does not reset the budget.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    next: Arc<dyn Handler>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, next: Arc<dyn Handler>) -> Self {
        Self { limiter, next }
    }
}

fn peer_host(peer: &str) -> &str {
    peer.rsplit_once(':').map(|(host, _)| host).unwrap_or(peer)
}

#[async_trait]
impl Handler for RateLimitMiddleware {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        if !self.limiter.allowed(peer_host(&ctx.peer)) {
            return Err(GateError::RateLimited);
        }
        self.next.call(ctx, io, msg).await
    }
}

/// On REQ: mint a nonce, persist the challenge, answer CHL. REQ terminates
/// here; `next` is not invoked.
pub struct ChallengeMiddleware {
    store: Arc<dyn ChallengeStore>,
    difficulty: u32,
    challenge_ttl: Duration,
    next: Arc<dyn Handler>,
}

impl ChallengeMiddleware {
    pub fn new(
        store: Arc<dyn ChallengeStore>,
        difficulty: u32,
        challenge_ttl: Duration,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            store,
            difficulty,
            challenge_ttl,
            next,
        }
    }
}

#[async_trait]
impl Handler for ChallengeMiddleware {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        if msg.command != CMD_REQ {
            return self.next.call(ctx, io, msg).await;
        }

        let nonce = pow::generate_nonce();
        let header = HashcashHeader {
            version: HEADER_VERSION,
            difficulty: self.difficulty,
            expires_at: Utc::now().timestamp() + self.challenge_ttl.as_secs() as i64,
            subject: ctx.peer.clone(),
            algorithm: ALGORITHM_SHA256.to_string(),
            nonce: nonce.clone(),
            counter: 0,
        };

        let challenge = header.to_string();
        self.store
            .put(&nonce, &challenge, self.challenge_ttl)
            .await?;

        debug!(peer = %ctx.peer, nonce = %nonce, "challenge issued");
        io.send(&Message::with_body(CMD_CHL, challenge)).await
    }
}

/// On RES: validate the submitted solution. Checks run cheapest-first and
/// short-circuit; the spent marker is taken BEFORE the hash is verified,
/// so two racing submissions of one solution cannot both pass. Moving the
/// verification ahead of `mark_spent` reopens that race.
pub struct VerifyMiddleware {
    store: Arc<dyn ChallengeStore>,
    difficulty: u32,
    spent_ttl: Duration,
    next: Arc<dyn Handler>,
}

impl VerifyMiddleware {
    pub fn new(
        store: Arc<dyn ChallengeStore>,
        difficulty: u32,
        spent_ttl: Duration,
        next: Arc<dyn Handler>,
    ) -> Self {
        Self {
            store,
            difficulty,
            spent_ttl,
            next,
        }
    }
}

#[async_trait]
impl Handler for VerifyMiddleware {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        if msg.command != CMD_RES {
            return self.next.call(ctx, io, msg).await;
        }

        let header: HashcashHeader = msg.body.parse()?;

        if header.is_expired(Utc::now().timestamp()) {
            return Err(GateError::Expired);
        }
        if !header.subject_matches(&ctx.peer) {
            return Err(GateError::SubjectMismatch);
        }
        if header.difficulty != self.difficulty {
            return Err(GateError::DifficultyMismatch);
        }

        // Covers natural expiry and never-issued nonces alike.
        if self.store.get(&header.nonce).await?.is_none() {
            return Err(GateError::UnknownChallenge);
        }

        if !self.store.mark_spent(&header.nonce, self.spent_ttl).await? {
            return Err(GateError::Replay);
        }

        if !pow::verify(&msg.body, header.difficulty) {
            return Err(GateError::InsufficientWork);
        }

        // Best effort; the spent marker is authoritative from here on.
        if let Err(err) = self.store.delete(&header.nonce).await {
            warn!(nonce = %header.nonce, error = %err, "failed to delete consumed challenge");
        }

        ctx.verified = true;
        self.next.call(ctx, io, msg).await
    }
}

/// Innermost non-terminal: turns any inner error into an ERR frame, then
/// re-raises it for the outer stages to log. A failure to write the ERR
/// frame is fatal to the connection.
pub struct ErrorAdapter {
    next: Arc<dyn Handler>,
}

impl ErrorAdapter {
    pub fn new(next: Arc<dyn Handler>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for ErrorAdapter {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        match self.next.call(ctx, io, msg).await {
            Ok(()) => Ok(()),
            Err(err) => {
                io.send(&Message::with_body(CMD_ERR, format!("ERROR: {err}")))
                    .await?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::consts::{CMD_CHL, CMD_DISC};
    use crate::protocol::read_message;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{duplex, BufReader};

    const TTL: Duration = Duration::from_secs(60);
    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    struct RecordingTerminal {
        called: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Handler for RecordingTerminal {
        async fn call(
            &self,
            _ctx: &mut ReqContext,
            _io: &mut MessageWriter,
            _msg: &Message,
        ) -> Result<(), GateError> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn terminal() -> (Arc<dyn Handler>, Arc<AtomicBool>) {
        let called = Arc::new(AtomicBool::new(false));
        let handler: Arc<dyn Handler> = Arc::new(RecordingTerminal {
            called: called.clone(),
        });
        (handler, called)
    }

    fn challenge_for(peer: &str, difficulty: u32) -> HashcashHeader {
        HashcashHeader {
            version: HEADER_VERSION,
            difficulty,
            expires_at: Utc::now().timestamp() + 3600,
            subject: peer.to_string(),
            algorithm: ALGORITHM_SHA256.to_string(),
            nonce: pow::generate_nonce(),
            counter: 0,
        }
    }

    fn solve(mut header: HashcashHeader) -> String {
        for counter in 0.. {
            header.counter = counter;
            let candidate = header.to_string();
            if pow::verify(&candidate, header.difficulty) {
                return candidate;
            }
        }
        unreachable!()
    }

    async fn seeded_store(header: &HashcashHeader) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .put(&header.nonce, &header.to_string(), TTL)
            .await
            .unwrap();
        store
    }

    fn writer() -> MessageWriter {
        let (client, _server) = duplex(4096);
        MessageWriter::new(client, WRITE_TIMEOUT)
    }

    async fn run_verify(
        store: Arc<MemoryStore>,
        difficulty: u32,
        peer: &str,
        body: &str,
    ) -> (Result<(), GateError>, bool, bool) {
        let (next, called) = terminal();
        let mw = VerifyMiddleware::new(store, difficulty, TTL, next);
        let mut ctx = ReqContext::new(peer.to_string());
        let mut io = writer();
        let result = mw
            .call(&mut ctx, &mut io, &Message::with_body(CMD_RES, body))
            .await;
        (result, ctx.verified, called.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn issues_and_stores_challenge_on_req() {
        let store = Arc::new(MemoryStore::new());
        let (next, called) = terminal();
        let mw = ChallengeMiddleware::new(store.clone(), 20, TTL, next);

        let (client, server) = duplex(4096);
        let mut io = MessageWriter::new(client, WRITE_TIMEOUT);
        let mut ctx = ReqContext::new("127.0.0.1:55001".to_string());
        mw.call(&mut ctx, &mut io, &Message::new(CMD_REQ))
            .await
            .unwrap();

        let mut reader = BufReader::new(server);
        let reply = read_message(&mut reader).await.unwrap();
        assert_eq!(reply.command, CMD_CHL);

        let header: HashcashHeader = reply.body.parse().unwrap();
        assert_eq!(header.difficulty, 20);
        assert_eq!(header.subject, "127.0.0.1:55001");
        assert_eq!(header.algorithm, ALGORITHM_SHA256);
        assert_eq!(
            store.get(&header.nonce).await.unwrap().as_deref(),
            Some(reply.body.as_str())
        );
        // REQ is terminal for this path.
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn challenge_middleware_passes_other_commands_through() {
        let store = Arc::new(MemoryStore::new());
        let (next, called) = terminal();
        let mw = ChallengeMiddleware::new(store, 20, TTL, next);
        let mut ctx = ReqContext::new("127.0.0.1:55001".to_string());
        let mut io = writer();
        mw.call(&mut ctx, &mut io, &Message::new(CMD_DISC))
            .await
            .unwrap();
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn accepts_valid_solution() {
        let peer = "127.0.0.1:55001";
        let challenge = challenge_for(peer, 1);
        let store = seeded_store(&challenge).await;
        let solution = solve(challenge);

        let (result, verified, called) = run_verify(store, 1, peer, &solution).await;
        result.unwrap();
        assert!(verified);
        assert!(called);
    }

    #[tokio::test]
    async fn rejects_garbled_header() {
        let store = Arc::new(MemoryStore::new());
        let (result, verified, _) = run_verify(store, 1, "127.0.0.1:55001", "not-a-header").await;
        assert!(matches!(result.unwrap_err(), GateError::InvalidFormat));
        assert!(!verified);
    }

    #[tokio::test]
    async fn rejects_expired_before_touching_store() {
        let peer = "127.0.0.1:55001";
        let mut challenge = challenge_for(peer, 1);
        challenge.expires_at = Utc::now().timestamp() - 10;
        let store = seeded_store(&challenge).await;
        let solution = solve(challenge.clone());

        let (result, _, _) = run_verify(store.clone(), 1, peer, &solution).await;
        assert!(matches!(result.unwrap_err(), GateError::Expired));
        // The challenge was not consumed by the failed attempt.
        assert!(store.mark_spent(&challenge.nonce, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn rejects_foreign_subject() {
        let challenge = challenge_for("10.0.0.1:80", 1);
        let store = seeded_store(&challenge).await;
        let solution = solve(challenge);

        let (result, _, _) = run_verify(store, 1, "127.0.0.1:55001", &solution).await;
        assert!(matches!(result.unwrap_err(), GateError::SubjectMismatch));
    }

    #[tokio::test]
    async fn rejects_downgraded_difficulty() {
        let peer = "127.0.0.1:55001";
        let challenge = challenge_for(peer, 1);
        let store = seeded_store(&challenge).await;
        let solution = solve(challenge);

        // Server configured at 4; the client solved at 1.
        let (result, _, _) = run_verify(store, 4, peer, &solution).await;
        assert!(matches!(result.unwrap_err(), GateError::DifficultyMismatch));
    }

    #[tokio::test]
    async fn rejects_unknown_nonce() {
        let peer = "127.0.0.1:55001";
        let challenge = challenge_for(peer, 1);
        let store = Arc::new(MemoryStore::new());
        let solution = solve(challenge);

        let (result, _, _) = run_verify(store, 1, peer, &solution).await;
        assert!(matches!(result.unwrap_err(), GateError::UnknownChallenge));
    }

    #[tokio::test]
    async fn rejects_replayed_solution() {
        let peer = "127.0.0.1:55001";
        let challenge = challenge_for(peer, 1);
        let store = seeded_store(&challenge).await;
        store.mark_spent(&challenge.nonce, TTL).await.unwrap();
        let solution = solve(challenge);

        let (result, _, _) = run_verify(store, 1, peer, &solution).await;
        assert!(matches!(result.unwrap_err(), GateError::Replay));
    }

    #[tokio::test]
    async fn consumes_challenge_before_checking_work() {
        let peer = "127.0.0.1:55001";
        let challenge = challenge_for(peer, 64);
        let store = seeded_store(&challenge).await;
        // Any counter will miss a 64-nibble target.
        let mut attempt = challenge.clone();
        attempt.counter = 1;

        let (result, verified, called) =
            run_verify(store.clone(), 64, peer, &attempt.to_string()).await;
        assert!(matches!(result.unwrap_err(), GateError::InsufficientWork));
        assert!(!verified);
        assert!(!called);
        // The spent marker was taken even though verification failed.
        assert!(!store.mark_spent(&challenge.nonce, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn error_adapter_reports_and_reraises() {
        struct Failing;
        #[async_trait]
        impl Handler for Failing {
            async fn call(
                &self,
                _ctx: &mut ReqContext,
                _io: &mut MessageWriter,
                _msg: &Message,
            ) -> Result<(), GateError> {
                Err(GateError::RateLimited)
            }
        }

        let adapter = ErrorAdapter::new(Arc::new(Failing));
        let (client, server) = duplex(4096);
        let mut io = MessageWriter::new(client, WRITE_TIMEOUT);
        let mut ctx = ReqContext::new("127.0.0.1:55001".to_string());

        let result = adapter.call(&mut ctx, &mut io, &Message::new(CMD_REQ)).await;
        assert!(matches!(result.unwrap_err(), GateError::RateLimited));

        let mut reader = BufReader::new(server);
        let reply = read_message(&mut reader).await.unwrap();
        assert_eq!(reply.command, CMD_ERR);
        assert_eq!(reply.body, "ERROR: rate limit exceeded");
    }

    #[tokio::test]
    async fn internal_errors_cross_the_wire_without_detail() {
        struct Failing;
        #[async_trait]
        impl Handler for Failing {
            async fn call(
                &self,
                _ctx: &mut ReqContext,
                _io: &mut MessageWriter,
                _msg: &Message,
            ) -> Result<(), GateError> {
                Err(GateError::internal(anyhow::anyhow!(
                    "pg: connection refused on 10.1.2.3"
                )))
            }
        }

        let adapter = ErrorAdapter::new(Arc::new(Failing));
        let (client, server) = duplex(4096);
        let mut io = MessageWriter::new(client, WRITE_TIMEOUT);
        let mut ctx = ReqContext::new("127.0.0.1:55001".to_string());
        let _ = adapter.call(&mut ctx, &mut io, &Message::new(CMD_REQ)).await;

        let mut reader = BufReader::new(server);
        let reply = read_message(&mut reader).await.unwrap();
        assert_eq!(reply.body, "ERROR: internal error");
    }

    #[tokio::test]
    async fn rate_limit_keys_on_host_not_port() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(60)));
        let (next, _) = terminal();
        let mw = RateLimitMiddleware::new(limiter, next);
        let mut io = writer();

        let mut first = ReqContext::new("127.0.0.1:55001".to_string());
        mw.call(&mut first, &mut io, &Message::new(CMD_REQ))
            .await
            .unwrap();

        // Same host, new ephemeral port: still over budget.
        let mut second = ReqContext::new("127.0.0.1:55002".to_string());
        let err = mw
            .call(&mut second, &mut io, &Message::new(CMD_REQ))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::RateLimited));
    }
}
