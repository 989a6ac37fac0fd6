//! Command dispatch and the terminal handlers behind the middleware
//! chain. REQ is answered inside the chain by the challenge issuer, so
//! its terminal is a no-op.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GateError;
use crate::protocol::consts::{CMD_DISC, CMD_QOT, CMD_REQ, CMD_RES};
use crate::protocol::Message;
use crate::quotes::QuoteSource;
use crate::server::middleware::{Handler, MessageWriter, ReqContext};

pub struct Router {
    req: Arc<dyn Handler>,
    res: Arc<dyn Handler>,
    disc: Arc<dyn Handler>,
    unknown: Arc<dyn Handler>,
}

impl Router {
    pub fn new(
        req: Arc<dyn Handler>,
        res: Arc<dyn Handler>,
        disc: Arc<dyn Handler>,
        unknown: Arc<dyn Handler>,
    ) -> Self {
        Self {
            req,
            res,
            disc,
            unknown,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        let handler = match msg.command.as_str() {
            CMD_REQ => &self.req,
            CMD_RES => &self.res,
            CMD_DISC => &self.disc,
            _ => &self.unknown,
        };
        handler.call(ctx, io, msg).await
    }
}

pub struct NoopTerminal;

#[async_trait]
impl Handler for NoopTerminal {
    async fn call(
        &self,
        _ctx: &mut ReqContext,
        _io: &mut MessageWriter,
        _msg: &Message,
    ) -> Result<(), GateError> {
        Ok(())
    }
}

/// Delivers the quote once the verifier has marked the message verified.
/// The flag check is defense in depth; dispatch already routes RES through
/// the verifier.
pub struct QuoteTerminal {
    quotes: Arc<dyn QuoteSource>,
}

impl QuoteTerminal {
    pub fn new(quotes: Arc<dyn QuoteSource>) -> Self {
        Self { quotes }
    }
}

#[async_trait]
impl Handler for QuoteTerminal {
    async fn call(
        &self,
        ctx: &mut ReqContext,
        io: &mut MessageWriter,
        _msg: &Message,
    ) -> Result<(), GateError> {
        if !ctx.verified {
            return Err(GateError::internal(anyhow::anyhow!(
                "quote requested without verification"
            )));
        }

        let quote = self.quotes.random().await?;
        io.send(&Message::with_body(
            CMD_QOT,
            format!("{} — {}", quote.text, quote.author),
        ))
        .await
    }
}

/// Acknowledges DISC with an empty-body echo.
pub struct DisconnectTerminal;

#[async_trait]
impl Handler for DisconnectTerminal {
    async fn call(
        &self,
        _ctx: &mut ReqContext,
        io: &mut MessageWriter,
        _msg: &Message,
    ) -> Result<(), GateError> {
        io.send(&Message::new(CMD_DISC)).await
    }
}

pub struct UnknownTerminal;

#[async_trait]
impl Handler for UnknownTerminal {
    async fn call(
        &self,
        _ctx: &mut ReqContext,
        _io: &mut MessageWriter,
        msg: &Message,
    ) -> Result<(), GateError> {
        Err(GateError::UnknownCommand(msg.command.clone()))
    }
}
