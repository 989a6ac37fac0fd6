//! The quote corpus behind the gate: one method, one random row.

use async_trait::async_trait;

use crate::error::GateError;

mod memory;
mod postgres;

pub use memory::StaticQuotes;
pub use postgres::PgQuotes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub text: String,
    pub author: String,
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn random(&self) -> Result<Quote, GateError>;
}
