//! Fixed in-process corpus, used by tests and demos.

use async_trait::async_trait;
use rand::Rng;

use super::{Quote, QuoteSource};
use crate::error::GateError;

pub struct StaticQuotes {
    quotes: Vec<Quote>,
}

impl StaticQuotes {
    pub fn new(quotes: Vec<Quote>) -> Self {
        Self { quotes }
    }

    pub fn single(text: &str, author: &str) -> Self {
        Self::new(vec![Quote {
            text: text.to_string(),
            author: author.to_string(),
        }])
    }
}

#[async_trait]
impl QuoteSource for StaticQuotes {
    async fn random(&self) -> Result<Quote, GateError> {
        if self.quotes.is_empty() {
            return Err(GateError::internal(anyhow::anyhow!("empty quote corpus")));
        }
        let idx = rand::thread_rng().gen_range(0..self.quotes.len());
        Ok(self.quotes[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_from_the_corpus() {
        let source = StaticQuotes::single("Know thyself", "Thales");
        let quote = source.random().await.unwrap();
        assert_eq!(quote.text, "Know thyself");
        assert_eq!(quote.author, "Thales");
    }

    #[tokio::test]
    async fn empty_corpus_is_an_internal_error() {
        let source = StaticQuotes::new(Vec::new());
        let err = source.random().await.unwrap_err();
        assert!(matches!(err, GateError::Internal(_)));
    }
}
