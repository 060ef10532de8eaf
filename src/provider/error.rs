//! Tipos de erro para a API HTTP do provedor de WhatsApp.
//!
//! Define [`ProviderError`] com variantes para rate limiting, erros da API,
//! erros de rede e respostas que não puderam ser interpretadas.

use thiserror::Error;

/// Erros ao interagir com os endpoints de envio ou de verificação.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// O servidor retornou HTTP 429 (rate limit).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro status HTTP de falha, com o corpo da resposta como mensagem.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha na camada de rede (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// O provedor respondeu algo que não conseguimos interpretar.
    #[error("unexpected response: {0}")]
    Decode(String),
}
