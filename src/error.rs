use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error object returned by the ABCMint RPC server inside a JSON-RPC
/// response envelope.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Error)]
#[error("RPC server returned error {code}: {message}")]
pub struct RpcServerError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// The errors that can be produced by the JSON-RPC [`Client`](crate::client::Client).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid or unserialisable request parameter.
    #[error("missing or invalid parameter: {0}")]
    Param(String),

    /// The server processed the request and returned an error object.
    #[error("server returned error {0}: {1}")]
    Server(i32, String),

    /// Non-success HTTP status from the RPC endpoint.
    #[error("HTTP status {0}: {1}")]
    Status(u16, String),

    /// The response body could not be parsed.
    #[error("could not parse response: {0}")]
    Parse(String),

    /// The response was empty where a result was expected.
    #[error("empty response received")]
    Empty,

    /// Failed to establish a connection to the node.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The request failed in transit (e.g. the node closed the
    /// connection mid-response).
    #[error("request error: {0}")]
    Request(String),

    /// Gave up after exhausting the retry budget.
    #[error("gave up after {0} retries")]
    MaxRetriesExceeded(u8),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Whether the error is connection-class and therefore worth a
    /// retry against a rebuilt transport. Logical errors (server,
    /// status, parse) are never retried.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::Timeout | ClientError::Request(_)
        )
    }
}

/// Pre-broadcast transaction-policy rejections. Any of these means
/// the transaction was never sent to the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The transaction could not be decoded by the node.
    #[error("transaction decode failed")]
    Undecodable,

    /// Transaction version not allowed by the active version mode.
    #[error("transaction version {found} not allowed (mode {mode}, post-fork {postfork})")]
    Version {
        found: i64,
        mode: &'static str,
        postfork: bool,
    },

    /// Non-final input sequence or non-zero locktime while finality
    /// is required.
    #[error("non-final transaction rejected (locktime {locktime}, min sequence {min_sequence:#x})")]
    NonFinal { locktime: u64, min_sequence: u64 },

    /// Nonstandard or witness output script.
    #[error("nonstandard output script rejected: {0}")]
    Script(String),

    /// Multisig output with reqSigs outside 1..=3.
    #[error("multisig reqSigs {0} out of range")]
    MultisigReqSigs(i64),
}

/// Errors surfaced by the mixing engine and the wallet facade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// No spendable UTXOs at the addresses a step needs to spend from.
    #[error("no spendable UTXOs at {0}")]
    NoUtxos(String),

    /// Coin selection could not cover the required total.
    #[error("insufficient funds: have {available}, need {required}")]
    InsufficientFunds {
        available: Decimal,
        required: Decimal,
    },

    /// The node rejected a policy-clean transaction.
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// Broadcast kept failing after the unconfirmed-chain retry window.
    #[error("broadcast failed (minconf={minconf}, inputs={inputs}, outputs={outputs}): {reason}")]
    BroadcastFailed {
        minconf: u32,
        inputs: usize,
        outputs: usize,
        reason: String,
    },

    /// An address failed node-side validation.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The referenced job does not exist.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// State file could not be read or written.
    #[error("state persistence failed: {0}")]
    Store(#[from] std::io::Error),

    /// State file exists but does not deserialize.
    #[error("state file corrupt: {0}")]
    CorruptState(#[from] serde_json::Error),
}

/// Request-level errors for the API adapter. `BadRequest` and
/// `NotFound` map to 4xx and never mutate job state.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("job not found")]
    NotFound,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    /// The HTTP status an embedding server should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::NotFound => 404,
            ApiError::Engine(_) => 500,
        }
    }
}
