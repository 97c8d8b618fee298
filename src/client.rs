use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::{engine::general_purpose, Engine};
use parking_lot::RwLock;
use reqwest::{
    header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE},
    Client as ReqwestClient,
};
use rust_decimal::Decimal;
use serde::{de, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::*;

use crate::{
    error::{ClientError, RpcServerError},
    traits::{ChainReader, RawTx, WalletRpc},
    types::{
        Coins, DecodedTransaction, GetInfo, ListTransactionsEntry, ListUnspentEntry, OutputList,
        PeerInfo, SignRawReply, TxInput, ValidateAddress, WalletTransaction,
    },
};

/// This is an alias for the result type returned by the [`Client`].
pub type ClientResult<T> = Result<T, ClientError>;

/// The maximum number of retries for a connection-class failure.
const DEFAULT_MAX_RETRIES: u8 = 3;

/// Backoff before the first retry; doubles per attempt (1s, 2s, 4s).
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

/// The `maxconf` value the node treats as "unbounded".
pub const MAX_CONFIRMATIONS: u32 = 9_999_999;

/// Custom implementation to convert a value to a `Value` type.
pub fn to_value<T>(value: T) -> ClientResult<Value>
where
    T: Serialize,
{
    serde_json::to_value(value)
        .map_err(|e| ClientError::Param(format!("Error creating value: {e}")))
}

/// The different authentication methods for the client.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Auth {
    None,
    UserPass(String, String),
}

/// An `async` client for interacting with an ABCMint node.
///
/// The transport is rebuilt between retry attempts so a node restart
/// does not leave the client stuck on a dead keep-alive connection.
#[derive(Debug, Clone)]
pub struct Client {
    /// The URL of the node's RPC endpoint.
    url: String,

    /// The underlying `async` HTTP client, swappable on reconnect.
    http: Arc<RwLock<ReqwestClient>>,

    /// Default headers (content type + basic auth) used to rebuild
    /// the transport.
    headers: HeaderMap,

    /// The ID of the current request.
    ///
    /// # Implementation Details
    ///
    /// Using an [`Arc`] so that [`Client`] is [`Clone`].
    id: Arc<AtomicUsize>,

    /// The maximum number of retries for a request.
    max_retries: u8,

    /// Base interval between retries in ms; doubled per attempt.
    retry_base: u64,
}

/// Response returned by the node's RPC server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Response<R> {
    pub result: Option<R>,
    pub error: Option<RpcServerError>,
    pub id: Option<u64>,
}

fn build_http(headers: &HeaderMap) -> ClientResult<ReqwestClient> {
    ReqwestClient::builder()
        .default_headers(headers.clone())
        .build()
        .map_err(|e| ClientError::Other(format!("Could not create client: {e}")))
}

/// Maps a `reqwest` send failure onto the error taxonomy. Only
/// connection-class failures come back retryable.
fn classify_send_error(err: reqwest::Error) -> ClientError {
    warn!(%err, "Error calling ABCMint RPC");
    if err.is_body() || err.is_decode() {
        ClientError::Parse(err.to_string())
    } else if err.is_status() {
        match err.status() {
            Some(code) => ClientError::Status(code.as_u16(), err.to_string()),
            _ => ClientError::Other(err.to_string()),
        }
    } else if err.is_connect() {
        ClientError::Connection(err.to_string())
    } else if err.is_timeout() {
        ClientError::Timeout
    } else if err.is_request() {
        // The node closed the connection mid-flight; worth a retry
        // against a fresh transport.
        ClientError::Request(err.to_string())
    } else {
        ClientError::Other(err.to_string())
    }
}

impl Client {
    /// Creates a new [`Client`] with the given URL and credentials.
    pub fn new(
        url: String,
        auth: Auth,
        max_retries: Option<u8>,
        retry_base: Option<u64>,
    ) -> ClientResult<Self> {
        let content_type = "application/json"
            .parse()
            .map_err(|_| ClientError::Other("Error parsing header".to_string()))?;
        let mut headers = HeaderMap::from_iter([(CONTENT_TYPE, content_type)]);

        if let Auth::UserPass(username, password) = &auth {
            let user_pw = general_purpose::STANDARD.encode(format!("{username}:{password}"));
            let authorization = format!("Basic {user_pw}")
                .parse()
                .map_err(|_| ClientError::Other("Error parsing header".to_string()))?;
            headers.insert(AUTHORIZATION, authorization);
        }

        let http = Arc::new(RwLock::new(build_http(&headers)?));

        trace!(url = %url, "Created ABCMint RPC client");

        Ok(Self {
            url,
            http,
            headers,
            id: Arc::new(AtomicUsize::new(0)),
            max_retries: max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            retry_base: retry_base.unwrap_or(DEFAULT_RETRY_BASE_MS),
        })
    }

    fn next_id(&self) -> usize {
        self.id.fetch_add(1, Ordering::AcqRel)
    }

    /// Drops the pooled connections and starts from a fresh
    /// transport. Called between retries of connection-class
    /// failures.
    fn rebuild_transport(&self) {
        match build_http(&self.headers) {
            Ok(fresh) => *self.http.write() = fresh,
            Err(err) => warn!(%err, "could not rebuild transport, keeping the old one"),
        }
    }

    async fn call<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ClientResult<T> {
        self.call_inner(method, params)
            .await?
            .ok_or(ClientError::Empty)
    }

    /// Variant of [`Self::call`] for methods that reply with `null`
    /// (`setaccount`, `walletpassphrase`).
    async fn call_void(&self, method: &str, params: &[Value]) -> ClientResult<()> {
        self.call_inner::<Value>(method, params).await.map(|_| ())
    }

    async fn call_inner<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ClientResult<Option<T>> {
        let mut retries: u8 = 0;
        let mut delay = self.retry_base;
        loop {
            trace!(%method, ?params, %retries, "Calling ABCMint RPC");

            match self.attempt::<T>(method, params).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_connection() => {
                    retries += 1;
                    if retries > self.max_retries {
                        return Err(ClientError::MaxRetriesExceeded(self.max_retries));
                    }
                    warn!(%err, %retries, delay_ms = %delay, "connection error, retrying");
                    self.rebuild_transport();
                    sleep(Duration::from_millis(delay)).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt<T: de::DeserializeOwned + fmt::Debug>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ClientResult<Option<T>> {
        let id = self.next_id();
        let http = self.http.read().clone();
        let response = http
            .post(&self.url)
            .json(&json!({
                "jsonrpc": "1.0",
                "id": id,
                "method": method,
                "params": params
            }))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        // A drop while the body streams surfaces here; connection
        // class, so the retry loop gets it.
        let raw = response
            .text()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        trace!(%raw, "Raw response received");

        // Legacy nodes answer logical RPC failures with HTTP 500
        // plus a JSON error body; the body wins over the status line
        // whenever it parses.
        if let Ok(data) = serde_json::from_str::<Response<T>>(&raw) {
            if let Some(err) = data.error {
                return Err(ClientError::Server(err.code, err.message));
            }
            return Ok(data.result);
        }
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
            return Err(ClientError::Status(status.as_u16(), reason));
        }
        Err(ClientError::Parse(format!(
            "unparseable RPC response for {method}"
        )))
    }
}

impl ChainReader for Client {
    async fn get_block_count(&self) -> ClientResult<u64> {
        self.call::<u64>("getblockcount", &[]).await
    }

    async fn get_difficulty(&self) -> ClientResult<f64> {
        self.call::<f64>("getdifficulty", &[]).await
    }

    async fn get_peer_info(&self) -> ClientResult<Vec<PeerInfo>> {
        self.call::<Vec<PeerInfo>>("getpeerinfo", &[]).await
    }

    async fn get_info(&self) -> ClientResult<GetInfo> {
        self.call::<GetInfo>("getinfo", &[]).await
    }

    async fn get_rainbow_info(&self) -> ClientResult<String> {
        self.call::<String>("getrainbowproinfo", &[]).await
    }
}

impl WalletRpc for Client {
    async fn get_new_address(&self, scheme: u32) -> ClientResult<String> {
        self.call::<String>("getnewaddress", &[to_value(scheme)?])
            .await
    }

    async fn set_account(&self, address: &str, label: &str) -> ClientResult<()> {
        self.call_void("setaccount", &[to_value(address)?, to_value(label)?])
            .await
    }

    async fn validate_address(&self, address: &str) -> ClientResult<ValidateAddress> {
        self.call::<ValidateAddress>("validateaddress", &[to_value(address)?])
            .await
    }

    async fn list_unspent(&self, min_conf: u32) -> ClientResult<Vec<ListUnspentEntry>> {
        self.call::<Vec<ListUnspentEntry>>("listunspent", &[to_value(min_conf)?])
            .await
    }

    async fn list_unspent_for(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> ClientResult<Vec<ListUnspentEntry>> {
        self.call::<Vec<ListUnspentEntry>>(
            "listunspent",
            &[
                to_value(min_conf)?,
                to_value(max_conf)?,
                to_value(addresses)?,
            ],
        )
        .await
    }

    async fn list_transactions(&self, count: usize) -> ClientResult<Vec<ListTransactionsEntry>> {
        self.call::<Vec<ListTransactionsEntry>>(
            "listtransactions",
            &[to_value("*")?, to_value(count)?],
        )
        .await
    }

    async fn get_transaction(&self, txid: &str) -> ClientResult<WalletTransaction> {
        self.call::<WalletTransaction>("gettransaction", &[to_value(txid)?])
            .await
    }

    async fn get_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> ClientResult<Decimal> {
        let coins = self
            .call::<Coins>(
                "getreceivedbyaddress",
                &[to_value(address)?, to_value(min_conf)?],
            )
            .await?;
        Ok(coins.0)
    }

    async fn wallet_passphrase(&self, passphrase: &str, timeout: u64) -> ClientResult<()> {
        self.call_void(
            "walletpassphrase",
            &[to_value(passphrase)?, to_value(timeout)?],
        )
        .await
    }
}

impl RawTx for Client {
    async fn create_raw_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &OutputList,
    ) -> ClientResult<String> {
        let raw = self
            .call::<String>(
                "createrawtransaction",
                &[to_value(inputs)?, to_value(outputs)?],
            )
            .await?;
        trace!(%raw, "Created raw transaction");
        Ok(raw)
    }

    async fn sign_raw_transaction(&self, hex: &str) -> ClientResult<String> {
        let reply = self
            .call::<SignRawReply>("signrawtransaction", &[to_value(hex)?])
            .await?;
        Ok(reply.into_hex())
    }

    async fn send_raw_transaction(&self, hex: &str) -> ClientResult<String> {
        trace!(%hex, "Sending raw transaction");
        self.call::<String>("sendrawtransaction", &[to_value(hex)?])
            .await
    }

    async fn decode_raw_transaction(&self, hex: &str) -> ClientResult<DecodedTransaction> {
        self.call::<DecodedTransaction>("decoderawtransaction", &[to_value(hex)?])
            .await
    }

    async fn get_raw_transaction(&self, txid: &str) -> ClientResult<DecodedTransaction> {
        self.call::<DecodedTransaction>("getrawtransaction", &[to_value(txid)?, to_value(1)?])
            .await
    }
}
