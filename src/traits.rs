use std::future::Future;

use rust_decimal::Decimal;

use crate::{
    client::ClientResult,
    types::{
        DecodedTransaction, GetInfo, ListTransactionsEntry, ListUnspentEntry, OutputList,
        PeerInfo, TxInput, ValidateAddress, WalletTransaction,
    },
};

/// Chain-level read access any ABCMint node client should provide.
///
/// # Note
///
/// This is a fully `async` trait. The user should be responsible for
/// handling the `async` nature of the trait methods. And if implementing
/// this trait for a specific type that is not `async`, the user should
/// consider wrapping with [`tokio`](https://tokio.rs)'s
/// [`spawn_blocking`](https://docs.rs/tokio/latest/tokio/task/fn.spawn_blocking.html)
/// or any other method.
pub trait ChainReader {
    /// Gets the height of the most-work fully-validated chain.
    fn get_block_count(&self) -> impl Future<Output = ClientResult<u64>> + Send;

    /// Gets the current proof-of-work difficulty.
    fn get_difficulty(&self) -> impl Future<Output = ClientResult<f64>> + Send;

    /// Gets per-peer connection details.
    fn get_peer_info(&self) -> impl Future<Output = ClientResult<Vec<PeerInfo>>> + Send;

    /// Gets the legacy `getinfo` blob (height, paytxfee hint, wallet
    /// lock state).
    fn get_info(&self) -> impl Future<Output = ClientResult<GetInfo>> + Send;

    /// Gets the node's human-readable Rainbow fork summary, the
    /// source of the post-fork transaction-version hint.
    fn get_rainbow_info(&self) -> impl Future<Output = ClientResult<String>> + Send;
}

/// Wallet functionality the mixing engine needs from the node. All
/// key material stays node-side; this surface never sees a private
/// key.
pub trait WalletRpc {
    /// Generates a new address under the wallet's control.
    ///
    /// # Parameters
    ///
    /// - `scheme`: the ABCMint Rainbow key-configuration parameter
    ///   (`274` for current mainnet keys).
    fn get_new_address(&self, scheme: u32) -> impl Future<Output = ClientResult<String>> + Send;

    /// Labels an address within the wallet. Purely cosmetic.
    fn set_account(
        &self,
        address: &str,
        label: &str,
    ) -> impl Future<Output = ClientResult<()>> + Send;

    /// Checks an address for well-formedness and ownership.
    fn validate_address(
        &self,
        address: &str,
    ) -> impl Future<Output = ClientResult<ValidateAddress>> + Send;

    /// Lists the wallet's unspent outputs at the given minimum
    /// confirmation count.
    fn list_unspent(
        &self,
        min_conf: u32,
    ) -> impl Future<Output = ClientResult<Vec<ListUnspentEntry>>> + Send;

    /// Lists unspent outputs held by specific addresses.
    fn list_unspent_for(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> impl Future<Output = ClientResult<Vec<ListUnspentEntry>>> + Send;

    /// Lists the wallet's most recent transactions (account `"*"`).
    fn list_transactions(
        &self,
        count: usize,
    ) -> impl Future<Output = ClientResult<Vec<ListTransactionsEntry>>> + Send;

    /// Gets the wallet's view of one of its own transactions,
    /// including the confirmation count.
    fn get_transaction(
        &self,
        txid: &str,
    ) -> impl Future<Output = ClientResult<WalletTransaction>> + Send;

    /// Cumulative amount ever received by an address.
    fn get_received_by_address(
        &self,
        address: &str,
        min_conf: u32,
    ) -> impl Future<Output = ClientResult<Decimal>> + Send;

    /// Unlocks the wallet for `timeout` seconds.
    fn wallet_passphrase(
        &self,
        passphrase: &str,
        timeout: u64,
    ) -> impl Future<Output = ClientResult<()>> + Send;
}

/// Raw-transaction plumbing: build, sign, inspect and broadcast.
/// Signing is delegated to the node wallet; transaction bytes only
/// ever travel as hex strings.
pub trait RawTx {
    /// Builds an unsigned raw transaction from explicit inputs and
    /// an address → amount output map.
    ///
    /// # Note
    ///
    /// Amounts must be serialized as decimal strings; the node's
    /// JSON parser accepts them and floats would lose precision.
    fn create_raw_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &OutputList,
    ) -> impl Future<Output = ClientResult<String>> + Send;

    /// Signs a raw transaction with the node wallet's keys.
    fn sign_raw_transaction(&self, hex: &str)
        -> impl Future<Output = ClientResult<String>> + Send;

    /// Broadcasts a signed raw transaction, returning its txid.
    fn send_raw_transaction(&self, hex: &str)
        -> impl Future<Output = ClientResult<String>> + Send;

    /// Decodes a raw transaction without touching the network.
    fn decode_raw_transaction(
        &self,
        hex: &str,
    ) -> impl Future<Output = ClientResult<DecodedTransaction>> + Send;

    /// Gets a decoded transaction by txid (verbosity 1), wallet or
    /// chain scope.
    fn get_raw_transaction(
        &self,
        txid: &str,
    ) -> impl Future<Output = ClientResult<DecodedTransaction>> + Send;
}

/// Everything the wallet facade and engine require from a node
/// connection.
pub trait NodeClient: ChainReader + WalletRpc + RawTx + Send + Sync {}

impl<T> NodeClient for T where T: ChainReader + WalletRpc + RawTx + Send + Sync {}
