//! Scripted in-memory node double for wallet and engine tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::{
    client::ClientResult,
    config::{
        Config, DeductionConfig, DeductionMode, FeeConfig, PolicyConfig, RpcConfig, Tier,
        VersionMode,
    },
    error::ClientError,
    traits::{ChainReader, RawTx, WalletRpc},
    types::{
        DecodedInput, DecodedOutput, DecodedScript, DecodedTransaction, GetInfo,
        ListTransactionsEntry, ListUnspentEntry, OutputList, PeerInfo, TransactionCategory,
        TxInput, ValidateAddress, WalletTransaction,
    },
};

/// Only attempts to start tracing once.
pub fn init_tracing() {
    use std::sync::Once;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}

/// A deterministic [`Config`] for tests: original defaults, but with
/// millisecond polling so retry windows run instantly.
pub fn mock_config() -> Config {
    Config {
        rpc: RpcConfig {
            host: "127.0.0.1".to_string(),
            port: 8332,
            user: String::new(),
            password: String::new(),
        },
        fixed_fee: dec!(0.01),
        deposit_extra: dec!(0.1),
        minconf: 1,
        minconf_step2: 6,
        minconf_shard: 0,
        required_conf: 6,
        poll_interval: Duration::from_millis(2),
        dust_floor: dec!(0.000055),
        fee: FeeConfig {
            base_p: dec!(0.003),
            shard_p: dec!(0.0008),
            hop_p: dec!(0.0005),
            min_p: dec!(0.0025),
            max_p: dec!(0.012),
            abs_fee_floor: dec!(0.001),
            tx_fee_per_tx: dec!(0.01),
            miner_fee_cap: dec!(1),
            min_relay_fee_floor: dec!(0.001),
        },
        tiers: vec![
            Tier {
                name: "standard".to_string(),
                shards: 3,
                hops: 1,
            },
            Tier {
                name: "enhanced".to_string(),
                shards: 5,
                hops: 2,
            },
            Tier {
                name: "strong".to_string(),
                shards: 8,
                hops: 3,
            },
        ],
        deduction: DeductionConfig {
            enabled: false,
            mode: DeductionMode::Deduct,
            percent: Decimal::ZERO,
            address: None,
        },
        primary_address: None,
        policy: PolicyConfig {
            version_mode: VersionMode::Postfork,
            allowed_versions: Default::default(),
            require_finality: true,
        },
        fee_address: None,
        wallet_passphrase: None,
        wallet_passphrase_timeout: 120,
    }
}

/// One spendable output held by the mock wallet.
#[derive(Clone, Debug)]
pub struct MockUtxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: Decimal,
    pub confirmations: i64,
}

#[derive(Clone, Debug)]
struct BuiltTx {
    inputs: Vec<TxInput>,
    outputs: Vec<(String, Decimal)>,
}

#[derive(Default)]
struct MockState {
    next_addr: u32,
    next_txid: u32,
    minted: u32,
    utxos: Vec<MockUtxo>,
    received: HashMap<String, Decimal>,
    history: Vec<ListTransactionsEntry>,
    raw_by_txid: HashMap<String, DecodedTransaction>,
    built: HashMap<String, BuiltTx>,
    tx_confs: HashMap<String, i64>,
    labels: HashMap<String, String>,
    invalid_addresses: HashSet<String>,
    block_height: u64,
    difficulty: f64,
    peers: usize,
    paytxfee: Option<Decimal>,
    unlocked_until: Option<i64>,
    rainbow_info: Option<String>,
    decode_override: Option<DecodedTransaction>,
    /// Fail this many upcoming broadcasts with an ancestor-limit error.
    broadcast_failures: u32,
    /// Confirmations stamped on outputs created by a broadcast.
    confirm_new_outputs: i64,
    /// Advance every transaction by one confirmation per wallet
    /// query, simulating block production during a poll loop.
    auto_mine: bool,
    broadcasts: Vec<String>,
}

/// A programmable stand-in for the node, shared by clones.
#[derive(Clone)]
pub struct MockNode {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

impl MockNode {
    pub fn new() -> Self {
        let node = Self {
            state: Arc::new(Mutex::new(MockState::default())),
        };
        node.state.lock().block_height = 400_000;
        node.state.lock().confirm_new_outputs = 6;
        node
    }

    pub fn add_utxo(&self, address: &str, amount: Decimal, confirmations: i64) -> String {
        let mut state = self.state.lock();
        state.next_txid += 1;
        let txid = format!("seed{:04}", state.next_txid);
        state.utxos.push(MockUtxo {
            txid: txid.clone(),
            vout: 0,
            address: address.to_string(),
            amount,
            confirmations,
        });
        state.tx_confs.insert(txid.clone(), confirmations);
        let entry = state.received.entry(address.to_string()).or_default();
        *entry += amount;
        txid
    }

    pub fn set_received(&self, address: &str, amount: Decimal) {
        self.state
            .lock()
            .received
            .insert(address.to_string(), amount);
    }

    pub fn set_block_height(&self, height: u64) {
        self.state.lock().block_height = height;
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.state.lock().difficulty = difficulty;
    }

    pub fn set_peers(&self, peers: usize) {
        self.state.lock().peers = peers;
    }

    pub fn set_paytxfee(&self, rate: Decimal) {
        self.state.lock().paytxfee = Some(rate);
    }

    pub fn set_unlocked_until(&self, until: Option<i64>) {
        self.state.lock().unlocked_until = until;
    }

    pub fn set_rainbow_info(&self, info: &str) {
        self.state.lock().rainbow_info = Some(info.to_string());
    }

    pub fn set_decode_override(&self, decoded: DecodedTransaction) {
        self.state.lock().decode_override = Some(decoded);
    }

    pub fn fail_next_broadcasts(&self, count: u32) {
        self.state.lock().broadcast_failures = count;
    }

    pub fn set_confirm_new_outputs(&self, confirmations: i64) {
        self.state.lock().confirm_new_outputs = confirmations;
    }

    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().auto_mine = auto_mine;
    }

    pub fn invalidate_address(&self, address: &str) {
        self.state.lock().invalid_addresses.insert(address.to_string());
    }

    pub fn push_history(&self, entry: ListTransactionsEntry) {
        self.state.lock().history.push(entry);
    }

    pub fn insert_raw_transaction(&self, txid: &str, decoded: DecodedTransaction) {
        self.state
            .lock()
            .raw_by_txid
            .insert(txid.to_string(), decoded);
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.state.lock().broadcasts.clone()
    }

    pub fn minted_count(&self) -> u32 {
        self.state.lock().minted
    }

    pub fn label_of(&self, address: &str) -> Option<String> {
        self.state.lock().labels.get(address).cloned()
    }

    pub fn utxos_at(&self, address: &str) -> Vec<MockUtxo> {
        self.state
            .lock()
            .utxos
            .iter()
            .filter(|u| u.address == address)
            .cloned()
            .collect()
    }

    /// A `listtransactions`-style send entry, for recovery tests.
    pub fn send_entry(address: &str, txid: &str, amount: Decimal) -> ListTransactionsEntry {
        ListTransactionsEntry {
            account: Some("*".to_string()),
            address: Some(address.to_string()),
            category: TransactionCategory::Send,
            amount: -amount,
            confirmations: Some(1),
            txid: Some(txid.to_string()),
            time: Some(0),
        }
    }

    fn bump_if_configured(state: &mut MockState) {
        if state.auto_mine {
            for utxo in &mut state.utxos {
                utxo.confirmations += 1;
            }
            for conf in state.tx_confs.values_mut() {
                *conf += 1;
            }
        }
    }

    fn entry_from(utxo: &MockUtxo) -> ListUnspentEntry {
        ListUnspentEntry {
            txid: utxo.txid.clone(),
            vout: utxo.vout,
            address: Some(utxo.address.clone()),
            account: None,
            script_pub_key: Some("76a914".to_string()),
            amount: utxo.amount,
            confirmations: utxo.confirmations,
            spendable: Some(true),
        }
    }
}

impl ChainReader for MockNode {
    async fn get_block_count(&self) -> ClientResult<u64> {
        Ok(self.state.lock().block_height)
    }

    async fn get_difficulty(&self) -> ClientResult<f64> {
        Ok(self.state.lock().difficulty)
    }

    async fn get_peer_info(&self) -> ClientResult<Vec<PeerInfo>> {
        let peers = self.state.lock().peers;
        Ok(vec![
            PeerInfo {
                addr: Some("127.0.0.1:9333".to_string()),
                subver: None,
            };
            peers
        ])
    }

    async fn get_info(&self) -> ClientResult<GetInfo> {
        let state = self.state.lock();
        Ok(GetInfo {
            balance: None,
            blocks: state.block_height,
            connections: Some(state.peers as u32),
            difficulty: Some(state.difficulty),
            paytxfee: state.paytxfee,
            unlocked_until: state.unlocked_until,
        })
    }

    async fn get_rainbow_info(&self) -> ClientResult<String> {
        self.state
            .lock()
            .rainbow_info
            .clone()
            .ok_or_else(|| ClientError::Other("no rainbow info".to_string()))
    }
}

impl WalletRpc for MockNode {
    async fn get_new_address(&self, _scheme: u32) -> ClientResult<String> {
        let mut state = self.state.lock();
        state.next_addr += 1;
        state.minted += 1;
        Ok(format!("8Pmock{:04}", state.next_addr))
    }

    async fn set_account(&self, address: &str, label: &str) -> ClientResult<()> {
        self.state
            .lock()
            .labels
            .insert(address.to_string(), label.to_string());
        Ok(())
    }

    async fn validate_address(&self, address: &str) -> ClientResult<ValidateAddress> {
        let state = self.state.lock();
        Ok(ValidateAddress {
            is_valid: !state.invalid_addresses.contains(address),
            address: Some(address.to_string()),
            is_mine: Some(true),
        })
    }

    async fn list_unspent(&self, min_conf: u32) -> ClientResult<Vec<ListUnspentEntry>> {
        let mut state = self.state.lock();
        Self::bump_if_configured(&mut state);
        Ok(state
            .utxos
            .iter()
            .filter(|u| u.confirmations >= min_conf as i64)
            .map(Self::entry_from)
            .collect())
    }

    async fn list_unspent_for(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: &[String],
    ) -> ClientResult<Vec<ListUnspentEntry>> {
        let mut state = self.state.lock();
        Self::bump_if_configured(&mut state);
        Ok(state
            .utxos
            .iter()
            .filter(|u| {
                addresses.iter().any(|a| *a == u.address)
                    && u.confirmations >= min_conf as i64
                    && u.confirmations <= max_conf as i64
            })
            .map(Self::entry_from)
            .collect())
    }

    async fn list_transactions(&self, count: usize) -> ClientResult<Vec<ListTransactionsEntry>> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(count);
        Ok(state.history[skip..].to_vec())
    }

    async fn get_transaction(&self, txid: &str) -> ClientResult<WalletTransaction> {
        let mut state = self.state.lock();
        Self::bump_if_configured(&mut state);
        let confirmations = *state
            .tx_confs
            .get(txid)
            .ok_or_else(|| ClientError::Server(-5, "Invalid or non-wallet transaction id".to_string()))?;
        Ok(WalletTransaction {
            amount: None,
            confirmations,
            blockhash: None,
            txid: txid.to_string(),
            time: Some(0),
            details: Vec::new(),
            hex: None,
        })
    }

    async fn get_received_by_address(
        &self,
        address: &str,
        _min_conf: u32,
    ) -> ClientResult<Decimal> {
        Ok(self
            .state
            .lock()
            .received
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn wallet_passphrase(&self, _passphrase: &str, timeout: u64) -> ClientResult<()> {
        self.state.lock().unlocked_until = Some(timeout as i64);
        Ok(())
    }
}

impl RawTx for MockNode {
    async fn create_raw_transaction(
        &self,
        inputs: &[TxInput],
        outputs: &OutputList,
    ) -> ClientResult<String> {
        let mut state = self.state.lock();
        state.next_txid += 1;
        let hex = format!("raw{:04}", state.next_txid);
        state.built.insert(
            hex.clone(),
            BuiltTx {
                inputs: inputs.to_vec(),
                outputs: outputs.iter().map(|(a, v)| (a.to_string(), v)).collect(),
            },
        );
        Ok(hex)
    }

    async fn sign_raw_transaction(&self, hex: &str) -> ClientResult<String> {
        // Signing is the node's problem; the mock passes the hex through.
        Ok(hex.to_string())
    }

    async fn send_raw_transaction(&self, hex: &str) -> ClientResult<String> {
        let mut state = self.state.lock();
        if state.broadcast_failures > 0 {
            state.broadcast_failures -= 1;
            return Err(ClientError::Server(
                -26,
                "too many unconfirmed ancestors".to_string(),
            ));
        }
        let built = state
            .built
            .get(hex)
            .cloned()
            .ok_or_else(|| ClientError::Other(format!("unknown raw tx {hex}")))?;

        state.next_txid += 1;
        let txid = format!("tx{:04}", state.next_txid);

        state
            .utxos
            .retain(|u| !built.inputs.iter().any(|i| i.txid == u.txid && i.vout == u.vout));
        let confirmations = state.confirm_new_outputs;
        for (n, (address, amount)) in built.outputs.iter().enumerate() {
            state.utxos.push(MockUtxo {
                txid: txid.clone(),
                vout: n as u32,
                address: address.clone(),
                amount: *amount,
                confirmations,
            });
            let entry = state.received.entry(address.clone()).or_default();
            *entry += *amount;
            let send = ListTransactionsEntry {
                account: Some("*".to_string()),
                address: Some(address.clone()),
                category: TransactionCategory::Send,
                amount: -*amount,
                confirmations: Some(confirmations),
                txid: Some(txid.clone()),
                time: Some(0),
            };
            state.history.push(send);
        }
        state.tx_confs.insert(txid.clone(), confirmations);
        state.broadcasts.push(txid.clone());
        Ok(txid)
    }

    async fn decode_raw_transaction(&self, hex: &str) -> ClientResult<DecodedTransaction> {
        let state = self.state.lock();
        if let Some(decoded) = &state.decode_override {
            return Ok(decoded.clone());
        }
        let built = state
            .built
            .get(hex)
            .ok_or_else(|| ClientError::Other(format!("cannot decode {hex}")))?;
        Ok(DecodedTransaction {
            txid: None,
            version: 101,
            locktime: 0,
            vin: built
                .inputs
                .iter()
                .map(|i| DecodedInput {
                    txid: Some(i.txid.clone()),
                    vout: Some(i.vout),
                    sequence: 0xffff_ffff,
                })
                .collect(),
            vout: built
                .outputs
                .iter()
                .enumerate()
                .map(|(n, (address, amount))| DecodedOutput {
                    value: *amount,
                    n: n as u32,
                    script_pub_key: DecodedScript {
                        script_type: Some("pubkeyhash".to_string()),
                        addresses: Some(vec![address.clone()]),
                        ..DecodedScript::default()
                    },
                })
                .collect(),
            confirmations: None,
            blockhash: None,
        })
    }

    async fn get_raw_transaction(&self, txid: &str) -> ClientResult<DecodedTransaction> {
        self.state
            .lock()
            .raw_by_txid
            .get(txid)
            .cloned()
            .ok_or_else(|| ClientError::Server(-5, "No information available".to_string()))
    }
}
