use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::*;

use crate::{
    config::{Config, DeductionMode, VersionMode},
    error::{EngineError, PolicyError},
    traits::NodeClient,
    types::{
        DecodedTransaction, ListTransactionsEntry, ListUnspentEntry, OutputList, TxInput,
        WalletTransaction,
    },
};

/// The ABCMint Rainbow key-configuration parameter passed to
/// `getnewaddress` for current mainnet keys.
const DEFAULT_ADDRESS_SCHEME: u32 = 274;

/// Mainnet Rainbow fork height, used when the node hint is absent.
const RAINBOW_FORK_HEIGHT: u64 = 267_120;

/// Blocks past the fork before post-fork rules are enforced.
const FORK_GRACE: u64 = 20;

/// Post-fork transaction version when the node offers no hint.
const POSTFORK_TX_VERSION: i64 = 101;

/// Pool refill batch; amortises `getnewaddress` round-trips.
const POOL_BATCH: usize = 16;

const NON_FINAL_SEQUENCE_FLOOR: u64 = 0xffff_ffff;

/// What an issued address is for; doubles as its wallet label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressRole {
    Deposit,
    Mix,
    Shard(usize),
    Hop,
    Change,
    Pool,
}

impl AddressRole {
    pub fn label(&self) -> String {
        match self {
            AddressRole::Deposit => "deposit".to_string(),
            AddressRole::Mix => "mix".to_string(),
            AddressRole::Shard(n) => format!("shard{n}"),
            AddressRole::Hop => "hop".to_string(),
            AddressRole::Change => "change".to_string(),
            AddressRole::Pool => "pool".to_string(),
        }
    }

    /// Deposit addresses are always minted fresh; everything else
    /// may come from the prefetch pool.
    fn pooled(&self) -> bool {
        !matches!(self, AddressRole::Deposit)
    }
}

/// Per-transaction service-fee splice parameters. The engine builds
/// one per job, with the job's quoted percentage and the mix address
/// as the primary hint.
#[derive(Clone, Debug)]
pub struct DeductionPlan {
    pub enabled: bool,
    pub mode: DeductionMode,
    pub percent: Decimal,
    /// Receiving address of the spliced fee output.
    pub address: Option<String>,
    /// Which output the fee is taken from in `deduct` mode.
    pub primary: Option<String>,
}

/// Where the miner-fee estimate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeSource {
    /// The node's `paytxfee` hint.
    Node,
    /// The configured constant fallback.
    Constant,
}

/// Live chain numbers for the system status probe.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeStatus {
    pub block_height: u64,
    pub peer_count: usize,
    pub difficulty: f64,
}

/// The wallet facade: everything the engine needs from the node,
/// with policy enforcement in front of every broadcast.
pub struct Wallet<C> {
    client: C,
    cfg: Arc<Config>,
    pool: Mutex<VecDeque<String>>,
}

impl<C: NodeClient> Wallet<C> {
    pub fn new(client: C, cfg: Arc<Config>) -> Self {
        Self {
            client,
            cfg,
            pool: Mutex::new(VecDeque::new()),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Issues an address for `role`, drawing internal roles from the
    /// prefetch pool. Minting failures are fatal to the calling
    /// step; labelling failures are not.
    pub async fn new_address(&self, role: AddressRole) -> Result<String, EngineError> {
        let pooled = if role.pooled() {
            let from_pool = self.pool.lock().pop_front();
            match from_pool {
                Some(addr) => Some(addr),
                None => {
                    self.prefetch_addresses(POOL_BATCH).await;
                    self.pool.lock().pop_front()
                }
            }
        } else {
            None
        };

        let address = match pooled {
            Some(addr) => addr,
            None => self.client.get_new_address(DEFAULT_ADDRESS_SCHEME).await?,
        };
        self.label(&address, &role.label()).await;
        Ok(address)
    }

    /// Best-effort pool refill; stops at the first minting failure.
    pub async fn prefetch_addresses(&self, count: usize) {
        for _ in 0..count {
            match self.client.get_new_address(DEFAULT_ADDRESS_SCHEME).await {
                Ok(addr) => {
                    self.label(&addr, &AddressRole::Pool.label()).await;
                    self.pool.lock().push_back(addr);
                }
                Err(err) => {
                    warn!(%err, "address prefetch stopped early");
                    break;
                }
            }
        }
    }

    async fn label(&self, address: &str, label: &str) {
        if let Err(err) = self.client.set_account(address, label).await {
            trace!(%address, %label, %err, "could not label address");
        }
    }

    pub async fn validate_address(&self, address: &str) -> Result<bool, EngineError> {
        Ok(self.client.validate_address(address).await?.is_valid)
    }

    pub async fn list_unspent(&self, min_conf: u32) -> Result<Vec<ListUnspentEntry>, EngineError> {
        Ok(self.client.list_unspent(min_conf).await?)
    }

    pub async fn list_unspent_for(
        &self,
        addresses: &[String],
        min_conf: u32,
    ) -> Result<Vec<ListUnspentEntry>, EngineError> {
        Ok(self
            .client
            .list_unspent_for(min_conf, crate::client::MAX_CONFIRMATIONS, addresses)
            .await?)
    }

    /// Cumulative amount ever received at `address`, mempool included
    /// at `min_conf` 0.
    pub async fn received_by(&self, address: &str, min_conf: u32) -> Result<Decimal, EngineError> {
        Ok(self
            .client
            .get_received_by_address(address, min_conf)
            .await?)
    }

    pub async fn get_transaction(&self, txid: &str) -> Result<WalletTransaction, EngineError> {
        Ok(self.client.get_transaction(txid).await?)
    }

    pub async fn list_transactions(
        &self,
        count: usize,
    ) -> Result<Vec<ListTransactionsEntry>, EngineError> {
        Ok(self.client.list_transactions(count).await?)
    }

    pub async fn raw_transaction(&self, txid: &str) -> Result<DecodedTransaction, EngineError> {
        Ok(self.client.get_raw_transaction(txid).await?)
    }

    /// Estimates the miner fee in coins for a transaction with the
    /// given input and output counts.
    ///
    /// Uses the node's `paytxfee` rate per kB over the non-segwit
    /// size estimate when the hint is positive, floored at that same
    /// relay rate; otherwise falls back to the configured per-tx
    /// constant.
    pub async fn estimate_fee(&self, n_inputs: usize, n_outputs: usize) -> Decimal {
        let size = 10 + 148 * n_inputs + 34 * n_outputs;
        let rate = match self.client.get_info().await {
            Ok(info) => info.paytxfee.filter(|r| *r > Decimal::ZERO),
            Err(err) => {
                trace!(%err, "getinfo unavailable for fee estimation");
                None
            }
        };
        match rate {
            Some(rate) => {
                let kb = Decimal::from((size + 999) / 1000);
                (rate * kb).max(rate)
            }
            None => self.cfg.fee.tx_fee_per_tx,
        }
    }

    /// Whether quoting currently runs off the node hint or the
    /// constant fallback.
    pub async fn fee_source(&self) -> FeeSource {
        match self.client.get_info().await {
            Ok(info) if info.paytxfee.is_some_and(|r| r > Decimal::ZERO) => FeeSource::Node,
            _ => FeeSource::Constant,
        }
    }

    /// Splices the service-fee output into `outputs` per `plan`.
    ///
    /// The primary recipient is the plan's hint when that address is
    /// present in the outputs, else the first output. `deduct` mode
    /// subtracts from the primary unless that would leave it at or
    /// below dust, in which case the mode promotes to `add`. The fee
    /// output accumulates and never drops below the dust floor.
    pub async fn apply_deduction_outputs(
        &self,
        send_amount: Decimal,
        outputs: OutputList,
        plan: &DeductionPlan,
    ) -> Result<OutputList, EngineError> {
        if !plan.enabled {
            return Ok(outputs);
        }
        let Some(fee_address) = plan.address.as_deref() else {
            return Ok(outputs);
        };
        if plan.percent <= Decimal::ZERO || plan.percent >= Decimal::ONE {
            return Ok(outputs);
        }
        if !self.validate_address(fee_address).await.unwrap_or(false) {
            return Ok(outputs);
        }

        let deduction = (send_amount * plan.percent).round_dp(8);
        if deduction <= Decimal::ZERO {
            return Ok(outputs);
        }

        let mut spliced = outputs;
        let primary = plan
            .primary
            .as_deref()
            .filter(|p| spliced.contains(p))
            .map(str::to_string)
            .or_else(|| spliced.first_address().map(str::to_string));

        if plan.mode == DeductionMode::Deduct {
            if let Some(primary) = primary.as_deref() {
                let current = spliced.get(primary).unwrap_or(Decimal::ZERO);
                let residual = current - deduction;
                // A residual at or below dust promotes the splice to
                // `add`: the primary stays whole.
                if residual > self.cfg.dust_floor {
                    spliced.set(primary, residual.round_dp(8));
                }
            }
        }

        let fee_value = (spliced.get(fee_address).unwrap_or(Decimal::ZERO) + deduction)
            .max(self.cfg.dust_floor)
            .round_dp(8);
        spliced.set(fee_address, fee_value);
        Ok(spliced)
    }

    /// Parses the node's Rainbow summary into
    /// `(version after fork, fork height)`.
    pub async fn version_hint(&self) -> (Option<i64>, Option<u64>) {
        match self.client.get_rainbow_info().await {
            Ok(info) => parse_rainbow_hint(&info),
            Err(err) => {
                trace!(%err, "no rainbow info from node");
                (None, None)
            }
        }
    }

    /// The pre-broadcast policy gate. A failure here means the
    /// transaction was never sent.
    pub async fn enforce_tx_protections(&self, hex: &str) -> Result<(), EngineError> {
        let decoded = self
            .client
            .decode_raw_transaction(hex)
            .await
            .map_err(|_| PolicyError::Undecodable)?;

        let height = match self.client.get_block_count().await {
            Ok(h) => h,
            // An unreachable chain tip is treated as deep post-fork,
            // the strictest interpretation.
            Err(_) => RAINBOW_FORK_HEIGHT + 100_000,
        };
        let (hint_version, hint_fork) = self.version_hint().await;
        let fork_height = hint_fork.filter(|h| *h > 0).unwrap_or(RAINBOW_FORK_HEIGHT);
        let postfork = height > fork_height + FORK_GRACE;

        self.check_version(decoded.version, postfork, hint_version)?;
        if self.cfg.policy.require_finality {
            check_finality(&decoded)?;
        }
        check_output_scripts(&decoded)?;
        Ok(())
    }

    fn check_version(
        &self,
        version: i64,
        postfork: bool,
        hint_version: Option<i64>,
    ) -> Result<(), PolicyError> {
        let policy = &self.cfg.policy;
        let allowed = &policy.allowed_versions;
        let prefork_ok = version == 1 || version == POSTFORK_TX_VERSION;
        let ok = match policy.version_mode {
            VersionMode::Strict => {
                if postfork {
                    version == POSTFORK_TX_VERSION
                } else {
                    prefork_ok
                }
            }
            VersionMode::Allow => {
                if postfork {
                    allowed.contains(&version) || hint_version == Some(version)
                } else {
                    prefork_ok || allowed.contains(&version)
                }
            }
            VersionMode::Postfork => {
                if postfork {
                    let target = hint_version.unwrap_or(POSTFORK_TX_VERSION);
                    version == target || allowed.contains(&version)
                } else {
                    prefork_ok
                }
            }
        };
        if ok {
            Ok(())
        } else {
            Err(PolicyError::Version {
                found: version,
                mode: policy.version_mode.as_str(),
                postfork,
            })
        }
    }

    /// Builds and signs a raw transaction; returns the signed hex.
    pub async fn build_and_sign(
        &self,
        inputs: &[TxInput],
        outputs: &OutputList,
    ) -> Result<String, EngineError> {
        let raw = self.client.create_raw_transaction(inputs, outputs).await?;
        Ok(self.client.sign_raw_transaction(&raw).await?)
    }

    /// Runs the policy gate, then broadcasts. Node rejections are
    /// annotated with a dust hint when any output sits below the
    /// dust floor.
    pub async fn broadcast(&self, hex: &str) -> Result<String, EngineError> {
        self.enforce_tx_protections(hex).await?;
        match self.client.send_raw_transaction(hex).await {
            Ok(txid) => Ok(txid),
            Err(err) => {
                let dust_hint = match self.client.decode_raw_transaction(hex).await {
                    Ok(decoded) => decoded
                        .vout
                        .iter()
                        .any(|o| o.value < self.cfg.dust_floor),
                    Err(_) => false,
                };
                let mut reason = err.to_string();
                if dust_hint {
                    reason.push_str(" (possible dust output)");
                }
                Err(EngineError::BroadcastRejected(reason))
            }
        }
    }

    /// Unlocks the wallet when it reports itself locked and a
    /// passphrase is configured. Never fatal.
    pub async fn ensure_unlocked(&self) {
        let Ok(info) = self.client.get_info().await else {
            return;
        };
        if info.unlocked_until != Some(0) {
            return;
        }
        let Some(passphrase) = self.cfg.wallet_passphrase.as_deref() else {
            warn!("wallet is locked and no passphrase is configured");
            return;
        };
        match self
            .client
            .wallet_passphrase(passphrase, self.cfg.wallet_passphrase_timeout)
            .await
        {
            Ok(()) => trace!("wallet unlocked"),
            Err(err) => warn!(%err, "wallet unlock failed"),
        }
    }

    /// Height, peer count and difficulty for the system probe.
    pub async fn node_status(&self) -> Result<NodeStatus, EngineError> {
        let block_height = self.client.get_block_count().await?;
        let peer_count = self.client.get_peer_info().await?.len();
        let difficulty = self.client.get_difficulty().await?;
        Ok(NodeStatus {
            block_height,
            peer_count,
            difficulty,
        })
    }
}

fn check_finality(decoded: &DecodedTransaction) -> Result<(), PolicyError> {
    let min_sequence = decoded
        .vin
        .iter()
        .map(|i| i.sequence)
        .min()
        .unwrap_or(NON_FINAL_SEQUENCE_FLOOR);
    if decoded.locktime != 0 || min_sequence != NON_FINAL_SEQUENCE_FLOOR {
        return Err(PolicyError::NonFinal {
            locktime: decoded.locktime,
            min_sequence,
        });
    }
    Ok(())
}

fn check_output_scripts(decoded: &DecodedTransaction) -> Result<(), PolicyError> {
    for output in &decoded.vout {
        let script = &output.script_pub_key;
        let script_type = script
            .script_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        match script_type.as_str() {
            "nonstandard" | "witness_v0_keyhash" | "witness_v0_scripthash" => {
                return Err(PolicyError::Script(script_type));
            }
            "multisig" => {
                let req_sigs = script.req_sigs.unwrap_or(0);
                if !(1..=3).contains(&req_sigs) {
                    return Err(PolicyError::MultisigReqSigs(req_sigs));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Extracts `(version after fork, fork height)` from the node's
/// human-readable summary, e.g.
/// `"Rainbowpro fork height: 267120, Transaction version after fork: 101"`.
fn parse_rainbow_hint(info: &str) -> (Option<i64>, Option<u64>) {
    let lower = info.to_ascii_lowercase();
    let fork = number_after(&lower, "fork height");
    let version = number_after(&lower, "version after fork");
    (version, fork)
}

fn number_after<T: std::str::FromStr>(haystack: &str, key: &str) -> Option<T> {
    let rest = &haystack[haystack.find(key)? + key.len()..];
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{mock_config, MockNode},
        types::{DecodedInput, DecodedOutput, DecodedScript},
    };
    use rust_decimal_macros::dec;

    fn decoded(version: i64, locktime: u64, sequence: u64, script_type: &str) -> DecodedTransaction {
        DecodedTransaction {
            txid: Some("ab".to_string()),
            version,
            locktime,
            vin: vec![DecodedInput {
                txid: Some("cd".to_string()),
                vout: Some(0),
                sequence,
            }],
            vout: vec![DecodedOutput {
                value: dec!(1.0),
                n: 0,
                script_pub_key: DecodedScript {
                    script_type: Some(script_type.to_string()),
                    req_sigs: Some(1),
                    ..DecodedScript::default()
                },
            }],
            confirmations: None,
            blockhash: None,
        }
    }

    fn wallet_with(node: MockNode, cfg: Config) -> Wallet<MockNode> {
        Wallet::new(node, Arc::new(cfg))
    }

    fn plan(percent: Decimal, mode: DeductionMode) -> DeductionPlan {
        DeductionPlan {
            enabled: true,
            mode,
            percent,
            address: Some("8Pfee".to_string()),
            primary: Some("8Pprimary".to_string()),
        }
    }

    #[tokio::test]
    async fn deduction_deduct_mode_splits_primary() {
        let node = MockNode::new();
        let wallet = wallet_with(node, mock_config());

        let mut outputs = OutputList::new();
        outputs.credit("8Pprimary", dec!(10.0));
        let spliced = wallet
            .apply_deduction_outputs(dec!(10.0), outputs, &plan(dec!(0.1), DeductionMode::Deduct))
            .await
            .unwrap();

        assert_eq!(spliced.get("8Pprimary"), Some(dec!(9.0)));
        assert_eq!(spliced.get("8Pfee"), Some(dec!(1.0)));
    }

    #[tokio::test]
    async fn deduction_add_mode_floors_fee_at_dust() {
        let node = MockNode::new();
        let wallet = wallet_with(node, mock_config());

        let mut outputs = OutputList::new();
        outputs.credit("8Pprimary", dec!(1.0));
        let spliced = wallet
            .apply_deduction_outputs(
                dec!(1.0),
                outputs,
                &plan(dec!(0.000001), DeductionMode::Add),
            )
            .await
            .unwrap();

        // A 1e-6 deduction sits below the dust floor; the fee output
        // is lifted to it and the primary stays whole.
        assert_eq!(spliced.get("8Pprimary"), Some(dec!(1.0)));
        assert_eq!(spliced.get("8Pfee"), Some(dec!(0.000055)));
    }

    #[tokio::test]
    async fn deduction_that_would_empty_primary_promotes_to_add() {
        let node = MockNode::new();
        let wallet = wallet_with(node, mock_config());

        let mut outputs = OutputList::new();
        outputs.credit("8Pprimary", dec!(1.0));
        let spliced = wallet
            .apply_deduction_outputs(dec!(1.0), outputs, &plan(dec!(0.9999999), DeductionMode::Deduct))
            .await
            .unwrap();

        // Residual would be ~1e-7 <= dust: primary stays whole.
        assert_eq!(spliced.get("8Pprimary"), Some(dec!(1.0)));
        assert_eq!(spliced.get("8Pfee"), Some(dec!(0.9999999)));
    }

    #[tokio::test]
    async fn deduction_skips_invalid_fee_address() {
        let node = MockNode::new();
        node.invalidate_address("8Pfee");
        let wallet = wallet_with(node, mock_config());

        let mut outputs = OutputList::new();
        outputs.credit("8Pprimary", dec!(5.0));
        let spliced = wallet
            .apply_deduction_outputs(dec!(5.0), outputs.clone(), &plan(dec!(0.1), DeductionMode::Deduct))
            .await
            .unwrap();
        assert_eq!(spliced, outputs);
    }

    #[tokio::test]
    async fn strict_mode_rejects_wrong_postfork_version() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        node.set_decode_override(decoded(2, 0, NON_FINAL_SEQUENCE_FLOOR, "pubkeyhash"));
        let mut cfg = mock_config();
        cfg.policy.version_mode = VersionMode::Strict;
        let wallet = wallet_with(node, cfg);

        let err = wallet.enforce_tx_protections("00").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(PolicyError::Version { found: 2, .. })
        ));
    }

    #[tokio::test]
    async fn strict_mode_accepts_postfork_101() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        node.set_decode_override(decoded(101, 0, NON_FINAL_SEQUENCE_FLOOR, "pubkeyhash"));
        let mut cfg = mock_config();
        cfg.policy.version_mode = VersionMode::Strict;
        let wallet = wallet_with(node, cfg);

        wallet.enforce_tx_protections("00").await.unwrap();
    }

    #[tokio::test]
    async fn postfork_mode_accepts_node_hinted_version() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        node.set_rainbow_info("Rainbowpro fork height: 267120, Transaction version after fork: 105");
        node.set_decode_override(decoded(105, 0, NON_FINAL_SEQUENCE_FLOOR, "pubkeyhash"));
        let wallet = wallet_with(node, mock_config());

        wallet.enforce_tx_protections("00").await.unwrap();
    }

    #[tokio::test]
    async fn allow_mode_accepts_whitelist_with_finality_off() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        node.set_decode_override(decoded(2, 5, 0, "pubkeyhash"));
        let mut cfg = mock_config();
        cfg.policy.version_mode = VersionMode::Allow;
        cfg.policy.allowed_versions = [2, 101].into_iter().collect();
        cfg.policy.require_finality = false;
        let wallet = wallet_with(node, cfg);

        wallet.enforce_tx_protections("00").await.unwrap();
    }

    #[tokio::test]
    async fn finality_gate_rejects_low_sequence() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        node.set_decode_override(decoded(101, 0, 0, "pubkeyhash"));
        let wallet = wallet_with(node, mock_config());

        let err = wallet.enforce_tx_protections("00").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(PolicyError::NonFinal { .. })
        ));
    }

    #[tokio::test]
    async fn witness_outputs_are_rejected() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        node.set_decode_override(decoded(
            101,
            0,
            NON_FINAL_SEQUENCE_FLOOR,
            "witness_v0_keyhash",
        ));
        let wallet = wallet_with(node, mock_config());

        let err = wallet.enforce_tx_protections("00").await.unwrap_err();
        assert!(matches!(err, EngineError::Policy(PolicyError::Script(_))));
    }

    #[tokio::test]
    async fn multisig_reqsigs_out_of_range_is_rejected() {
        let node = MockNode::new();
        node.set_block_height(RAINBOW_FORK_HEIGHT + 100);
        let mut tx = decoded(101, 0, NON_FINAL_SEQUENCE_FLOOR, "multisig");
        tx.vout[0].script_pub_key.req_sigs = Some(4);
        node.set_decode_override(tx);
        let wallet = wallet_with(node, mock_config());

        let err = wallet.enforce_tx_protections("00").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(PolicyError::MultisigReqSigs(4))
        ));
    }

    #[tokio::test]
    async fn estimate_fee_prefers_node_hint() {
        let node = MockNode::new();
        node.set_paytxfee(dec!(0.002));
        let wallet = wallet_with(node.clone(), mock_config());

        // 2 inputs, 2 outputs: 10 + 296 + 68 = 374 bytes -> 1 kB.
        assert_eq!(wallet.estimate_fee(2, 2).await, dec!(0.002));
        assert_eq!(wallet.fee_source().await, FeeSource::Node);

        node.set_paytxfee(Decimal::ZERO);
        assert_eq!(wallet.estimate_fee(2, 2).await, dec!(0.01));
        assert_eq!(wallet.fee_source().await, FeeSource::Constant);
    }

    #[tokio::test]
    async fn address_pool_refills_in_batches() {
        let node = MockNode::new();
        let wallet = wallet_with(node.clone(), mock_config());

        let first = wallet.new_address(AddressRole::Hop).await.unwrap();
        // One mint per pooled address, a batch at a time.
        assert_eq!(node.minted_count(), POOL_BATCH as u32);
        let second = wallet.new_address(AddressRole::Change).await.unwrap();
        assert_eq!(node.minted_count(), POOL_BATCH as u32);
        assert_ne!(first, second);

        // Deposit addresses bypass the pool.
        let deposit = wallet.new_address(AddressRole::Deposit).await.unwrap();
        assert_eq!(node.minted_count(), POOL_BATCH as u32 + 1);
        assert_eq!(node.label_of(&deposit).as_deref(), Some("deposit"));
    }

    #[tokio::test]
    async fn ensure_unlocked_sends_passphrase_when_locked() {
        use crate::traits::ChainReader;

        let node = MockNode::new();
        node.set_unlocked_until(Some(0));
        let mut cfg = mock_config();
        cfg.wallet_passphrase = Some("correct horse".to_string());
        cfg.wallet_passphrase_timeout = 120;
        let wallet = wallet_with(node.clone(), cfg);

        wallet.ensure_unlocked().await;
        let info = node.get_info().await.unwrap();
        assert_eq!(info.unlocked_until, Some(120));
    }

    #[tokio::test]
    async fn ensure_unlocked_leaves_unencrypted_wallets_alone() {
        use crate::traits::ChainReader;

        let node = MockNode::new();
        let mut cfg = mock_config();
        cfg.wallet_passphrase = Some("correct horse".to_string());
        let wallet = wallet_with(node.clone(), cfg);

        wallet.ensure_unlocked().await;
        let info = node.get_info().await.unwrap();
        assert_eq!(info.unlocked_until, None);
    }

    #[test]
    fn rainbow_hint_parses_both_numbers() {
        let (version, fork) = parse_rainbow_hint(
            "Rainbowpro fork height: 267120, Transaction version after fork: 101",
        );
        assert_eq!(version, Some(101));
        assert_eq!(fork, Some(267_120));

        assert_eq!(parse_rainbow_hint("no numbers here"), (None, None));
    }
}
