use std::{collections::BTreeSet, env, str::FromStr, time::Duration};

use rust_decimal::Decimal;
use serde::Serialize;

/// Network-recommended floor for per-transaction miner fees, in coins.
const PER_TX_FEE_FLOOR: &str = "0.01";

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    env_decimal_or(key, Decimal::from_str(default).expect("default decimal literal"))
}

fn env_decimal_or(key: &str, default: Decimal) -> Decimal {
    env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Connection parameters for the node's RPC endpoint.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl RpcConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Constants feeding the pure fee model.
#[derive(Clone, Debug)]
pub struct FeeConfig {
    /// Base percentage applied to every job.
    pub base_p: Decimal,
    /// Percentage added per shard.
    pub shard_p: Decimal,
    /// Percentage added per hop.
    pub hop_p: Decimal,
    /// Lower clamp on the resulting percentage.
    pub min_p: Decimal,
    /// Historic upper clamp; parsed for operator environments but no
    /// longer applied.
    pub max_p: Decimal,
    /// Absolute floor on the percentage fee, in coins.
    pub abs_fee_floor: Decimal,
    /// Estimated miner cost per transaction, in coins.
    pub tx_fee_per_tx: Decimal,
    /// Upper clamp on the total miner spend per job; the overflow
    /// moves into the service fee.
    pub miner_fee_cap: Decimal,
    /// Lower clamp on the total miner spend per job.
    pub min_relay_fee_floor: Decimal,
}

/// A named (shards, hops) pair offered to users.
#[derive(Clone, Debug, Serialize)]
pub struct Tier {
    pub name: String,
    pub shards: u32,
    pub hops: u32,
}

/// How the service fee is taken out of the primary output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeductionMode {
    /// Subtract the fee from the primary recipient.
    Deduct,
    /// Add the fee on top, leaving the primary untouched.
    Add,
}

impl DeductionMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => DeductionMode::Add,
            _ => DeductionMode::Deduct,
        }
    }
}

/// Service-fee deduction splice settings.
#[derive(Clone, Debug)]
pub struct DeductionConfig {
    pub enabled: bool,
    pub mode: DeductionMode,
    /// Default percentage; jobs override it with their quoted rate.
    pub percent: Decimal,
    /// Receiving address for the spliced fee output.
    pub address: Option<String>,
}

/// Transaction-version enforcement mode for the pre-broadcast gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionMode {
    /// Post-fork only v101; pre-fork v1 or v101.
    Strict,
    /// Post-fork: the node-hinted version (falling back to 101) or an
    /// allow-listed one.
    Postfork,
    /// Allow-list driven.
    Allow,
}

impl VersionMode {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => VersionMode::Strict,
            "allow" => VersionMode::Allow,
            _ => VersionMode::Postfork,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionMode::Strict => "strict",
            VersionMode::Postfork => "postfork",
            VersionMode::Allow => "allow",
        }
    }
}

/// Pre-broadcast transaction policy.
#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub version_mode: VersionMode,
    /// Explicitly allow-listed transaction versions.
    pub allowed_versions: BTreeSet<i64>,
    /// Require max sequences and zero locktime.
    pub require_finality: bool,
}

/// The full engine configuration, read once from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub rpc: RpcConfig,
    /// Default per-tx miner fee hint, in coins.
    pub fixed_fee: Decimal,
    /// Additive buffer folded into `deposit_required`.
    pub deposit_extra: Decimal,
    /// Minconf for step-1 inputs at the deposit address.
    pub minconf: u32,
    /// Maturity minconf for the step-1 output at the mix address.
    pub minconf_step2: u32,
    /// Input minconf along the shard chains.
    pub minconf_shard: u32,
    /// Confirmation target for the step-1 transaction.
    pub required_conf: u32,
    /// Worker poll period.
    pub poll_interval: Duration,
    /// Outputs at or below this value are treated as dust.
    pub dust_floor: Decimal,
    pub fee: FeeConfig,
    pub tiers: Vec<Tier>,
    pub deduction: DeductionConfig,
    /// Fallback source address when a job has no mix address.
    pub primary_address: Option<String>,
    pub policy: PolicyConfig,
    /// Receiver of the miner-cap overflow service fee.
    pub fee_address: Option<String>,
    pub wallet_passphrase: Option<String>,
    pub wallet_passphrase_timeout: u64,
}

impl Config {
    /// Reads the full configuration from the environment, applying
    /// the same defaults and startup clamps the service has always
    /// shipped with.
    pub fn from_env() -> Self {
        let floor = Decimal::from_str(PER_TX_FEE_FLOOR).expect("fee floor literal");

        let allowed_versions = env_opt("ABCMINT_TX_ALLOWED_VERSIONS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|p| p.trim().parse::<i64>().ok())
                    .filter(|v| *v != 0)
                    .collect()
            })
            .unwrap_or_default();

        // The per-tx hint chain: TX_FEE_PER_TX falls back to
        // FIXED_FEE, both floored at the network recommendation.
        let fixed_fee = env_decimal("FIXED_FEE", "0.01").max(floor);
        let tx_fee_per_tx = env_decimal_or("TX_FEE_PER_TX", fixed_fee).max(floor);

        Config {
            rpc: RpcConfig {
                host: env_string("ABCMINT_RPC_HOST", "127.0.0.1"),
                port: env_u32("ABCMINT_RPC_PORT", 8332) as u16,
                user: env_string("ABCMINT_RPC_USER", ""),
                password: env_string("ABCMINT_RPC_PASSWORD", ""),
            },
            fixed_fee,
            deposit_extra: env_decimal("DEPOSIT_EXTRA", "0.1"),
            minconf: env_u32("MINCONF", 1),
            minconf_step2: env_u32("MINCONF_STEP2", 6),
            minconf_shard: env_u32("MINCONF_SHARD", 0),
            required_conf: env_u32("REQUIRED_CONF", 6),
            poll_interval: Duration::from_secs(env_u64("CONF_POLL_INTERVAL_SEC", 15)),
            dust_floor: env_decimal("DUST_COINS_FLOOR", "0.000055"),
            fee: FeeConfig {
                base_p: env_decimal("FEE_BASE_P", "0.003"),
                shard_p: env_decimal("FEE_SHARD_P", "0.0008"),
                hop_p: env_decimal("FEE_HOP_P", "0.0005"),
                min_p: env_decimal("FEE_MIN_P", "0.0025"),
                max_p: env_decimal("FEE_MAX_P", "0.012"),
                abs_fee_floor: env_decimal("ABS_FEE_FLOOR", "0.001"),
                tx_fee_per_tx,
                miner_fee_cap: env_decimal("MINER_FEE_CAP", "1"),
                min_relay_fee_floor: env_decimal("MIN_RELAY_FEE_FLOOR", "0.001"),
            },
            tiers: vec![
                Tier {
                    name: "standard".to_string(),
                    shards: env_u32("TIER_STANDARD_SHARDS", 3),
                    hops: env_u32("TIER_STANDARD_HOPS", 1),
                },
                Tier {
                    name: "enhanced".to_string(),
                    shards: env_u32("TIER_ENHANCED_SHARDS", 5),
                    hops: env_u32("TIER_ENHANCED_HOPS", 2),
                },
                Tier {
                    name: "strong".to_string(),
                    shards: env_u32("TIER_STRONG_SHARDS", 8),
                    hops: env_u32("TIER_STRONG_HOPS", 3),
                },
            ],
            deduction: DeductionConfig {
                enabled: env_bool("ABCMINT_DEDUCTION_ENABLED", false),
                mode: DeductionMode::parse(&env_string("ABCMINT_DEDUCTION_MODE", "deduct")),
                percent: env_decimal("ABCMINT_DEDUCTION_PERCENT", "0"),
                address: env_opt("ABCMINT_DEDUCTION_ADDRESS"),
            },
            primary_address: env_opt("ABCMINT_PRIMARY_ADDRESS"),
            policy: PolicyConfig {
                version_mode: VersionMode::parse(&env_string(
                    "ABCMINT_TX_VERSION_MODE",
                    "postfork",
                )),
                allowed_versions,
                require_finality: env_bool("ABCMINT_TX_REQUIRE_FINALITY", true),
            },
            fee_address: env_opt("ABCMINT_FEE_ADDRESS"),
            wallet_passphrase: env_opt("ABCMINT_WALLET_PASSPHRASE"),
            wallet_passphrase_timeout: env_u64("ABCMINT_WALLET_PASSPHRASE_TIMEOUT", 120),
        }
    }

    /// The (shards, hops) defaults applied when a request omits them.
    pub fn standard_tier(&self) -> (u32, u32) {
        self.tiers
            .first()
            .map(|t| (t.shards, t.hops))
            .unwrap_or((3, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn per_tx_fees_are_floored() {
        // Whatever the environment says, the startup clamp keeps the
        // per-tx hints at or above the network recommendation.
        let cfg = Config::from_env();
        assert!(cfg.fixed_fee >= dec!(0.01));
        assert!(cfg.fee.tx_fee_per_tx >= dec!(0.01));
    }

    #[test]
    fn version_mode_parsing_defaults_to_postfork() {
        assert_eq!(VersionMode::parse("strict"), VersionMode::Strict);
        assert_eq!(VersionMode::parse("ALLOW"), VersionMode::Allow);
        assert_eq!(VersionMode::parse("anything"), VersionMode::Postfork);
    }

    #[test]
    fn deduction_mode_parsing_defaults_to_deduct() {
        assert_eq!(DeductionMode::parse("add"), DeductionMode::Add);
        assert_eq!(DeductionMode::parse("deduct"), DeductionMode::Deduct);
        assert_eq!(DeductionMode::parse(""), DeductionMode::Deduct);
    }
}
