//! The fee and topology quoting model.
//!
//! Pure and deterministic over its inputs and [`FeeConfig`]; nothing
//! here touches the node. All arithmetic is exact decimal quantised
//! to 1e-8.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::{FeeConfig, Tier};

/// The 1e-8 quantum every coin amount is rounded to.
const COIN_DP: u32 = 8;

/// A fee breakdown for a prospective or created job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    /// Effective service-fee percentage.
    pub percent: Decimal,
    /// Absolute service fee in coins, miner-cap overflow included.
    pub abs_fee: Decimal,
    /// Miner budget in coins, clamped to the configured cap.
    pub miner_fee: Decimal,
    /// Number of on-chain transactions the topology will produce.
    pub tx_count: u32,
    /// What actually reaches the target after all fees.
    pub net_amount: Decimal,
    /// The configured miner-fee cap, echoed for display.
    pub cap: Decimal,
    /// Estimated miner cost beyond the cap, transferred into the
    /// service fee so the gross deposit stays predictable.
    pub extra_to_service: Decimal,
}

/// The effective fee percentage for a topology.
pub fn fee_percent(cfg: &FeeConfig, shards: u32, hops: u32) -> Decimal {
    let raw = cfg.base_p + Decimal::from(shards) * cfg.shard_p + Decimal::from(hops) * cfg.hop_p;
    raw.max(cfg.min_p)
}

/// Transactions needed to execute a topology: S fanouts, S·H hops
/// and S final deliveries.
pub fn tx_count(shards: u32, hops: u32) -> u32 {
    shards * 2 + shards * hops
}

/// Quotes a topology for an amount.
pub fn quote(cfg: &FeeConfig, amount: Decimal, shards: u32, hops: u32) -> FeeQuote {
    let percent = fee_percent(cfg, shards, hops);
    let count = tx_count(shards, hops);

    let abs_fee_raw = (amount * percent).max(cfg.abs_fee_floor).round_dp(COIN_DP);
    let miner_fee_est = (Decimal::from(count) * cfg.tx_fee_per_tx).round_dp(COIN_DP);

    let miner_fee = miner_fee_est
        .max(cfg.min_relay_fee_floor)
        .min(cfg.miner_fee_cap)
        .round_dp(COIN_DP);
    let extra_to_service = (miner_fee_est - cfg.miner_fee_cap)
        .max(Decimal::ZERO)
        .round_dp(COIN_DP);

    let abs_fee = (abs_fee_raw + extra_to_service).round_dp(COIN_DP);
    let net_amount = (amount - abs_fee - miner_fee)
        .max(Decimal::ZERO)
        .round_dp(COIN_DP);

    FeeQuote {
        percent,
        abs_fee,
        miner_fee,
        tx_count: count,
        net_amount,
        cap: cfg.miner_fee_cap,
        extra_to_service,
    }
}

/// The named tiers offered by the quote endpoint.
pub fn tiers(tiers: &[Tier]) -> Vec<Tier> {
    tiers.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> FeeConfig {
        FeeConfig {
            base_p: dec!(0.003),
            shard_p: dec!(0.0008),
            hop_p: dec!(0.0005),
            min_p: dec!(0.0025),
            max_p: dec!(0.012),
            abs_fee_floor: dec!(0.001),
            tx_fee_per_tx: dec!(0.01),
            miner_fee_cap: dec!(1.0),
            min_relay_fee_floor: dec!(0.001),
        }
    }

    #[test]
    fn quote_seed_scenario() {
        // 40 coins over 3 shards and 1 hop, with the shard rate at
        // 0.0002: percent lands exactly on 0.0041.
        let cfg = FeeConfig {
            shard_p: dec!(0.0002),
            ..test_config()
        };
        let q = quote(&cfg, dec!(40), 3, 1);
        assert_eq!(q.percent, dec!(0.0041));
        assert_eq!(q.tx_count, 9);
        assert_eq!(q.abs_fee, dec!(0.164));
        assert_eq!(q.miner_fee, dec!(0.09));
        assert_eq!(q.extra_to_service, dec!(0));
        assert_eq!(q.net_amount, dec!(39.746));
    }

    #[test]
    fn percent_never_drops_below_floor() {
        let cfg = FeeConfig {
            base_p: dec!(0.0001),
            shard_p: dec!(0.0001),
            hop_p: Decimal::ZERO,
            ..test_config()
        };
        assert_eq!(fee_percent(&cfg, 1, 0), cfg.min_p);
    }

    #[test]
    fn tx_count_matches_topology() {
        assert_eq!(tx_count(1, 0), 2);
        assert_eq!(tx_count(3, 1), 9);
        assert_eq!(tx_count(8, 3), 40);
    }

    #[test]
    fn miner_overflow_moves_into_service_fee() {
        // 8 shards x 3 hops = 40 txs at 0.05 each overruns a 1.0 cap
        // by 1.0; the overflow lands in abs_fee.
        let cfg = FeeConfig {
            tx_fee_per_tx: dec!(0.05),
            ..test_config()
        };
        let q = quote(&cfg, dec!(100), 8, 3);
        assert_eq!(q.miner_fee, dec!(1.0));
        assert_eq!(q.extra_to_service, dec!(1.0));
        let plain = (dec!(100) * q.percent).max(cfg.abs_fee_floor);
        assert_eq!(q.abs_fee, plain + dec!(1.0));
        // Everything still adds up inside the gross amount.
        assert!(q.net_amount + q.abs_fee + q.miner_fee <= dec!(100));
    }

    #[test]
    fn abs_fee_floor_boundary() {
        let cfg = test_config();
        let percent = fee_percent(&cfg, 1, 0);
        // Exactly at the floor crossover the raw percentage fee and
        // the floor agree.
        let amount = (cfg.abs_fee_floor / percent).round_dp(8);
        let q = quote(&cfg, amount, 1, 0);
        assert_eq!(q.abs_fee, (amount * percent).round_dp(8));
    }

    #[test]
    fn tiny_amount_never_goes_negative() {
        let q = quote(&test_config(), dec!(0.00000005), 3, 1);
        assert_eq!(q.net_amount, Decimal::ZERO);
    }

    #[test]
    fn quote_is_pure() {
        let cfg = test_config();
        let a = quote(&cfg, dec!(12.345), 5, 2);
        let b = quote(&cfg, dec!(12.345), 5, 2);
        assert_eq!(a, b);
    }

    #[test]
    fn quantisation_is_eight_places() {
        let q = quote(&test_config(), dec!(1.123456789), 3, 1);
        assert!(q.abs_fee.scale() <= 8);
        assert!(q.net_amount.scale() <= 8);
    }
}
