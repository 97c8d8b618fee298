use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::fee::FeeQuote;

/// Where a job stands in the mixing pipeline.
///
/// The serialized names are the wire names of the original service
/// and must not change; clients and the state file both carry them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet picked up by a deposit monitor.
    Pending,
    /// Watching the deposit address for incoming funds.
    WaitingDeposit,
    /// Deposit threshold met; waiting for spendable confirmations.
    DepositReceived,
    /// Building and broadcasting the consolidation transaction.
    MixingStep1,
    /// Step-1 broadcast; waiting for it to mature.
    WaitingConfirmations,
    /// Executing the sharded fanout, hops and final deliveries.
    MixingStep2,
    /// All shards delivered (or degraded out).
    Completed,
    /// A step failed; resumable by the guardian or an explicit resume.
    Error,
}

impl JobStatus {
    /// The on-wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::WaitingDeposit => "waiting_deposit",
            JobStatus::DepositReceived => "deposit_received",
            JobStatus::MixingStep1 => "mixing_step1",
            JobStatus::WaitingConfirmations => "waiting_confirmations",
            JobStatus::MixingStep2 => "mixing_step2",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

/// One mixing job: the user's request, its fee snapshot, and every
/// piece of on-chain progress. Mutated only by the engine's workers
/// and persisted after every field change; never deleted.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Job {
    pub job_id: String,
    /// User-supplied destination.
    pub target_address: String,
    /// Gross amount the user wants routed (fees come out of this).
    pub amount: Decimal,
    /// Freshly issued receive address, unique per job.
    pub deposit_address: String,
    /// Last observed sum at the deposit address, mempool included.
    #[serde(default)]
    pub deposit_received: Decimal,
    /// `amount + deposit_extra + extra_service_fee`; unblocks step 1.
    pub deposit_required: Decimal,
    pub shard_count: u32,
    pub hop_count: u32,
    // Fee quote snapshot, frozen at creation.
    pub fee_percent: Decimal,
    pub abs_fee: Decimal,
    pub miner_fee: Decimal,
    pub tx_count: u32,
    pub net_amount: Decimal,
    #[serde(default)]
    pub extra_service_fee: Decimal,
    #[serde(default)]
    pub shard_progress_total: u32,
    /// Shards that finished their sequence, degraded ones included.
    #[serde(default)]
    pub shard_progress_completed: u32,
    /// Fanout txids, mix address → shard address, in shard order.
    #[serde(default)]
    pub shard_txids_fanout: Vec<String>,
    /// Per-shard hop chains, at most `hop_count` entries each.
    #[serde(default)]
    pub shard_txids_hops: Vec<Vec<String>>,
    /// Final delivery txids to the target address.
    #[serde(default)]
    pub shard_txids_final: Vec<String>,
    pub status: JobStatus,
    /// The step-1 consolidation txid. Never changes once set.
    pub txid1: Option<String>,
    /// Legacy convenience: the most recent final txid.
    pub txid2: Option<String>,
    /// The consolidation address funded by step 1.
    pub mix_address: Option<String>,
    /// Last observed confirmation count of `txid1`.
    #[serde(default)]
    pub confirmations: i64,
    #[serde(default = "default_required_conf")]
    pub required_conf: u32,
    /// Last error message; cleared on successful transitions.
    pub error: Option<String>,
    #[serde(with = "lenient_timestamp", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "lenient_timestamp", default = "Utc::now")]
    pub last_poll_at: DateTime<Utc>,
    #[serde(with = "lenient_timestamp", default = "Utc::now")]
    pub last_update_at: DateTime<Utc>,
}

fn default_required_conf() -> u32 {
    6
}

impl Job {
    /// A new job with its fee snapshot frozen in.
    pub fn create(
        job_id: String,
        target_address: String,
        amount: Decimal,
        deposit_address: String,
        deposit_required: Decimal,
        shard_count: u32,
        hop_count: u32,
        quote: &FeeQuote,
        required_conf: u32,
    ) -> Self {
        let now = Utc::now();
        Job {
            job_id,
            target_address,
            amount,
            deposit_address,
            deposit_received: Decimal::ZERO,
            deposit_required,
            shard_count,
            hop_count,
            fee_percent: quote.percent,
            abs_fee: quote.abs_fee,
            miner_fee: quote.miner_fee,
            tx_count: quote.tx_count,
            net_amount: quote.net_amount,
            extra_service_fee: quote.extra_to_service,
            shard_progress_total: shard_count,
            shard_progress_completed: 0,
            shard_txids_fanout: Vec::new(),
            shard_txids_hops: Vec::new(),
            shard_txids_final: Vec::new(),
            status: JobStatus::Pending,
            txid1: None,
            txid2: None,
            mix_address: None,
            confirmations: 0,
            required_conf,
            error: None,
            created_at: now,
            last_poll_at: now,
            last_update_at: now,
        }
    }

    /// Marks an engine-visible change.
    pub fn touch(&mut self) {
        self.last_update_at = Utc::now();
    }

    /// Moves to `status`, clearing any stored error.
    pub fn advance(&mut self, status: JobStatus) {
        self.status = status;
        self.error = None;
        self.touch();
    }

    /// Moves to the error state, keeping the message for status reads.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        self.touch();
    }

    /// Whether any fanout has been broadcast yet.
    pub fn has_shards(&self) -> bool {
        !self.shard_txids_fanout.is_empty()
    }
}

/// RFC-3339 timestamps with microsecond precision; anything that
/// fails to parse on load degrades to *now* instead of poisoning the
/// whole state file.
mod lenient_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote() -> FeeQuote {
        FeeQuote {
            percent: dec!(0.0059),
            abs_fee: dec!(0.236),
            miner_fee: dec!(0.09),
            tx_count: 9,
            net_amount: dec!(39.674),
            cap: dec!(1.0),
            extra_to_service: Decimal::ZERO,
        }
    }

    fn sample() -> Job {
        Job::create(
            "job-1".to_string(),
            "8Ptarget".to_string(),
            dec!(40),
            "8Pdeposit".to_string(),
            dec!(40.1),
            3,
            1,
            &quote(),
            6,
        )
    }

    #[test]
    fn status_wire_names_are_stable() {
        assert_eq!(
            serde_json::to_string(&JobStatus::WaitingConfirmations).unwrap(),
            "\"waiting_confirmations\""
        );
        assert_eq!(
            serde_json::from_str::<JobStatus>("\"mixing_step2\"").unwrap(),
            JobStatus::MixingStep2
        );
    }

    #[test]
    fn advance_clears_error() {
        let mut job = sample();
        job.fail("node went away");
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.is_some());

        job.advance(JobStatus::WaitingConfirmations);
        assert_eq!(job.status, JobStatus::WaitingConfirmations);
        assert!(job.error.is_none());
    }

    #[test]
    fn job_round_trips_through_json() {
        // Timestamps are quantised to microseconds on write, so byte
        // identity of a second pass is the meaningful round-trip.
        let job = sample();
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
        // Decimals travel as strings.
        assert!(json.contains("\"amount\":\"40\""));
    }

    #[test]
    fn invalid_timestamps_default_to_now() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["created_at"] = serde_json::Value::String("not-a-date".to_string());
        value["last_poll_at"] = serde_json::Value::Null;
        let before = Utc::now();
        let job: Job = serde_json::from_value(value).unwrap();
        assert!(job.created_at >= before);
        assert!(job.last_poll_at >= before);
    }
}
