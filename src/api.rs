//! The request/status adapter: typed schemas of the mixing API
//! mapped onto engine operations.
//!
//! The HTTP layer itself lives elsewhere; these handlers carry the
//! exact wire names of the original service (camelCase request and
//! status payloads, snake_case quote payload) so existing clients
//! keep working. Request errors never mutate job state.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    config::Tier,
    engine::Engine,
    error::{ApiError, EngineError},
    fee,
    job::JobStatus,
    traits::NodeClient,
    wallet::FeeSource,
};

/// `POST /mix/request` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixRequest {
    pub amount: Decimal,
    pub target_address: String,
    /// Falls back to the standard tier when omitted or zero.
    #[serde(default)]
    pub shards: Option<u32>,
    /// Falls back to the standard tier when omitted or zero.
    #[serde(default)]
    pub hops: Option<u32>,
}

/// `POST /mix/request` response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MixRequestResponse {
    pub job_id: String,
    pub deposit_address: String,
    pub amount: Decimal,
    pub shards: u32,
    pub hops: u32,
    pub fee_percent: Decimal,
    pub abs_fee: Decimal,
    pub miner_fee: Decimal,
    pub tx_count: u32,
    pub net_amount: Decimal,
    pub deposit_required: Decimal,
    pub miner_fee_cap: Decimal,
    pub extra_service_fee: Decimal,
    pub deposit_extra: Decimal,
    pub fee_source: FeeSource,
}

/// `GET /mix/status` response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: JobStatus,
    pub confirmations: i64,
    pub deposit_address: String,
    pub deposit_received: Decimal,
    pub deposit_required: Decimal,
    pub shards: u32,
    pub hops: u32,
    pub fee_percent: Decimal,
    pub abs_fee: Decimal,
    pub miner_fee: Decimal,
    pub tx_count: u32,
    pub net_amount: Decimal,
    pub shard_progress_total: u32,
    pub shard_progress_completed: u32,
    pub shard_txids_fanout: Vec<String>,
    pub shard_txids_hops: Vec<Vec<String>>,
    pub shard_txids_final: Vec<String>,
    pub fanout_count: usize,
    pub hop_tx_count: usize,
    pub final_tx_count: usize,
    pub txid1: Option<String>,
    pub txid2: Option<String>,
    pub error: Option<String>,
    pub mix_utxo_ready: bool,
    pub mix_address: Option<String>,
    pub shard_ready_count: usize,
    pub deposit_confirmations: i64,
}

/// `POST /mix/resume` body.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    pub job_id: String,
}

/// `POST /mix/resume` response.
#[derive(Clone, Debug, Serialize)]
pub struct ResumeResponse {
    pub ok: bool,
}

/// `POST /mix/quote` body.
#[derive(Clone, Debug, Deserialize)]
pub struct QuoteRequest {
    pub amount: Decimal,
    pub shards: u32,
    pub hops: u32,
}

/// `POST /mix/quote` response. Snake_case keys, as the original
/// quote endpoint always answered.
#[derive(Clone, Debug, Serialize)]
pub struct QuoteResponse {
    pub percent: Decimal,
    pub abs_fee: Decimal,
    pub miner_fee: Decimal,
    pub tx_count: u32,
    pub net_amount: Decimal,
    pub cap: Decimal,
    pub extra_to_service: Decimal,
    pub fee_source: FeeSource,
}

/// `GET /mix/tiers` response.
#[derive(Clone, Debug, Serialize)]
pub struct TiersResponse {
    pub tiers: Vec<Tier>,
}

/// `GET /system/status` response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResponse {
    pub block_height: u64,
    pub peer_count: usize,
    pub difficulty: u64,
}

/// Creates a mixing job and hands back the deposit instructions.
pub async fn mix_request<C: NodeClient + 'static>(
    engine: &Arc<Engine<C>>,
    request: MixRequest,
) -> Result<MixRequestResponse, ApiError> {
    if request.amount <= Decimal::ZERO {
        return Err(ApiError::BadRequest("Amount must be positive".to_string()));
    }
    // Zero means "pick for me", as it always has on this API.
    let shards = request.shards.filter(|s| *s > 0);
    let hops = request.hops.filter(|h| *h > 0);

    let job = engine
        .create_job(request.target_address, request.amount, shards, hops)
        .await?;
    let cfg = engine.config();
    Ok(MixRequestResponse {
        job_id: job.job_id,
        deposit_address: job.deposit_address,
        amount: job.amount,
        shards: job.shard_count,
        hops: job.hop_count,
        fee_percent: job.fee_percent,
        abs_fee: job.abs_fee,
        miner_fee: job.miner_fee,
        tx_count: job.tx_count,
        net_amount: job.net_amount,
        deposit_required: job.deposit_required,
        miner_fee_cap: cfg.fee.miner_fee_cap,
        extra_service_fee: job.extra_service_fee,
        deposit_extra: cfg.deposit_extra,
        fee_source: engine.wallet().fee_source().await,
    })
}

/// The reconciled status of a job, live probes included.
pub async fn mix_status<C: NodeClient + 'static>(
    engine: &Arc<Engine<C>>,
    job_id: &str,
) -> Result<StatusResponse, ApiError> {
    let view = engine.status_view(job_id).await.map_err(|err| match err {
        EngineError::UnknownJob(_) => ApiError::NotFound,
        other => ApiError::Engine(other),
    })?;
    let job = view.job;
    Ok(StatusResponse {
        status: job.status,
        confirmations: job.confirmations,
        deposit_address: job.deposit_address,
        deposit_received: job.deposit_received,
        deposit_required: job.deposit_required,
        shards: job.shard_count,
        hops: job.hop_count,
        fee_percent: job.fee_percent,
        abs_fee: job.abs_fee,
        miner_fee: job.miner_fee,
        tx_count: job.tx_count,
        net_amount: job.net_amount,
        shard_progress_total: job.shard_progress_total,
        shard_progress_completed: job.shard_progress_completed,
        fanout_count: job.shard_txids_fanout.len(),
        hop_tx_count: job.shard_txids_hops.iter().map(Vec::len).sum(),
        final_tx_count: job.shard_txids_final.len(),
        shard_txids_fanout: job.shard_txids_fanout,
        shard_txids_hops: job.shard_txids_hops,
        shard_txids_final: job.shard_txids_final,
        txid1: job.txid1,
        txid2: job.txid2,
        error: job.error,
        mix_utxo_ready: view.mix_utxo_ready,
        mix_address: job.mix_address,
        shard_ready_count: view.shard_ready_count,
        deposit_confirmations: view.deposit_confirmations,
    })
}

/// Re-attaches a worker to a job; a no-op when one is running.
pub fn mix_resume<C: NodeClient + 'static>(
    engine: &Arc<Engine<C>>,
    request: ResumeRequest,
) -> Result<ResumeResponse, ApiError> {
    if engine.resume(&request.job_id) {
        Ok(ResumeResponse { ok: true })
    } else {
        Err(ApiError::NotFound)
    }
}

/// A fee breakdown without creating anything.
pub async fn mix_quote<C: NodeClient + 'static>(
    engine: &Arc<Engine<C>>,
    request: QuoteRequest,
) -> Result<QuoteResponse, ApiError> {
    let (quote, fee_source) = engine
        .quote(request.amount, request.shards, request.hops)
        .await;
    Ok(QuoteResponse {
        percent: quote.percent,
        abs_fee: quote.abs_fee,
        miner_fee: quote.miner_fee,
        tx_count: quote.tx_count,
        net_amount: quote.net_amount,
        cap: quote.cap,
        extra_to_service: quote.extra_to_service,
        fee_source,
    })
}

/// The named tiers users can pick from.
pub fn mix_tiers<C: NodeClient + 'static>(engine: &Arc<Engine<C>>) -> TiersResponse {
    TiersResponse {
        tiers: fee::tiers(&engine.config().tiers),
    }
}

/// Chain height, peer count and difficulty, probed live.
pub async fn system_status<C: NodeClient + 'static>(
    engine: &Arc<Engine<C>>,
) -> Result<SystemStatusResponse, ApiError> {
    let status = engine.system_status().await?;
    Ok(SystemStatusResponse {
        block_height: status.block_height,
        peer_count: status.peer_count,
        difficulty: status.difficulty as u64,
    })
}
