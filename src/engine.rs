use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::*;
use uuid::Uuid;

use crate::{
    config::Config,
    error::EngineError,
    fee::{self, FeeQuote},
    job::{Job, JobStatus},
    store::JobStore,
    traits::NodeClient,
    types::{OutputList, TransactionCategory, TxInput},
    wallet::{AddressRole, DeductionPlan, FeeSource, NodeStatus, Wallet},
};

/// How often the guardian sweeps all jobs for missing workers.
const GUARDIAN_INTERVAL: Duration = Duration::from_secs(10);

/// Poll windows granted to a failed minconf-0 broadcast before the
/// send is abandoned.
const BROADCAST_RETRY_POLLS: u32 = 6;

/// Wallet-history windows for the recovery scans.
const TXID1_SCAN_WINDOW: usize = 100;
const COMPLETION_SCAN_WINDOW: usize = 50;
const BACKFILL_SCAN_WINDOW: usize = 200;

/// The monitor kinds a job can be running. At most one per job,
/// enforced through [`Engine::spawn_worker`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    /// Watches the deposit address and drives step 1.
    Deposit,
    /// Waits out step-1 confirmations, then drives step 2.
    Confirm,
    /// Resumes the sharded fanout/hop pipeline.
    Shard,
}

/// A live UTXO feeding one shard's next transfer.
#[derive(Clone, Debug)]
struct ShardSource {
    address: String,
    amount: Decimal,
    txid: String,
}

/// Per-tx send options for [`Engine::single_send_from`].
#[derive(Clone, Copy, Debug)]
struct SendOptions<'a> {
    /// Permit silently reducing the amount to whatever the inputs
    /// cover. Only terminal transfers that intend to spend the whole
    /// shard may set this.
    drain: bool,
    /// Where non-dust change goes; `None` mints a fresh change
    /// address. The fanout step points this back at the mix address
    /// so later fanouts stay funded.
    change_to: Option<&'a str>,
}

/// A job status enriched with live node probes.
#[derive(Clone, Debug)]
pub struct StatusView {
    pub job: Job,
    /// Whether the mix address holds spendable UTXOs at the step-2
    /// maturity minconf.
    pub mix_utxo_ready: bool,
    /// Fanout outputs still unspent at the shard minconf.
    pub shard_ready_count: usize,
    /// Best confirmation count among deposit UTXOs.
    pub deposit_confirmations: i64,
}

/// The mixing job engine: owns the jobs map, schedules one worker
/// per job, and persists after every observable change.
pub struct Engine<C> {
    wallet: Wallet<C>,
    cfg: Arc<Config>,
    store: JobStore,
    jobs: Mutex<BTreeMap<String, Job>>,
    workers: Mutex<HashMap<String, WorkerRole>>,
}

impl<C: NodeClient + 'static> Engine<C> {
    /// Loads persisted state and wraps the node connection. Call
    /// [`Engine::start`] afterwards to bring up the guardian.
    pub fn new(client: C, cfg: Config, store: JobStore) -> Result<Arc<Self>, EngineError> {
        let jobs = store.load()?;
        if !jobs.is_empty() {
            info!(count = jobs.len(), "restored persisted jobs");
        }
        let cfg = Arc::new(cfg);
        Ok(Arc::new(Self {
            wallet: Wallet::new(client, Arc::clone(&cfg)),
            cfg,
            store,
            jobs: Mutex::new(jobs),
            workers: Mutex::new(HashMap::new()),
        }))
    }

    pub fn wallet(&self) -> &Wallet<C> {
        &self.wallet
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Unlocks the wallet if needed and starts the guardian loop.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.wallet.ensure_unlocked().await;
            loop {
                engine.guardian_tick();
                sleep(GUARDIAN_INTERVAL).await;
            }
        });
    }

    /// Creates a job: fresh deposit address, frozen fee quote, and a
    /// deposit monitor watching for funds.
    pub async fn create_job(
        self: &Arc<Self>,
        target_address: String,
        amount: Decimal,
        shard_count: Option<u32>,
        hop_count: Option<u32>,
    ) -> Result<Job, EngineError> {
        let deposit_address = self.wallet.new_address(AddressRole::Deposit).await?;

        let (default_shards, default_hops) = self.cfg.standard_tier();
        let shards = shard_count.filter(|s| *s > 0).unwrap_or(default_shards);
        let hops = hop_count.unwrap_or(default_hops);

        let quote = fee::quote(&self.cfg.fee, amount, shards, hops);
        let deposit_required =
            (amount + self.cfg.deposit_extra + quote.extra_to_service).round_dp(8);

        let job = Job::create(
            Uuid::new_v4().to_string(),
            target_address,
            amount,
            deposit_address,
            deposit_required,
            shards,
            hops,
            &quote,
            self.cfg.required_conf,
        );
        let job_id = job.job_id.clone();

        self.jobs.lock().insert(job_id.clone(), job.clone());
        self.save_state();
        info!(%job_id, %amount, shards, hops, "created mixing job");

        self.spawn_worker(&job_id, WorkerRole::Deposit);
        Ok(job)
    }

    /// A snapshot of one job.
    pub fn job(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().get(job_id).cloned()
    }

    /// Re-attaches the correct worker to a job. A no-op when one is
    /// already running; `false` when the job does not exist.
    pub fn resume(self: &Arc<Self>, job_id: &str) -> bool {
        let Some(job) = self.job(job_id) else {
            return false;
        };
        if self.workers.lock().contains_key(job_id) {
            return true;
        }

        let role = if job.txid1.is_some() {
            if job.has_shards() {
                Some(WorkerRole::Shard)
            } else {
                Some(WorkerRole::Confirm)
            }
        } else if matches!(
            job.status,
            JobStatus::WaitingDeposit | JobStatus::DepositReceived | JobStatus::Error
        ) {
            Some(WorkerRole::Deposit)
        } else {
            None
        };
        if let Some(role) = role {
            self.spawn_worker(job_id, role);
        }
        true
    }

    /// The pure function quote, plus where the miner rate came from.
    pub async fn quote(
        &self,
        amount: Decimal,
        shards: u32,
        hops: u32,
    ) -> (FeeQuote, FeeSource) {
        let quote = fee::quote(&self.cfg.fee, amount, shards, hops);
        (quote, self.wallet.fee_source().await)
    }

    /// Live chain numbers for the system endpoint.
    pub async fn system_status(&self) -> Result<NodeStatus, EngineError> {
        self.wallet.node_status().await
    }

    // ---- worker bookkeeping -------------------------------------------------

    /// Starts `role` for a job unless any worker is already attached.
    fn spawn_worker(self: &Arc<Self>, job_id: &str, role: WorkerRole) -> bool {
        {
            let mut workers = self.workers.lock();
            if workers.contains_key(job_id) {
                return false;
            }
            workers.insert(job_id.to_string(), role);
        }
        trace!(%job_id, ?role, "spawning worker");

        let engine = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            let result = match role {
                WorkerRole::Deposit => engine.run_deposit_monitor(&job_id).await,
                WorkerRole::Confirm => engine.run_confirm_watcher(&job_id).await,
                WorkerRole::Shard => engine.run_shard_worker(&job_id).await,
            };
            if let Err(err) = result {
                engine.fail_job(&job_id, &err);
            }
            engine.workers.lock().remove(&job_id);
        });
        true
    }

    /// Records a phase change of a running worker so the guardian
    /// does not schedule a duplicate.
    fn set_worker_role(&self, job_id: &str, role: WorkerRole) {
        self.workers.lock().insert(job_id.to_string(), role);
    }

    fn fail_job(&self, job_id: &str, err: &EngineError) {
        error!(%job_id, %err, "worker failed; job parked in error state");
        self.with_job(job_id, |job| job.fail(err.to_string()));
        self.save_state();
    }

    fn with_job<T>(&self, job_id: &str, f: impl FnOnce(&mut Job) -> T) -> Option<T> {
        self.jobs.lock().get_mut(job_id).map(f)
    }

    /// Serialises the whole jobs map and atomically replaces the
    /// state file. The jobs mutex is held across the write so
    /// concurrent saves cannot interleave.
    fn save_state(&self) {
        let jobs = self.jobs.lock();
        if let Err(err) = self.store.save(&jobs) {
            error!(%err, "state save failed");
        }
    }

    /// One guardian sweep: refresh poll stamps and re-attach missing
    /// workers per the state → worker map.
    fn guardian_tick(self: &Arc<Self>) {
        let ids: Vec<String> = self.jobs.lock().keys().cloned().collect();
        for job_id in ids {
            let Some(job) = self.job(&job_id) else {
                continue;
            };
            self.with_job(&job_id, |j| j.last_poll_at = Utc::now());
            if let Some(role) = worker_for(&job) {
                self.spawn_worker(&job_id, role);
            }
        }
        self.save_state();
    }

    // ---- deposit monitor (T1-T2) --------------------------------------------

    async fn run_deposit_monitor(&self, job_id: &str) -> Result<(), EngineError> {
        let Some(job) = self.job(job_id) else {
            return Ok(());
        };
        let deposit = [job.deposit_address.clone()];
        let required = job.deposit_required;

        self.with_job(job_id, |j| j.advance(JobStatus::WaitingDeposit));
        self.save_state();

        loop {
            let utxos = self.wallet.list_unspent_for(&deposit, 0).await?;
            let mut total: Decimal = utxos.iter().map(|u| u.amount).sum();

            if total == Decimal::ZERO {
                // The deposit may have arrived and been spent by a
                // prior incarnation; cumulative receipts tell.
                let received = self
                    .wallet
                    .received_by(&deposit[0], 0)
                    .await
                    .unwrap_or(Decimal::ZERO);
                if received >= required {
                    self.with_job(job_id, |j| j.advance(JobStatus::DepositReceived));
                    self.save_state();
                    // Step 1 either succeeds on remaining UTXOs or
                    // fails into the txid1-reconstruction path.
                    self.execute_mixing(job_id).await?;
                    return Ok(());
                }

                // Some nodes answer by-address queries unreliably;
                // fall back to scanning the whole wallet.
                let all = self.wallet.list_unspent(0).await?;
                total = all
                    .iter()
                    .filter(|u| u.address.as_deref() == Some(deposit[0].as_str()))
                    .map(|u| u.amount)
                    .sum();
            }

            self.with_job(job_id, |j| j.deposit_received = total);

            if total >= required {
                self.with_job(job_id, |j| j.advance(JobStatus::DepositReceived));
                let ready = self
                    .wallet
                    .list_unspent_for(&deposit, self.cfg.minconf)
                    .await?;
                if !ready.is_empty() {
                    self.save_state();
                    self.execute_mixing(job_id).await?;
                    return Ok(());
                }
                // Not confirmed enough for step 1 yet; keep waiting.
            }
            self.save_state();
            sleep(self.cfg.poll_interval).await;
        }
    }

    // ---- step-1 consolidation through completion (T3-T10) -------------------

    async fn execute_mixing(&self, job_id: &str) -> Result<(), EngineError> {
        self.wallet.ensure_unlocked().await;
        let Some(job) = self.job(job_id) else {
            return Ok(());
        };
        self.with_job(job_id, |j| j.advance(JobStatus::MixingStep1));
        self.save_state();

        let deposit = [job.deposit_address.clone()];
        let utxos = self
            .wallet
            .list_unspent_for(&deposit, self.cfg.minconf)
            .await?;
        if utxos.is_empty() {
            return Err(EngineError::NoUtxos(job.deposit_address.clone()));
        }

        let mix_address = self.wallet.new_address(AddressRole::Mix).await?;
        self.with_job(job_id, |j| {
            j.mix_address = Some(mix_address.clone());
            j.touch();
        });
        self.save_state();

        let mut outputs = OutputList::new();
        outputs.credit(&mix_address, job.amount);
        let plan = DeductionPlan {
            enabled: true,
            mode: self.cfg.deduction.mode,
            percent: job.fee_percent,
            address: self.cfg.deduction.address.clone(),
            primary: Some(mix_address.clone()),
        };
        let mut outputs = self
            .wallet
            .apply_deduction_outputs(job.amount, outputs, &plan)
            .await?;

        if let Some(fee_address) = self.cfg.fee_address.as_deref() {
            if job.extra_service_fee > Decimal::ZERO
                && self.wallet.validate_address(fee_address).await.unwrap_or(false)
            {
                outputs.credit(fee_address, job.extra_service_fee);
            }
        }

        // Greedy selection by descending amount, re-estimating the
        // miner fee as inputs join (+1 output for prospective change).
        let mut candidates = utxos;
        candidates.sort_by(|a, b| b.amount.cmp(&a.amount));
        let n_outputs = outputs.len();
        let mut selected: Vec<TxInput> = Vec::new();
        let mut total = Decimal::ZERO;
        let mut miner_fee = Decimal::ZERO;
        for utxo in &candidates {
            if utxo.amount <= Decimal::ZERO {
                continue;
            }
            selected.push(TxInput {
                txid: utxo.txid.clone(),
                vout: utxo.vout,
            });
            total += utxo.amount;
            miner_fee = self.wallet.estimate_fee(selected.len(), n_outputs + 1).await;
            if total >= outputs.total() + miner_fee {
                break;
            }
        }
        let required = outputs.total() + miner_fee;
        if total < required {
            return Err(EngineError::InsufficientFunds {
                available: total,
                required,
            });
        }

        let change = (total - required).round_dp(8);
        if change > Decimal::ZERO {
            if change <= self.cfg.dust_floor {
                outputs.credit(&mix_address, change);
            } else {
                let change_address = self.wallet.new_address(AddressRole::Change).await?;
                outputs.credit(&change_address, change);
            }
        }

        let hex = self.wallet.build_and_sign(&selected, &outputs).await?;
        let txid1 = self.wallet.broadcast(&hex).await?;
        info!(%job_id, %txid1, "step-1 consolidation broadcast");
        self.with_job(job_id, |j| {
            // txid1 is immutable once set.
            if j.txid1.is_none() {
                j.txid1 = Some(txid1.clone());
            }
            j.touch();
        });
        self.save_state();

        self.with_job(job_id, |j| j.advance(JobStatus::WaitingConfirmations));
        self.set_worker_role(job_id, WorkerRole::Confirm);
        self.save_state();

        let src = self.wait_step1_confirmations(job_id, &txid1).await?;
        self.with_job(job_id, |j| j.advance(JobStatus::MixingStep2));
        self.save_state();
        self.execute_sharded_hops(job_id, &src).await?;
        self.with_job(job_id, |j| j.advance(JobStatus::Completed));
        self.save_state();
        info!(%job_id, "mixing complete");
        Ok(())
    }

    /// Polls `txid1` until it matures, then waits for the mix
    /// address to expose spendable UTXOs. Returns the step-2 source
    /// address.
    async fn wait_step1_confirmations(
        &self,
        job_id: &str,
        txid1: &str,
    ) -> Result<String, EngineError> {
        let min_needed = self.cfg.required_conf.max(self.cfg.minconf_step2) as i64;
        loop {
            let confirmations = self.wallet.get_transaction(txid1).await?.confirmations;
            self.with_job(job_id, |j| {
                j.confirmations = confirmations;
                j.touch();
            });
            self.save_state();
            if confirmations >= min_needed {
                break;
            }
            sleep(self.cfg.poll_interval).await;
        }

        let src = self
            .job(job_id)
            .and_then(|j| j.mix_address)
            .or_else(|| self.cfg.primary_address.clone())
            .unwrap_or_default();
        let addrs = [src.clone()];
        loop {
            let ready = self
                .wallet
                .list_unspent_for(&addrs, self.cfg.minconf_step2)
                .await?;
            if !ready.is_empty() {
                break;
            }
            sleep(self.cfg.poll_interval).await;
            self.save_state();
        }
        Ok(src)
    }

    async fn run_confirm_watcher(&self, job_id: &str) -> Result<(), EngineError> {
        let Some(job) = self.job(job_id) else {
            return Ok(());
        };
        let Some(txid1) = job.txid1.clone() else {
            return Ok(());
        };
        let src = self.wait_step1_confirmations(job_id, &txid1).await?;
        self.with_job(job_id, |j| j.advance(JobStatus::MixingStep2));
        self.save_state();
        self.execute_sharded_hops(job_id, &src).await?;
        self.with_job(job_id, |j| j.advance(JobStatus::Completed));
        self.save_state();
        Ok(())
    }

    async fn run_shard_worker(&self, job_id: &str) -> Result<(), EngineError> {
        let Some(job) = self.job(job_id) else {
            return Ok(());
        };
        let Some(mix_address) = job.mix_address.clone() else {
            return Ok(());
        };
        self.with_job(job_id, |j| j.advance(JobStatus::MixingStep2));
        self.save_state();
        self.execute_sharded_hops(job_id, &mix_address).await?;
        self.with_job(job_id, |j| j.advance(JobStatus::Completed));
        self.save_state();
        Ok(())
    }

    // ---- sharded fanout + hops (T8-T10) -------------------------------------

    /// Live UTXOs whose txids belong to this job's fanout or hop
    /// chains: the resume points of in-flight shards. The mix
    /// address itself is excluded; whatever sits there is handled by
    /// fanout creation.
    async fn derive_shard_sources(&self, job_id: &str) -> Result<Vec<ShardSource>, EngineError> {
        let Some(job) = self.job(job_id) else {
            return Ok(Vec::new());
        };
        let utxos = self.wallet.list_unspent(self.cfg.minconf_shard).await?;

        let mut known: HashSet<&str> = job.shard_txids_fanout.iter().map(String::as_str).collect();
        for hops in &job.shard_txids_hops {
            known.extend(hops.iter().map(String::as_str));
        }

        Ok(utxos
            .into_iter()
            .filter_map(|u| {
                if !known.contains(u.txid.as_str()) || u.amount <= Decimal::ZERO {
                    return None;
                }
                let address = u.address?;
                if Some(address.as_str()) == job.mix_address.as_deref() {
                    return None;
                }
                Some(ShardSource {
                    address,
                    amount: u.amount,
                    txid: u.txid,
                })
            })
            .collect())
    }

    async fn execute_sharded_hops(&self, job_id: &str, src_addr: &str) -> Result<(), EngineError> {
        let fee_hint = self.cfg.fee.tx_fee_per_tx;

        // 1. Pick in-flight shards back up. Shards fail in isolation;
        //    the rest keep moving.
        for entry in self.derive_shard_sources(job_id).await? {
            if let Err(err) = self.process_shard_sequence(job_id, entry).await {
                warn!(%job_id, %err, "shard resume failed, continuing with remaining shards");
            }
        }

        // 2. Fan remaining mix funds out into the missing shards.
        let addrs = [src_addr.to_string()];
        let utxos = self
            .wallet
            .list_unspent_for(&addrs, self.cfg.minconf_step2)
            .await?;
        if !utxos.is_empty() {
            let available: Decimal = utxos.iter().map(|u| u.amount).sum();
            let Some(job) = self.job(job_id) else {
                return Ok(());
            };
            let done = job.shard_txids_fanout.len() as u32;
            let remaining = job.shard_count.saturating_sub(done).max(1);
            let amounts = compute_shard_amounts(available, remaining);

            // Shard + hops + change headroom per path.
            self.wallet
                .prefetch_addresses(amounts.len() * (job.hop_count as usize + 4))
                .await;

            for (idx, amount) in amounts.into_iter().enumerate() {
                let shard_no = done as usize + idx + 1;
                let shard_address = self.wallet.new_address(AddressRole::Shard(shard_no)).await?;
                let txid = self
                    .single_send_from(
                        &addrs,
                        amount,
                        fee_hint,
                        &shard_address,
                        self.cfg.minconf_shard,
                        SendOptions {
                            drain: true,
                            change_to: Some(src_addr),
                        },
                    )
                    .await?;
                self.with_job(job_id, |j| {
                    j.shard_txids_fanout.push(txid.clone());
                    j.touch();
                });
                self.save_state();

                let entry = ShardSource {
                    address: shard_address,
                    amount,
                    txid,
                };
                if let Err(err) = self.process_shard_sequence(job_id, entry).await {
                    warn!(%job_id, %err, "shard sequence failed, continuing with remaining shards");
                }
            }
        }
        self.save_state();
        Ok(())
    }

    /// Runs one shard from its current position: the remaining hops,
    /// then the final delivery. A shard whose funds are consumed by
    /// fees short-circuits as progress-completed without a final tx.
    async fn process_shard_sequence(
        &self,
        job_id: &str,
        entry: ShardSource,
    ) -> Result<(), EngineError> {
        let Some(job) = self.job(job_id) else {
            return Ok(());
        };
        let fee_hint = self.cfg.fee.tx_fee_per_tx;
        let minconf = self.cfg.minconf_shard;

        let (slot, hops_done) = self
            .with_job(job_id, |j| locate_hop_slot(j, &entry.txid))
            .unwrap_or((0, 0));
        let hops_needed = (job.hop_count as usize).saturating_sub(hops_done);

        let mut source = entry.address;
        let mut amount = entry.amount;
        for _ in 0..hops_needed {
            if amount <= fee_hint {
                return self.complete_shard_degraded(job_id).await;
            }
            let next = self.wallet.new_address(AddressRole::Hop).await?;
            let txid = self
                .single_send_from(
                    &[source.clone()],
                    amount.max(Decimal::ZERO).round_dp(8),
                    fee_hint,
                    &next,
                    minconf,
                    SendOptions {
                        drain: true,
                        change_to: None,
                    },
                )
                .await?;
            self.with_job(job_id, |j| {
                if let Some(hops) = j.shard_txids_hops.get_mut(slot) {
                    hops.push(txid.clone());
                }
                j.touch();
            });
            self.save_state();
            source = next;
            amount = (amount - fee_hint).max(Decimal::ZERO).round_dp(8);
        }

        if amount <= fee_hint {
            return self.complete_shard_degraded(job_id).await;
        }
        let final_txid = self
            .single_send_from(
                &[source],
                amount.max(Decimal::ZERO).round_dp(8),
                fee_hint,
                &job.target_address,
                minconf,
                SendOptions {
                    drain: true,
                    change_to: None,
                },
            )
            .await?;
        info!(%job_id, %final_txid, "shard delivered to target");
        self.with_job(job_id, |j| {
            j.shard_txids_final.push(final_txid.clone());
            j.txid2 = Some(final_txid.clone());
            j.shard_progress_completed += 1;
            j.touch();
        });
        self.save_state();
        Ok(())
    }

    /// Fees ate the shard; count it done so the job can finish.
    async fn complete_shard_degraded(&self, job_id: &str) -> Result<(), EngineError> {
        warn!(%job_id, "shard funds consumed by fees; counting as completed without final tx");
        self.with_job(job_id, |j| {
            j.shard_progress_completed += 1;
            j.touch();
        });
        self.save_state();
        Ok(())
    }

    /// One transfer with greedy coin selection, fee re-estimation,
    /// dust-folding change, and the unconfirmed-chain broadcast
    /// retry (wait, then once more at minconf 1).
    async fn single_send_from(
        &self,
        from: &[String],
        amount: Decimal,
        fee_hint: Decimal,
        to: &str,
        min_confirms: u32,
        opts: SendOptions<'_>,
    ) -> Result<String, EngineError> {
        let mut minconf = min_confirms;
        loop {
            let mut candidates = self.wallet.list_unspent_for(from, minconf).await?;
            if candidates.is_empty() {
                return Err(EngineError::NoUtxos(from.join(",")));
            }
            candidates.sort_by(|a, b| b.amount.cmp(&a.amount));

            let mut send_amount = amount;
            let target = send_amount + fee_hint;
            let mut selected: Vec<TxInput> = Vec::new();
            let mut total = Decimal::ZERO;
            for utxo in &candidates {
                if utxo.amount <= Decimal::ZERO {
                    continue;
                }
                selected.push(TxInput {
                    txid: utxo.txid.clone(),
                    vout: utxo.vout,
                });
                total += utxo.amount;
                if total >= target {
                    break;
                }
            }
            if total < target {
                if opts.drain {
                    // Terminal transfer: spend whatever is there.
                    send_amount = (total - fee_hint).max(Decimal::ZERO);
                } else {
                    return Err(EngineError::InsufficientFunds {
                        available: total,
                        required: target,
                    });
                }
            }

            let mut outputs = OutputList::new();
            outputs.credit(to, send_amount);

            // True miner fee for the actual shape, extending the
            // selection when it outgrows the hint.
            let mut miner_fee = self.wallet.estimate_fee(selected.len(), 2).await;
            let mut need = send_amount + miner_fee;
            if total < need {
                for utxo in &candidates {
                    if utxo.amount <= Decimal::ZERO
                        || selected
                            .iter()
                            .any(|i| i.txid == utxo.txid && i.vout == utxo.vout)
                    {
                        continue;
                    }
                    selected.push(TxInput {
                        txid: utxo.txid.clone(),
                        vout: utxo.vout,
                    });
                    total += utxo.amount;
                    miner_fee = self.wallet.estimate_fee(selected.len(), 2).await;
                    need = send_amount + miner_fee;
                    if total >= need {
                        break;
                    }
                }
            }

            let change = (total - (send_amount + miner_fee)).round_dp(8);
            if change > Decimal::ZERO {
                if change <= self.cfg.dust_floor {
                    outputs.credit(to, change);
                } else {
                    match opts.change_to {
                        Some(address) => outputs.credit(address, change),
                        None => {
                            let change_address =
                                self.wallet.new_address(AddressRole::Change).await?;
                            outputs.credit(&change_address, change);
                        }
                    }
                }
            }

            let hex = self.wallet.build_and_sign(&selected, &outputs).await?;
            match self.wallet.broadcast(&hex).await {
                Ok(txid) => return Ok(txid),
                Err(err) => {
                    if minconf == 0 {
                        warn!(%err, "broadcast failed at minconf 0; waiting for confirmed inputs");
                        let mut upgraded = false;
                        for _ in 0..BROADCAST_RETRY_POLLS {
                            sleep(self.cfg.poll_interval).await;
                            if !self.wallet.list_unspent_for(from, 1).await?.is_empty() {
                                minconf = 1;
                                upgraded = true;
                                break;
                            }
                        }
                        if upgraded {
                            continue;
                        }
                    }
                    return Err(EngineError::BroadcastFailed {
                        minconf,
                        inputs: selected.len(),
                        outputs: outputs.len(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    // ---- status reconciliation & crash recovery -----------------------------

    /// The full status read: lazy completion promotion, live RPC
    /// probes, and the on-chain recovery scans. Probe failures
    /// degrade to defaults; they never fail the read.
    pub async fn status_view(&self, job_id: &str) -> Result<StatusView, EngineError> {
        let Some(job) = self.job(job_id) else {
            return Err(EngineError::UnknownJob(job_id.to_string()));
        };

        if job.status != JobStatus::Completed
            && !job.shard_txids_final.is_empty()
            && job.shard_txids_final.len() as u32 >= job.shard_count
        {
            self.with_job(job_id, |j| j.advance(JobStatus::Completed));
            self.save_state();
        }

        let mut mix_utxo_ready = false;
        let mut shard_ready_count = 0;
        let mut deposit_confirmations = 0;

        if let Some(mix_address) = job.mix_address.clone() {
            if let Ok(utxos) = self
                .wallet
                .list_unspent_for(&[mix_address], self.cfg.minconf_step2)
                .await
            {
                mix_utxo_ready = !utxos.is_empty();
            }
        }
        if job.has_shards() {
            if let Ok(all) = self.wallet.list_unspent(self.cfg.minconf_shard).await {
                let fanout: HashSet<&str> =
                    job.shard_txids_fanout.iter().map(String::as_str).collect();
                shard_ready_count = all
                    .iter()
                    .filter(|u| fanout.contains(u.txid.as_str()) && u.amount > Decimal::ZERO)
                    .count();
            }
        }
        if let Ok(utxos) = self
            .wallet
            .list_unspent_for(&[job.deposit_address.clone()], 0)
            .await
        {
            deposit_confirmations = utxos.iter().map(|u| u.confirmations).max().unwrap_or(0);
        }

        // Status reads race the confirm watcher's poll; query live so
        // the UI never lags a whole poll period.
        if job.status == JobStatus::WaitingConfirmations {
            if let Some(txid1) = job.txid1.as_deref() {
                if let Ok(tx) = self.wallet.get_transaction(txid1).await {
                    self.with_job(job_id, |j| j.confirmations = tx.confirmations);
                }
            }
        }

        if job.txid1.is_none() {
            self.recover_txid1(job_id).await;
        }
        self.backfill_finals(job_id).await;

        let job = self
            .job(job_id)
            .ok_or_else(|| EngineError::UnknownJob(job_id.to_string()))?;
        Ok(StatusView {
            job,
            mix_utxo_ready,
            shard_ready_count,
            deposit_confirmations,
        })
    }

    /// Crash recovery: the deposit was fully spent but `txid1` was
    /// never recorded. The wallet, not our state, knows what
    /// happened; find the transaction that spent a deposit output
    /// and adopt it.
    async fn recover_txid1(&self, job_id: &str) {
        let Some(job) = self.job(job_id) else {
            return;
        };
        if job.txid1.is_some() {
            return;
        }
        let deposit = [job.deposit_address.clone()];
        let Ok(unspent) = self.wallet.list_unspent_for(&deposit, 0).await else {
            return;
        };
        if !unspent.is_empty() {
            return;
        }
        let Ok(received) = self.wallet.received_by(&deposit[0], 0).await else {
            return;
        };
        if received < job.deposit_required {
            return;
        }

        let Ok(history) = self.wallet.list_transactions(TXID1_SCAN_WINDOW).await else {
            return;
        };
        for entry in history.iter().rev() {
            let Some(txid) = entry.txid.as_deref() else {
                continue;
            };
            let Ok(tx) = self.wallet.raw_transaction(txid).await else {
                continue;
            };
            for vin in &tx.vin {
                let (Some(prev_txid), Some(prev_vout)) = (vin.txid.as_deref(), vin.vout) else {
                    continue;
                };
                let Ok(prev) = self.wallet.raw_transaction(prev_txid).await else {
                    continue;
                };
                let Some(spent) = prev.vout.get(prev_vout as usize) else {
                    continue;
                };
                let pays_deposit = spent
                    .script_pub_key
                    .addresses
                    .as_ref()
                    .is_some_and(|addrs| addrs.iter().any(|a| *a == job.deposit_address));
                if !pays_deposit {
                    continue;
                }

                info!(%job_id, %txid, "reconstructed step-1 txid from wallet history");
                self.with_job(job_id, |j| {
                    if j.txid1.is_none() {
                        j.txid1 = Some(txid.to_string());
                    }
                    j.touch();
                });

                // If the finals already exist in history, the whole
                // job happened before the crash.
                match self.wallet.list_transactions(COMPLETION_SCAN_WINDOW).await {
                    Ok(recent) => {
                        let finals: Vec<String> = recent
                            .iter()
                            .filter(|t| {
                                t.category == TransactionCategory::Send
                                    && t.address.as_deref() == Some(job.target_address.as_str())
                            })
                            .filter_map(|t| t.txid.clone())
                            .collect();
                        if finals.len() as u32 >= job.shard_count {
                            self.with_job(job_id, |j| {
                                j.txid2 = finals.first().cloned();
                                j.shard_txids_final = finals.clone();
                                j.advance(JobStatus::Completed);
                            });
                        } else if job.status == JobStatus::WaitingDeposit {
                            self.with_job(job_id, |j| {
                                j.advance(JobStatus::WaitingConfirmations)
                            });
                        }
                    }
                    Err(_) => {
                        if job.status == JobStatus::WaitingDeposit {
                            self.with_job(job_id, |j| {
                                j.advance(JobStatus::WaitingConfirmations)
                            });
                        }
                    }
                }
                self.save_state();
                return;
            }
        }
    }

    /// Back-fills `shard_txids_final` from recent wallet traffic to
    /// the target address, promoting to completed once enough exist.
    async fn backfill_finals(&self, job_id: &str) {
        let Some(job) = self.job(job_id) else {
            return;
        };
        let Ok(recent) = self.wallet.list_transactions(BACKFILL_SCAN_WINDOW).await else {
            return;
        };
        let mut seen = HashSet::new();
        let finals: Vec<String> = recent
            .iter()
            .filter(|t| {
                matches!(
                    t.category,
                    TransactionCategory::Send | TransactionCategory::Receive
                ) && t.address.as_deref() == Some(job.target_address.as_str())
            })
            .filter_map(|t| t.txid.clone())
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if finals.is_empty() {
            return;
        }

        let complete = finals.len() as u32 >= job.shard_count.max(1);
        self.with_job(job_id, |j| {
            j.shard_txids_final = finals.clone();
            if j.txid2.is_none() {
                j.txid2 = finals.last().cloned();
            }
            if complete && j.status != JobStatus::Completed {
                j.advance(JobStatus::Completed);
            } else {
                j.touch();
            }
        });
        self.save_state();
    }
}

/// The guardian's state → worker map. A job with a live worker never
/// gets a second one; this only decides what to start when none is
/// attached.
fn worker_for(job: &Job) -> Option<WorkerRole> {
    let has_shards = job.has_shards();
    match job.status {
        JobStatus::WaitingDeposit | JobStatus::DepositReceived if job.txid1.is_none() => {
            Some(WorkerRole::Deposit)
        }
        JobStatus::WaitingConfirmations if job.txid1.is_some() => Some(WorkerRole::Confirm),
        JobStatus::MixingStep2 | JobStatus::Error if has_shards => Some(WorkerRole::Shard),
        JobStatus::Error | JobStatus::WaitingDeposit if job.txid1.is_some() && !has_shards => {
            Some(WorkerRole::Confirm)
        }
        _ => None,
    }
}

/// Finds (or creates) the hop list this source transaction belongs
/// to: by hop-txid membership first, then by fanout position, else a
/// fresh slot. Returns `(slot index, hops already done)`.
fn locate_hop_slot(job: &mut Job, txid: &str) -> (usize, usize) {
    for (i, hops) in job.shard_txids_hops.iter().enumerate() {
        if hops.iter().any(|t| t == txid) {
            return (i, hops.len());
        }
    }
    if let Some(fan_idx) = job.shard_txids_fanout.iter().position(|t| t == txid) {
        while job.shard_txids_hops.len() <= fan_idx {
            job.shard_txids_hops.push(Vec::new());
        }
        return (fan_idx, job.shard_txids_hops[fan_idx].len());
    }
    job.shard_txids_hops.push(Vec::new());
    (job.shard_txids_hops.len() - 1, 0)
}

/// Splits `total` into `shards` near-equal parts: the base is the
/// quantised even split, the last shard absorbs the rounding
/// remainder, zero parts are dropped.
fn compute_shard_amounts(total: Decimal, shards: u32) -> Vec<Decimal> {
    let shards = shards.max(1);
    let base = (total / Decimal::from(shards)).round_dp(8);
    let mut amounts = vec![base; (shards - 1) as usize];
    let last = (total - base * Decimal::from(shards - 1)).max(Decimal::ZERO);
    amounts.push(last);
    amounts
        .into_iter()
        .map(|a| a.round_dp(8))
        .filter(|a| *a > Decimal::ZERO)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{init_tracing, mock_config, MockNode},
        types::{DecodedInput, DecodedOutput, DecodedScript, DecodedTransaction},
    };
    use rust_decimal_macros::dec;

    fn engine_with(node: MockNode) -> Arc<Engine<MockNode>> {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::at_path(dir.path().join("jobs_state.json"));
        // The tempdir must outlive the engine; leak it for the test.
        std::mem::forget(dir);
        Engine::new(node, mock_config(), store).unwrap()
    }

    /// Inserts a job without attaching a worker, so tests can drive
    /// engine internals without a monitor racing them.
    fn seeded_job(engine: &Arc<Engine<MockNode>>, shards: u32, hops: u32) -> Job {
        let quote = fee::quote(&engine.config().fee, dec!(10), shards, hops);
        let job = Job::create(
            "job-seeded".to_string(),
            "8Ptarget".to_string(),
            dec!(10),
            "8Pdeposit".to_string(),
            dec!(10.1),
            shards,
            hops,
            &quote,
            6,
        );
        engine.jobs.lock().insert(job.job_id.clone(), job.clone());
        job
    }

    async fn wait_for_status(
        engine: &Arc<Engine<MockNode>>,
        job_id: &str,
        status: JobStatus,
    ) -> Job {
        for _ in 0..2_000 {
            let job = engine.job(job_id).unwrap();
            if job.status == status {
                return job;
            }
            if job.status == JobStatus::Error && status != JobStatus::Error {
                panic!("job failed: {:?}", job.error);
            }
            sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "job never reached {status:?}: {:?}",
            engine.job(job_id).unwrap()
        );
    }

    #[test]
    fn shard_amounts_split_evenly_with_remainder_on_last() {
        let amounts = compute_shard_amounts(dec!(10), 3);
        assert_eq!(amounts.len(), 3);
        assert_eq!(amounts[0], dec!(3.33333333));
        assert_eq!(amounts[1], dec!(3.33333333));
        assert_eq!(amounts[2], dec!(3.33333334));
        assert_eq!(amounts.iter().copied().sum::<Decimal>(), dec!(10));
    }

    #[test]
    fn shard_amounts_drop_zero_parts() {
        assert!(compute_shard_amounts(Decimal::ZERO, 4).is_empty());
        let single = compute_shard_amounts(dec!(0.5), 1);
        assert_eq!(single, vec![dec!(0.5)]);
    }

    #[test]
    fn worker_map_covers_recovery_states() {
        let quote = fee::quote(&mock_config().fee, dec!(10), 2, 1);
        let mut job = Job::create(
            "j".into(),
            "8Pt".into(),
            dec!(10),
            "8Pd".into(),
            dec!(10.1),
            2,
            1,
            &quote,
            6,
        );

        job.status = JobStatus::WaitingDeposit;
        assert_eq!(worker_for(&job), Some(WorkerRole::Deposit));

        job.txid1 = Some("tx1".into());
        assert_eq!(worker_for(&job), Some(WorkerRole::Confirm));

        job.status = JobStatus::WaitingConfirmations;
        assert_eq!(worker_for(&job), Some(WorkerRole::Confirm));

        job.status = JobStatus::Error;
        assert_eq!(worker_for(&job), Some(WorkerRole::Confirm));

        job.shard_txids_fanout.push("fan1".into());
        assert_eq!(worker_for(&job), Some(WorkerRole::Shard));

        job.status = JobStatus::MixingStep2;
        assert_eq!(worker_for(&job), Some(WorkerRole::Shard));

        job.status = JobStatus::Completed;
        assert_eq!(worker_for(&job), None);
    }

    #[test]
    fn hop_slot_location_prefers_existing_lists() {
        let quote = fee::quote(&mock_config().fee, dec!(10), 2, 2);
        let mut job = Job::create(
            "j".into(),
            "8Pt".into(),
            dec!(10),
            "8Pd".into(),
            dec!(10.1),
            2,
            2,
            &quote,
            6,
        );
        job.shard_txids_fanout = vec!["fanA".into(), "fanB".into()];
        job.shard_txids_hops = vec![vec!["hopA1".into()]];

        // Hop txid resumes its own chain.
        assert_eq!(locate_hop_slot(&mut job, "hopA1"), (0, 1));
        // Fanout txid maps by position, growing the table.
        assert_eq!(locate_hop_slot(&mut job, "fanB"), (1, 0));
        assert_eq!(job.shard_txids_hops.len(), 2);
        // Unknown txids get a fresh slot.
        assert_eq!(locate_hop_slot(&mut job, "stray"), (2, 0));
    }

    #[tokio::test]
    async fn mixing_runs_end_to_end() {
        init_tracing();
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = engine
            .create_job("8Ptarget".to_string(), dec!(20), Some(2), Some(1))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.deposit_required, dec!(20.1));
        assert_eq!(job.tx_count, 6);

        // Fund the deposit address and let the monitor take it away.
        node.add_utxo(&job.deposit_address, dec!(20.1), 6);
        let done = wait_for_status(&engine, &job.job_id, JobStatus::Completed).await;

        assert!(done.txid1.is_some());
        assert_eq!(done.shard_txids_fanout.len(), 2);
        assert_eq!(done.shard_txids_final.len(), 2);
        assert!(done.shard_txids_hops.iter().all(|h| h.len() <= 1));
        assert_eq!(done.shard_progress_completed, 2);
        assert_eq!(done.txid2, done.shard_txids_final.last().cloned());
        assert!(done.error.is_none());

        // Everything the target received is traceable to the finals.
        for txid in &done.shard_txids_final {
            assert!(node.broadcasts().contains(txid));
        }
        let delivered: Decimal = node
            .utxos_at("8Ptarget")
            .iter()
            .map(|u| u.amount)
            .sum();
        assert!(delivered > Decimal::ZERO);
        assert!(delivered <= dec!(20.1));
    }

    #[tokio::test]
    async fn single_shard_no_hops_is_two_transactions() {
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = engine
            .create_job("8Ptarget".to_string(), dec!(5), Some(1), Some(0))
            .await
            .unwrap();
        node.add_utxo(&job.deposit_address, job.deposit_required, 6);
        let done = wait_for_status(&engine, &job.job_id, JobStatus::Completed).await;

        assert_eq!(done.shard_txids_fanout.len(), 1);
        assert!(done.shard_txids_hops.iter().all(|h| h.is_empty()));
        assert_eq!(done.shard_txids_final.len(), 1);
        // Step 1 + fanout + final.
        assert_eq!(node.broadcasts().len(), 3);
    }

    #[tokio::test]
    async fn confirmation_wait_advances_with_the_chain() {
        init_tracing();
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        // Fresh outputs start unconfirmed; the chain only advances
        // while the workers poll.
        node.set_confirm_new_outputs(0);
        node.set_auto_mine(true);

        let job = engine
            .create_job("8Ptarget".to_string(), dec!(8), Some(1), Some(0))
            .await
            .unwrap();
        node.add_utxo(&job.deposit_address, job.deposit_required, 1);
        let done = wait_for_status(&engine, &job.job_id, JobStatus::Completed).await;

        assert!(done.confirmations >= 6);
        assert_eq!(done.shard_txids_final.len(), 1);
    }

    #[tokio::test]
    async fn broadcast_retry_upgrades_minconf() {
        init_tracing();
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        node.add_utxo("8Psource", dec!(1.0), 0);
        node.fail_next_broadcasts(1);
        node.set_auto_mine(true);

        let txid = engine
            .single_send_from(
                &["8Psource".to_string()],
                dec!(0.5),
                dec!(0.01),
                "8Pdest",
                0,
                SendOptions {
                    drain: true,
                    change_to: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(node.broadcasts(), vec![txid]);
    }

    #[tokio::test]
    async fn non_drain_send_fails_on_short_funds() {
        let node = MockNode::new();
        let engine = engine_with(node.clone());
        node.add_utxo("8Psource", dec!(0.3), 6);

        let err = engine
            .single_send_from(
                &["8Psource".to_string()],
                dec!(0.5),
                dec!(0.01),
                "8Pdest",
                1,
                SendOptions {
                    drain: false,
                    change_to: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert!(node.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn fee_exhausted_shard_degrades_without_final() {
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = seeded_job(&engine, 1, 3);
        let id = job.job_id.clone();
        engine.with_job(&id, |j| {
            j.shard_txids_fanout.push("fan1".to_string());
        });

        // Funds below the per-hop fee hint: the sequence stops and
        // counts the shard as done without a final tx.
        let entry = ShardSource {
            address: "8Pshard".to_string(),
            amount: dec!(0.005),
            txid: "fan1".to_string(),
        };
        engine.process_shard_sequence(&id, entry).await.unwrap();

        let job = engine.job(&id).unwrap();
        assert_eq!(job.shard_progress_completed, 1);
        assert!(job.shard_txids_final.is_empty());
        assert!(node.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn resume_is_noop_while_worker_runs() {
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = engine
            .create_job("8Ptarget".to_string(), dec!(5), Some(1), Some(0))
            .await
            .unwrap();
        // create_job attached the deposit monitor already.
        assert!(engine.workers.lock().contains_key(&job.job_id));
        assert!(engine.resume(&job.job_id));
        assert_eq!(engine.workers.lock().len(), 1);

        assert!(!engine.resume("no-such-job"));
    }

    #[tokio::test]
    async fn status_view_promotes_lazy_completion() {
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = seeded_job(&engine, 2, 0);
        let id = job.job_id.clone();
        engine.with_job(&id, |j| {
            j.status = JobStatus::MixingStep2;
            j.shard_txids_final = vec!["f1".to_string(), "f2".to_string()];
        });

        let view = engine.status_view(&id).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn crash_recovery_reconstructs_txid1_and_completion() {
        init_tracing();
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = seeded_job(&engine, 1, 0);
        let id = job.job_id.clone();

        // The deposit was received and fully spent by a prior
        // incarnation; only the wallet remembers how.
        node.set_received(&job.deposit_address, job.deposit_required);
        node.push_history(MockNode::send_entry("8Pelsewhere", "spend1", dec!(10)));
        node.push_history(MockNode::send_entry("8Ptarget", "final1", dec!(9.8)));

        node.insert_raw_transaction(
            "fund1",
            DecodedTransaction {
                txid: Some("fund1".to_string()),
                version: 101,
                locktime: 0,
                vin: vec![],
                vout: vec![DecodedOutput {
                    value: job.deposit_required,
                    n: 0,
                    script_pub_key: DecodedScript {
                        script_type: Some("pubkeyhash".to_string()),
                        addresses: Some(vec![job.deposit_address.clone()]),
                        ..DecodedScript::default()
                    },
                }],
                confirmations: Some(8),
                blockhash: None,
            },
        );
        node.insert_raw_transaction(
            "spend1",
            DecodedTransaction {
                txid: Some("spend1".to_string()),
                version: 101,
                locktime: 0,
                vin: vec![DecodedInput {
                    txid: Some("fund1".to_string()),
                    vout: Some(0),
                    sequence: 0xffff_ffff,
                }],
                vout: vec![],
                confirmations: Some(7),
                blockhash: None,
            },
        );
        node.insert_raw_transaction(
            "final1",
            DecodedTransaction {
                txid: Some("final1".to_string()),
                version: 101,
                locktime: 0,
                vin: vec![],
                vout: vec![],
                confirmations: Some(2),
                blockhash: None,
            },
        );

        let view = engine.status_view(&id).await.unwrap();
        assert_eq!(view.job.txid1.as_deref(), Some("spend1"));
        assert_eq!(view.job.status, JobStatus::Completed);
        assert_eq!(view.job.shard_txids_final, vec!["final1".to_string()]);
    }

    #[tokio::test]
    async fn status_view_probes_report_readiness() {
        let node = MockNode::new();
        let engine = engine_with(node.clone());

        let job = seeded_job(&engine, 2, 1);
        let id = job.job_id.clone();
        engine.with_job(&id, |j| {
            j.status = JobStatus::MixingStep2;
            j.mix_address = Some("8Pmix".to_string());
        });
        node.add_utxo("8Pmix", dec!(4.0), 6);
        node.add_utxo(&job.deposit_address, dec!(2.0), 3);
        let fan_txid = node.add_utxo("8Pshard1", dec!(2.0), 1);
        engine.with_job(&id, |j| j.shard_txids_fanout.push(fan_txid.clone()));

        let view = engine.status_view(&id).await.unwrap();
        assert!(view.mix_utxo_ready);
        assert_eq!(view.shard_ready_count, 1);
        assert_eq!(view.deposit_confirmations, 3);
    }
}
