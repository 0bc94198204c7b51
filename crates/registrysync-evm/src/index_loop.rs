//! The index loop: tails registry logs and projects them into the store.
//!
//! # One cycle
//! 1. Recovery pass: re-apply every event left `observed`.
//! 2. Read the chain head.
//! 3. Per contract, plan one block range shared by all its streams, starting
//!    after the slowest stream's cursor and capped by the contract's span
//!    (at most `batch_size`) and the confirmation depth.
//! 4. Fetch every contract concurrently, each under its own cycle deadline.
//!    A failed or timed-out stream holds back its contract for this cycle;
//!    other contracts proceed. A timeout halves that contract's span.
//! 5. Apply the contract hosting `ProjectCreated` first. Other contracts
//!    (the certificate contract) are applied only up to the block through
//!    which bindings are known, so a mint never overtakes its binding.
//! 6. Per contract, apply the merged logs in block/log order through the
//!    projector, then advance the stream checkpoints.
//!
//! Between cycles the loop sleeps `poll_interval_ms`. A shutdown request
//! moves the state to `Stopping` immediately, but the running cycle is
//! finished before the loop exits.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{StreamExt, TryStreamExt};
use tokio::sync::watch;

use registrysync_core::checkpoint::Checkpoint;
use registrysync_core::cursor::Cursor;
use registrysync_core::error::SyncError;
use registrysync_core::events::EventKind;
use registrysync_core::handler::HandlerRegistry;
use registrysync_core::indexer::{IndexerConfig, IndexerState};
use registrysync_core::projector::{IngestOutcome, Projector};
use registrysync_core::store::Store;
use registrysync_core::types::ChainEvent;

use crate::fetcher::RawLog;
use crate::ledger::LedgerClient;
use crate::stream::LogStream;

/// Concurrent `eth_getBlockByNumber` reads per stream fetch.
const TIMESTAMP_CONCURRENCY: usize = 8;

/// Summary of one polling cycle, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub head: u64,
    /// Events re-applied by the recovery pass.
    pub recovered: usize,
    /// Logs fetched and decoded.
    pub fetched: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub resumed: usize,
    /// Streams whose fetch failed or ran past the deadline.
    pub failed_streams: Vec<String>,
    /// Contracts whose batch stopped on an application error.
    pub stalled_contracts: Vec<String>,
}

/// A planned fetch for one stream.
struct StreamRange<'a> {
    stream: &'a LogStream,
    from: u64,
    to: u64,
}

/// Planned ranges of one contract, sharing one upper bound.
struct ContractPlan<'a> {
    address: String,
    ranges: Vec<StreamRange<'a>>,
    /// Hosts a `ProjectCreated` stream.
    binds: bool,
}

struct CyclePlan<'a> {
    /// Binding contracts first, then the rest by address.
    contracts: Vec<ContractPlan<'a>>,
    /// Cursor of every `ProjectCreated` stream, by stream id.
    binding_cursors: HashMap<String, u64>,
}

pub struct IndexLoop<L, S> {
    config: IndexerConfig,
    ledger: Arc<L>,
    store: Arc<S>,
    projector: Projector<S>,
    streams: Vec<LogStream>,
    state: watch::Sender<IndexerState>,
    /// Per-contract range span, lowered after deadline overruns.
    spans: Mutex<HashMap<String, u64>>,
}

impl<L, S> IndexLoop<L, S>
where
    L: LedgerClient + 'static,
    S: Store + 'static,
{
    pub fn new(
        config: IndexerConfig,
        ledger: Arc<L>,
        store: Arc<S>,
        handlers: HandlerRegistry,
        streams: Vec<LogStream>,
    ) -> Self {
        let (state, _) = watch::channel(IndexerState::Idle);
        Self {
            projector: Projector::new(Arc::clone(&store), Arc::new(handlers)),
            config,
            ledger,
            store,
            streams,
            state,
            spans: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> IndexerState {
        *self.state.borrow()
    }

    /// Receiver that follows every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<IndexerState> {
        self.state.subscribe()
    }

    pub fn streams(&self) -> &[LogStream] {
        &self.streams
    }

    fn set_state(&self, state: IndexerState) {
        self.state.send_replace(state);
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Cycle errors are logged and retried next cycle; they never stop the
    /// loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.set_state(IndexerState::Recovering);
        match self.projector.recover_pending(self.config.chain_id).await {
            Ok(n) => tracing::info!(recovered = n, "Start-up recovery complete"),
            Err(e) => tracing::warn!(error = %e, "Start-up recovery incomplete; retrying in cycle"),
        }

        self.set_state(IndexerState::Live);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            chain_id = self.config.chain_id,
            streams = self.streams.len(),
            poll_ms = self.config.poll_interval_ms,
            "Index loop started"
        );

        let mut stopping = *shutdown.borrow();
        while !stopping {
            let cycle = self.run_cycle();
            tokio::pin!(cycle);
            let result = loop {
                tokio::select! {
                    result = &mut cycle => break result,
                    changed = shutdown.changed(), if !stopping => {
                        stopping = changed.is_err() || *shutdown.borrow();
                        if stopping {
                            self.set_state(IndexerState::Stopping);
                            tracing::info!("Shutdown requested; finishing current cycle");
                        }
                    }
                }
            };
            match result {
                Ok(report) => tracing::debug!(
                    head = report.head,
                    fetched = report.fetched,
                    applied = report.applied,
                    duplicates = report.duplicates,
                    "Cycle complete"
                ),
                Err(e) => tracing::warn!(error = %e, retryable = e.is_retryable(), "Cycle failed"),
            }
            if stopping {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    stopping = changed.is_err() || *shutdown.borrow();
                }
            }
        }

        self.set_state(IndexerState::Stopping);
        tracing::info!("Index loop stopping");
        self.set_state(IndexerState::Stopped);
    }

    /// One polling cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let chain_id = self.config.chain_id;
        let mut report = CycleReport {
            recovered: self.projector.recover_pending(chain_id).await?,
            ..CycleReport::default()
        };

        report.head = self.ledger.current_height().await?;
        let CyclePlan {
            contracts,
            mut binding_cursors,
        } = self.plan(report.head).await?;
        if contracts.is_empty() {
            return Ok(report);
        }

        let deadline = Duration::from_millis(self.config.cycle_deadline_ms);
        let fetched = join_all(contracts.iter().map(|c| self.fetch_contract(c, deadline))).await;

        for (contract, results) in contracts.iter().zip(fetched) {
            let mut events = Vec::new();
            let mut failed = false;
            for (range, result) in contract.ranges.iter().zip(results) {
                match result {
                    Ok(mut batch) => events.append(&mut batch),
                    Err(e) => {
                        tracing::warn!(
                            stream = %range.stream.id,
                            from = range.from,
                            to = range.to,
                            error = %e,
                            "Log fetch failed; stream will be re-fetched"
                        );
                        report.failed_streams.push(range.stream.id.clone());
                        failed = true;
                    }
                }
            }
            if failed {
                continue;
            }

            // Events past the known bindings wait for the binding contract.
            let limit = if contract.binds {
                None
            } else {
                binding_cursors.values().min().copied()
            };
            if let Some(limit) = limit {
                events.retain(|e| e.block_number <= limit);
            }

            report.fetched += events.len();
            events.sort_by_key(|e| (e.block_number, e.log_index));
            if let Err(e) = self.apply(&events, &mut report).await {
                tracing::warn!(
                    contract = %contract.address,
                    error = %e,
                    "Batch application stopped; checkpoints held"
                );
                report.stalled_contracts.push(contract.address.clone());
                continue;
            }

            let mut reached = None;
            for range in &contract.ranges {
                let to = limit.map_or(range.to, |limit| range.to.min(limit));
                if to < range.from {
                    continue;
                }
                self.store
                    .save_checkpoint(Checkpoint::now(chain_id, range.stream.id.clone(), to))
                    .await?;
                if let Some(cursor) = binding_cursors.get_mut(&range.stream.id) {
                    *cursor = (*cursor).max(to);
                }
                reached = reached.max(Some(to));
            }
            match reached {
                Some(to) => tracing::info!(
                    contract = %contract.address,
                    to,
                    logs = events.len(),
                    "Batch applied"
                ),
                None => tracing::debug!(
                    contract = %contract.address,
                    "Waiting for bindings before applying"
                ),
            }
        }

        Ok(report)
    }

    /// Cursor of a stream: checkpoint, else the last recorded block of the
    /// stream (re-scanned), else the block before `start_block`.
    pub async fn stream_cursor(&self, stream: &LogStream) -> Result<Cursor, SyncError> {
        let depth = self.config.confirmation_depth;
        let chain_id = self.config.chain_id;
        if let Some(cp) = self.store.load_checkpoint(chain_id, &stream.id).await? {
            return Ok(Cursor::new(cp.block_number, depth));
        }
        let recorded = self
            .store
            .max_event_block(chain_id, &stream.address, stream.kind().name())
            .await?;
        Ok(match recorded {
            Some(block) => Cursor::new(
                block
                    .saturating_sub(1)
                    .max(self.config.start_block.saturating_sub(1)),
                depth,
            ),
            None => Cursor::before(self.config.start_block, depth),
        })
    }

    /// Current range span of a contract.
    pub fn span(&self, address: &str) -> u64 {
        self.spans
            .lock()
            .ok()
            .and_then(|spans| spans.get(address).copied())
            .unwrap_or(self.config.batch_size)
    }

    fn set_span(&self, address: &str, span: u64) {
        if let Ok(mut spans) = self.spans.lock() {
            if span >= self.config.batch_size {
                spans.remove(address);
            } else {
                spans.insert(address.to_string(), span.max(1));
            }
        }
    }

    async fn plan(&self, head: u64) -> Result<CyclePlan<'_>, SyncError> {
        let mut by_address: HashMap<&str, Vec<(&LogStream, Cursor)>> = HashMap::new();
        let mut binding_cursors = HashMap::new();
        for stream in &self.streams {
            let cursor = self.stream_cursor(stream).await?;
            if stream.kind() == EventKind::ProjectCreated {
                binding_cursors.insert(stream.id.clone(), cursor.block_number);
            }
            by_address
                .entry(stream.address.as_str())
                .or_default()
                .push((stream, cursor));
        }

        let mut contracts = Vec::new();
        for (address, streams) in by_address {
            let Some(slowest) = streams.iter().map(|(_, c)| *c).min_by_key(|c| c.block_number)
            else {
                continue;
            };
            let Some((_, to)) = slowest.next_range(head, self.span(address)) else {
                continue;
            };
            let binds = streams
                .iter()
                .any(|(s, _)| s.kind() == EventKind::ProjectCreated);
            let ranges: Vec<StreamRange<'_>> = streams
                .into_iter()
                .filter(|(_, c)| c.block_number < to)
                .map(|(stream, c)| StreamRange {
                    stream,
                    from: c.block_number + 1,
                    to,
                })
                .collect();
            contracts.push(ContractPlan {
                address: address.to_string(),
                ranges,
                binds,
            });
        }
        contracts.sort_by(|a, b| b.binds.cmp(&a.binds).then_with(|| a.address.cmp(&b.address)));

        Ok(CyclePlan {
            contracts,
            binding_cursors,
        })
    }

    /// Fetch every range of one contract under `deadline`.
    ///
    /// A timeout fails every range of the contract and halves its span;
    /// a clean fetch doubles the span back towards `batch_size`.
    async fn fetch_contract(
        &self,
        contract: &ContractPlan<'_>,
        deadline: Duration,
    ) -> Vec<Result<Vec<ChainEvent>, SyncError>> {
        let fetches = join_all(contract.ranges.iter().map(|r| self.fetch(r)));
        let span = self.span(&contract.address);
        match tokio::time::timeout(deadline, fetches).await {
            Ok(results) => {
                if span < self.config.batch_size && results.iter().all(Result::is_ok) {
                    self.set_span(&contract.address, span.saturating_mul(2));
                }
                results
            }
            Err(_) => {
                let halved = (span / 2).max(1);
                tracing::warn!(
                    contract = %contract.address,
                    deadline_ms = self.config.cycle_deadline_ms,
                    span = halved,
                    "Fetch exceeded the cycle deadline; narrowing range"
                );
                self.set_span(&contract.address, halved);
                contract
                    .ranges
                    .iter()
                    .map(|_| {
                        Err(SyncError::Network(format!(
                            "fetch exceeded the {}ms cycle deadline",
                            self.config.cycle_deadline_ms
                        )))
                    })
                    .collect()
            }
        }
    }

    async fn fetch(&self, range: &StreamRange<'_>) -> Result<Vec<ChainEvent>, SyncError> {
        let stream = range.stream;
        let logs = self
            .ledger
            .get_logs(&stream.address, &stream.topic0, range.from, range.to)
            .await?;

        let logs = logs
            .iter()
            .filter(|l| !l.is_removed())
            .map(|l| l.block_number_u64().map(|block| (l, block)))
            .collect::<Result<Vec<_>, SyncError>>()?;
        let blocks: BTreeSet<u64> = logs.iter().map(|(_, block)| *block).collect();
        let timestamps: HashMap<u64, i64> = futures::stream::iter(blocks)
            .map(|block| async move {
                self.ledger
                    .block_timestamp(block)
                    .await
                    .map(|ts| (block, ts))
            })
            .buffer_unordered(TIMESTAMP_CONCURRENCY)
            .try_collect()
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for (log, block_number) in logs {
            let block_timestamp = timestamps.get(&block_number).copied().unwrap_or_default();
            match self.to_chain_event(stream, log, block_number, block_timestamp) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(
                    stream = %stream.id,
                    tx = %log.tx_hash,
                    log_index = %log.log_index,
                    error = %e,
                    "Undecodable log skipped"
                ),
            }
        }
        Ok(events)
    }

    fn to_chain_event(
        &self,
        stream: &LogStream,
        log: &RawLog,
        block_number: u64,
        block_timestamp: i64,
    ) -> Result<ChainEvent, SyncError> {
        let payload = stream.schema.decode_log(&log.topics, &log.data)?;
        let on_chain_project_id = payload
            .get("projectId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());
        Ok(ChainEvent {
            chain_id: self.config.chain_id,
            tx_hash: log.tx_hash.to_ascii_lowercase(),
            log_index: log.log_index_u32()?,
            address: stream.address.clone(),
            event_name: stream.kind().name().to_string(),
            on_chain_project_id,
            payload,
            block_number,
            block_timestamp,
        })
    }

    async fn apply(&self, events: &[ChainEvent], report: &mut CycleReport) -> Result<(), SyncError> {
        for event in events {
            match self.projector.ingest(event).await? {
                IngestOutcome::Applied => report.applied += 1,
                IngestOutcome::Duplicate => report.duplicates += 1,
                IngestOutcome::Resumed => report.resumed += 1,
            }
        }
        Ok(())
    }
}
