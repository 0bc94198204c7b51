//! End-to-end index loop scenarios against a scripted ledger.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use async_trait::async_trait;

use registrysync_core::checkpoint::CheckpointStore;
use registrysync_core::error::SyncError;
use registrysync_core::events::EventKind;
use registrysync_core::indexer::IndexerState;
use registrysync_core::memory::MemoryStore;
use registrysync_core::reconciler::tagged_metadata_uri;
use registrysync_core::store::{FundingStore, ProjectStore, RatingStore};
use registrysync_core::types::{OnChainProject, Project, ProjectStatus};
use registrysync_evm::abi::EventSchema;
use registrysync_evm::fetcher::{to_hex_quantity, RawLog};
use registrysync_evm::{IndexLoop, IndexerBuilder, LedgerClient, LogStream};

const REGISTRY: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
const CERTIFICATE: &str = "0xe7f1725e7734ce288f8367e1bb143e90bb3f0512";
/// Sorts before `REGISTRY`.
const LOW_CERTIFICATE: &str = "0x0000000000000000000000000000000000000c01";
const OWNER: &str = "0x70997970c51812dc3a010c7d01b50e0d17dc79c8";

// ─── Scripted ledger ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedLedger {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    failing: Mutex<HashSet<String>>,
    /// Ignore `from` and redeliver every log up to `to`.
    redeliver: AtomicBool,
    /// Delay of every `get_logs` call.
    logs_delay_ms: AtomicU64,
    /// Delay of every `block_timestamp` call.
    timestamp_delay_ms: AtomicU64,
    /// Per address: ranges wider than this many blocks hang.
    stall_above: Mutex<HashMap<String, u64>>,
}

impl ScriptedLedger {
    fn push(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    fn fail_topic(&self, topic0: &str) {
        self.failing.lock().unwrap().insert(topic0.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    fn stall_ranges_wider_than(&self, address: &str, blocks: u64) {
        self.stall_above
            .lock()
            .unwrap()
            .insert(address.to_string(), blocks);
    }
}

#[async_trait]
impl LedgerClient for ScriptedLedger {
    async fn current_height(&self) -> Result<u64, SyncError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(
        &self,
        address: &str,
        topic0: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, SyncError> {
        if self.failing.lock().unwrap().contains(topic0) {
            return Err(SyncError::Network("connection reset".into()));
        }
        let stall = self
            .stall_above
            .lock()
            .unwrap()
            .get(address)
            .is_some_and(|max| to - from + 1 > *max);
        if stall {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let delay = self.logs_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let from = if self.redeliver.load(Ordering::SeqCst) {
            0
        } else {
            from
        };
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|l| l.address == address && l.topics[0] == topic0)
            .filter(|l| {
                let block = l.block_number_u64().unwrap();
                block >= from && block <= to
            })
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, number: u64) -> Result<i64, SyncError> {
        let delay = self.timestamp_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(1_700_000_000 + number as i64 * 12)
    }

    async fn read_project_state(&self, _: u64) -> Result<Option<OnChainProject>, SyncError> {
        Ok(None)
    }

    async fn allowance(&self, _: &str, _: &str) -> Result<u128, SyncError> {
        Ok(0)
    }

    async fn average_rating(&self, _: u64) -> Result<f64, SyncError> {
        Ok(0.0)
    }
}

// ─── Log construction ─────────────────────────────────────────────────────────

fn word(value: u128) -> String {
    format!("0x{value:064x}")
}

fn address_word(address: &str) -> String {
    format!("0x{:0>64}", address.trim_start_matches("0x"))
}

fn raw_log(
    address: &str,
    kind: EventKind,
    mut topics: Vec<String>,
    data: String,
    block: u64,
    log_index: u32,
) -> RawLog {
    topics.insert(0, EventSchema::for_kind(kind).topic0());
    RawLog {
        address: address.to_string(),
        topics,
        data,
        block_number: to_hex_quantity(block),
        tx_hash: format!("0x{:064x}", block * 1_000 + u64::from(log_index)),
        log_index: to_hex_quantity(u64::from(log_index)),
        removed: None,
    }
}

fn project_created(id: u64, owner: &str, uri: &str, block: u64) -> RawLog {
    let data = DynSolValue::Tuple(vec![DynSolValue::String(uri.to_string())]).abi_encode_params();
    raw_log(
        REGISTRY,
        EventKind::ProjectCreated,
        vec![word(id.into()), address_word(owner)],
        format!("0x{}", hex::encode(data)),
        block,
        0,
    )
}

fn project_approved(id: u64, block: u64) -> RawLog {
    raw_log(
        REGISTRY,
        EventKind::ProjectApproved,
        vec![word(id.into())],
        "0x".into(),
        block,
        0,
    )
}

fn rated(id: u64, rater: &str, stars: u8, block: u64, log_index: u32) -> RawLog {
    raw_log(
        REGISTRY,
        EventKind::Rated,
        vec![word(id.into()), address_word(rater)],
        word(stars.into()),
        block,
        log_index,
    )
}

fn funded(id: u64, funder: &str, amount: u128, block: u64) -> RawLog {
    raw_log(
        REGISTRY,
        EventKind::Funded,
        vec![word(id.into()), address_word(funder)],
        word(amount),
        block,
        0,
    )
}

fn approval_minted(certificate: &str, id: u64, token_id: u64, to: &str, block: u64) -> RawLog {
    raw_log(
        certificate,
        EventKind::ApprovalMinted,
        vec![word(id.into()), word(token_id.into()), address_word(to)],
        "0x".into(),
        block,
        0,
    )
}

fn rater(n: u8) -> String {
    format!("0x{:040x}", 0xa000 + u32::from(n))
}

// ─── Fixture ──────────────────────────────────────────────────────────────────

struct Fixture {
    ledger: Arc<ScriptedLedger>,
    store: Arc<MemoryStore>,
    indexer: IndexLoop<ScriptedLedger, MemoryStore>,
    project: Project,
    certificate: &'static str,
}

async fn fixture() -> Fixture {
    fixture_with(CERTIFICATE, 30_000).await
}

async fn fixture_with(certificate: &'static str, cycle_deadline_ms: u64) -> Fixture {
    let ledger = Arc::new(ScriptedLedger::default());
    let store = Arc::new(MemoryStore::new());

    let project = Project::new(OWNER, ProjectStatus::Submitted).with_metadata_uri("ipfs://p");
    store.insert_project(&project).await.unwrap();

    let indexer = IndexerBuilder::new()
        .chain_id(31337)
        .from_block(1)
        .batch_size(100)
        .cycle_deadline_ms(cycle_deadline_ms)
        .token_decimals(6)
        .registry(REGISTRY)
        .certificate(certificate)
        .build(Arc::clone(&ledger), Arc::clone(&store))
        .unwrap();

    Fixture {
        ledger,
        store,
        indexer,
        project,
        certificate,
    }
}

fn script_lifecycle(f: &Fixture) {
    let uri = tagged_metadata_uri("ipfs://p", f.project.id);
    f.ledger.push(project_created(42, OWNER, &uri, 10));
    f.ledger.push(project_approved(42, 11));
    f.ledger.push(rated(42, &rater(1), 5, 12, 0));
    f.ledger.push(rated(42, &rater(2), 4, 12, 1));
    f.ledger.push(rated(42, &rater(3), 3, 13, 0));
    f.ledger.push(funded(42, &rater(1), 2_500_000, 14));
    f.ledger
        .push(approval_minted(f.certificate, 42, 7, OWNER, 15));
    f.ledger.head.store(20, Ordering::SeqCst);
}

async fn checkpoint(f: &Fixture, address: &str, kind: EventKind) -> Option<u64> {
    let id = LogStream::new(address, kind).id;
    f.store
        .load_checkpoint(31337, &id)
        .await
        .unwrap()
        .map(|cp| cp.block_number)
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_is_projected() {
    let f = fixture().await;
    script_lifecycle(&f);

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.head, 20);
    assert_eq!(report.fetched, 7);
    assert_eq!(report.applied, 7);
    assert!(report.failed_streams.is_empty());

    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, Some(42));
    assert_eq!(project.status, ProjectStatus::Approved);
    assert_eq!(project.certificate_token_id, Some(7));
    assert_eq!(project.certificate_contract.as_deref(), Some(CERTIFICATE));

    let ratings = f.store.rating_aggregate(42).await.unwrap().unwrap();
    assert_eq!(ratings.count, 3);
    assert!((ratings.average - 4.0).abs() < f64::EPSILON);

    let funding = f.store.funding_aggregate(42).await.unwrap().unwrap();
    assert_eq!(funding.total_base_units, 2_500_000);
    assert!((funding.total - 2.5).abs() < 1e-9);

    for kind in EventKind::ALL {
        let address = if kind == EventKind::ApprovalMinted {
            CERTIFICATE
        } else {
            REGISTRY
        };
        assert_eq!(checkpoint(&f, address, kind).await, Some(20), "{kind}");
    }
}

#[tokio::test]
async fn redelivered_logs_change_nothing() {
    let f = fixture().await;
    script_lifecycle(&f);
    f.indexer.run_cycle().await.unwrap();
    let before = f.store.rating_aggregate(42).await.unwrap().unwrap();

    f.ledger.redeliver.store(true, Ordering::SeqCst);
    f.ledger.head.store(25, Ordering::SeqCst);
    let report = f.indexer.run_cycle().await.unwrap();

    assert_eq!(report.applied, 0);
    assert_eq!(report.duplicates, 7);
    let after = f.store.rating_aggregate(42).await.unwrap().unwrap();
    assert_eq!(after.count, before.count);
    assert!((after.average - before.average).abs() < f64::EPSILON);
    assert_eq!(f.store.fundings_for(42).await.unwrap().len(), 1);
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::Rated).await, Some(25));
}

#[tokio::test]
async fn failed_contract_does_not_block_others() {
    let f = fixture().await;
    script_lifecycle(&f);
    f.ledger
        .fail_topic(&EventSchema::for_kind(EventKind::ApprovalMinted).topic0());

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(
        report.failed_streams,
        vec![LogStream::new(CERTIFICATE, EventKind::ApprovalMinted).id]
    );
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::Rated).await, Some(20));
    assert_eq!(
        checkpoint(&f, CERTIFICATE, EventKind::ApprovalMinted).await,
        None
    );
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, Some(42));
    assert_eq!(project.certificate_token_id, None);

    f.ledger.heal();
    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.applied, 1);
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.certificate_token_id, Some(7));
    assert_eq!(
        checkpoint(&f, CERTIFICATE, EventKind::ApprovalMinted).await,
        Some(20)
    );
}

#[tokio::test]
async fn failed_stream_holds_back_its_contract() {
    let f = fixture().await;
    script_lifecycle(&f);
    f.ledger
        .fail_topic(&EventSchema::for_kind(EventKind::Rated).topic0());

    f.indexer.run_cycle().await.unwrap();
    // Registry streams move together so approval never overtakes binding.
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::ProjectCreated).await, None);
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, None);

    f.ledger.heal();
    f.indexer.run_cycle().await.unwrap();
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, Some(42));
    assert_eq!(project.status, ProjectStatus::Approved);
}

#[tokio::test]
async fn batches_respect_batch_size_and_confirmation() {
    let ledger = Arc::new(ScriptedLedger::default());
    let store = Arc::new(MemoryStore::new());
    let indexer = IndexerBuilder::new()
        .chain_id(31337)
        .from_block(100)
        .batch_size(10)
        .confirmation_depth(5)
        .registry(REGISTRY)
        .build(Arc::clone(&ledger), Arc::clone(&store))
        .unwrap();
    ledger.head.store(200, Ordering::SeqCst);

    indexer.run_cycle().await.unwrap();
    let id = LogStream::new(REGISTRY, EventKind::Rated).id;
    let cp = store.load_checkpoint(31337, &id).await.unwrap().unwrap();
    assert_eq!(cp.block_number, 109);

    ledger.head.store(112, Ordering::SeqCst);
    let report = indexer.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 0);
    let cp = store.load_checkpoint(31337, &id).await.unwrap().unwrap();
    assert_eq!(cp.block_number, 109);
}

#[tokio::test]
async fn undecodable_log_is_skipped() {
    let f = fixture().await;
    let mut bad = rated(42, &rater(1), 5, 3, 0);
    bad.topics.pop();
    f.ledger.push(bad);
    f.ledger.head.store(5, Ordering::SeqCst);

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 0);
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::Rated).await, Some(5));
    assert!(f.store.ratings_for(42).await.unwrap().is_empty());
}

#[tokio::test]
async fn untagged_submission_binds_by_owner() {
    let f = fixture().await;
    f.ledger.push(project_created(42, OWNER, "ipfs://x", 10));
    f.ledger.push(project_approved(42, 11));
    for (n, stars) in [5u8, 4, 3].into_iter().enumerate() {
        f.ledger.push(rated(42, &rater(n as u8), stars, 12 + n as u64, 0));
    }
    f.ledger.head.store(20, Ordering::SeqCst);

    f.indexer.run_cycle().await.unwrap();
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, Some(42));
    assert_eq!(project.status, ProjectStatus::Approved);
    // the off-chain record already had metadata
    assert_eq!(project.metadata_uri.as_deref(), Some("ipfs://p"));

    let ratings = f.store.rating_aggregate(42).await.unwrap().unwrap();
    assert_eq!(ratings.count, 3);
    assert!((ratings.average - 4.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn certificate_sorting_first_still_follows_binding() {
    let f = fixture_with(LOW_CERTIFICATE, 30_000).await;
    script_lifecycle(&f);

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.applied, 7);

    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, Some(42));
    assert_eq!(project.certificate_token_id, Some(7));
    assert_eq!(project.certificate_contract.as_deref(), Some(LOW_CERTIFICATE));
    assert_eq!(
        checkpoint(&f, LOW_CERTIFICATE, EventKind::ApprovalMinted).await,
        Some(20)
    );
}

#[tokio::test]
async fn mint_waits_while_registry_is_failing() {
    let f = fixture_with(LOW_CERTIFICATE, 30_000).await;
    script_lifecycle(&f);
    f.ledger
        .fail_topic(&EventSchema::for_kind(EventKind::Rated).topic0());

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.applied, 0);
    assert_eq!(
        checkpoint(&f, LOW_CERTIFICATE, EventKind::ApprovalMinted).await,
        None
    );

    f.ledger.heal();
    f.indexer.run_cycle().await.unwrap();
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.on_chain_project_id, Some(42));
    assert_eq!(project.certificate_token_id, Some(7));
}

#[tokio::test]
async fn slow_contract_times_out_alone_and_narrows() {
    let f = fixture_with(CERTIFICATE, 100).await;
    script_lifecycle(&f);
    f.ledger.head.store(200, Ordering::SeqCst);
    f.ledger.stall_ranges_wider_than(CERTIFICATE, 30);
    let minted = LogStream::new(CERTIFICATE, EventKind::ApprovalMinted).id;

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.failed_streams, vec![minted.clone()]);
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::Rated).await, Some(100));
    assert_eq!(checkpoint(&f, CERTIFICATE, EventKind::ApprovalMinted).await, None);
    assert_eq!(f.indexer.span(CERTIFICATE), 50);
    assert_eq!(f.indexer.span(REGISTRY), 100);

    let report = f.indexer.run_cycle().await.unwrap();
    assert_eq!(report.failed_streams, vec![minted]);
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::Rated).await, Some(200));
    assert_eq!(f.indexer.span(CERTIFICATE), 25);

    let report = f.indexer.run_cycle().await.unwrap();
    assert!(report.failed_streams.is_empty());
    assert_eq!(
        checkpoint(&f, CERTIFICATE, EventKind::ApprovalMinted).await,
        Some(25)
    );
    assert_eq!(f.indexer.span(CERTIFICATE), 50);
    let project = f.store.project(f.project.id).await.unwrap().unwrap();
    assert_eq!(project.certificate_token_id, Some(7));
}

#[tokio::test]
async fn block_timestamps_are_read_concurrently() {
    let f = fixture_with(CERTIFICATE, 250).await;
    for n in 0..10u8 {
        f.ledger.push(rated(42, &rater(n), 4, 1 + u64::from(n), 0));
    }
    f.ledger.head.store(20, Ordering::SeqCst);
    // One at a time these reads would take 300ms.
    f.ledger.timestamp_delay_ms.store(30, Ordering::SeqCst);

    let report = f.indexer.run_cycle().await.unwrap();
    assert!(report.failed_streams.is_empty());
    assert_eq!(report.fetched, 10);
    assert_eq!(checkpoint(&f, REGISTRY, EventKind::Rated).await, Some(20));
}

#[tokio::test]
async fn shutdown_finishes_the_running_cycle() {
    let ledger = Arc::new(ScriptedLedger::default());
    let store = Arc::new(MemoryStore::new());
    let indexer = Arc::new(
        IndexerBuilder::new()
            .chain_id(31337)
            .from_block(1)
            .poll_interval_ms(10)
            .registry(REGISTRY)
            .build(Arc::clone(&ledger), Arc::clone(&store))
            .unwrap(),
    );
    ledger.head.store(20, Ordering::SeqCst);
    ledger.logs_delay_ms.store(300, Ordering::SeqCst);
    let state = indexer.subscribe_state();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = Arc::clone(&indexer);
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*state.borrow(), IndexerState::Live);
    shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*state.borrow(), IndexerState::Stopping);

    handle.await.unwrap();
    assert_eq!(indexer.state(), IndexerState::Stopped);
    let id = LogStream::new(REGISTRY, EventKind::Rated).id;
    let cp = store.load_checkpoint(31337, &id).await.unwrap().unwrap();
    assert_eq!(cp.block_number, 20);
}
