//! Periodic and ad-hoc consistency sweeps.

use chrono::{Duration, Utc};
use common::{AgreementId, LegacyRecordId};
use domain::{ConversationTaskPayload, LegacyRecord, LegacyTaskPayload, Money, TaskType};
use lifecycle::{AgreementService, LegacyAdapter};
use projections::OrderSnapshotProjector;
use serde::Serialize;
use store::{CollectionCounts, Store};

use crate::error::Result;
use crate::retry_queue::RetryQueue;

/// Sweep tuning.
#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Trailing window for legacy records.
    pub window: Duration,
    /// Conversations inspected per sweep.
    pub conversation_batch: usize,
    /// Agreements projected or resynced synchronously per sweep, per kind.
    pub snapshot_batch: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            window: Duration::days(7),
            conversation_batch: 100,
            snapshot_batch: 100,
        }
    }
}

/// Counts from one full sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub legacy_records_scanned: usize,
    pub legacy_tasks_enqueued: usize,
    pub conversation_tasks_enqueued: usize,
    pub snapshots_created: usize,
    pub snapshots_resynced: usize,
    pub snapshot_failures: usize,
    pub enqueue_failures: usize,
}

impl SweepReport {
    /// Number of drifted records found.
    pub fn drift(&self) -> usize {
        self.legacy_tasks_enqueued
            + self.conversation_tasks_enqueued
            + self.snapshots_created
            + self.snapshots_resynced
            + self.snapshot_failures
            + self.enqueue_failures
    }
}

/// One legacy record matched by a price repair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRepairMatch {
    pub legacy_record_id: LegacyRecordId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement_id: Option<AgreementId>,
    pub order_snapshot_exists: bool,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a price repair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceRepairReport {
    pub price: Money,
    pub epsilon: Money,
    pub scanned: usize,
    pub matches: Vec<PriceRepairMatch>,
}

/// Collection counts and the relations that should hold between them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub counts: CollectionCounts,
    pub agreements_match_snapshots: bool,
    pub legacy_records_migrated: bool,
    pub conversations_linked: bool,
    pub consistent: bool,
}

impl ConsistencyReport {
    fn from_counts(counts: CollectionCounts) -> Self {
        let agreements_match_snapshots = counts.agreements == counts.order_snapshots;
        let legacy_records_migrated =
            counts.agreements_with_legacy_record >= counts.accepted_legacy_records;
        let conversations_linked = counts.accepted_conversations_without_agreement == 0;
        Self {
            counts,
            agreements_match_snapshots,
            legacy_records_migrated,
            conversations_linked,
            consistent: agreements_match_snapshots
                && legacy_records_migrated
                && conversations_linked
                && counts.failed_tasks == 0,
        }
    }
}

/// Finds drift between legacy records, conversations, agreements and
/// snapshots, and repairs it through the regular entry points.
#[derive(Clone)]
pub struct ReconciliationSweep<S: Store> {
    store: S,
    queue: RetryQueue<S>,
    legacy: LegacyAdapter<S>,
    projector: OrderSnapshotProjector<S>,
    config: SweepConfig,
}

impl<S: Store + Clone> ReconciliationSweep<S> {
    pub fn new(service: AgreementService<S>, queue: RetryQueue<S>, config: SweepConfig) -> Self {
        Self {
            store: service.store().clone(),
            projector: service.projector().clone(),
            legacy: LegacyAdapter::new(service),
            queue,
            config,
        }
    }

    /// Runs all three passes. Per-item failures are counted, never fatal.
    #[tracing::instrument(skip(self))]
    pub async fn run_full_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.sweep_legacy_records(&mut report).await?;
        self.sweep_conversations(&mut report).await?;
        self.sweep_snapshots(&mut report).await?;

        let drift = report.drift();
        metrics::gauge!("reconciliation_drift_detected").set(drift as f64);
        metrics::counter!("reconciliation_sweeps_total").increment(1);
        tracing::info!(
            drift,
            legacy_tasks = report.legacy_tasks_enqueued,
            conversation_tasks = report.conversation_tasks_enqueued,
            snapshots_created = report.snapshots_created,
            snapshots_resynced = report.snapshots_resynced,
            snapshot_failures = report.snapshot_failures,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn sweep_legacy_records(&self, report: &mut SweepReport) -> Result<()> {
        let since = Utc::now() - self.config.window;
        let mut tx = self.store.begin().await?;
        let records = self.store.list_accepted_legacy_records_since(&mut tx, since).await?;
        let mut unmigrated = Vec::new();
        for record in &records {
            if self
                .store
                .find_agreement_by_legacy_record(&mut tx, record.id)
                .await?
                .is_none()
            {
                unmigrated.push(record.id);
            }
        }
        self.store.abort(tx).await?;
        report.legacy_records_scanned = records.len();

        for legacy_record_id in unmigrated {
            let payload = LegacyTaskPayload { legacy_record_id };
            match self
                .queue
                .enqueue_now(TaskType::CreateAgreementFromLegacy, &payload)
                .await
            {
                Ok(_) => report.legacy_tasks_enqueued += 1,
                Err(e) => {
                    report.enqueue_failures += 1;
                    tracing::warn!(%legacy_record_id, error = %e, "legacy repair not scheduled");
                }
            }
        }
        Ok(())
    }

    async fn sweep_conversations(&self, report: &mut SweepReport) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let conversations = self
            .store
            .list_accepted_conversations_without_agreement(&mut tx, self.config.conversation_batch)
            .await?;
        self.store.abort(tx).await?;

        for conversation in conversations {
            let payload = ConversationTaskPayload {
                conversation_id: conversation.id,
            };
            match self
                .queue
                .enqueue_now(TaskType::CreateAgreementFromConversation, &payload)
                .await
            {
                Ok(_) => report.conversation_tasks_enqueued += 1,
                Err(e) => {
                    report.enqueue_failures += 1;
                    tracing::warn!(conversation_id = %conversation.id, error = %e, "conversation repair not scheduled");
                }
            }
        }
        Ok(())
    }

    async fn sweep_snapshots(&self, report: &mut SweepReport) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let agreements = self
            .store
            .list_agreements_without_snapshot(&mut tx, self.config.snapshot_batch)
            .await?;
        self.store.abort(tx).await?;

        for agreement in agreements {
            match self.projector.create_from_agreement(&agreement).await {
                Ok(_) => report.snapshots_created += 1,
                Err(e) => {
                    report.snapshot_failures += 1;
                    tracing::warn!(agreement_id = %agreement.id(), error = %e, "snapshot not projected");
                }
            }
        }

        let mut tx = self.store.begin().await?;
        let stale = self
            .store
            .list_agreements_with_stale_snapshot(&mut tx, self.config.snapshot_batch)
            .await?;
        self.store.abort(tx).await?;

        for agreement in stale {
            match self.projector.sync_by_id(agreement.id()).await {
                Ok(_) => report.snapshots_resynced += 1,
                Err(e) => {
                    report.snapshot_failures += 1;
                    tracing::warn!(agreement_id = %agreement.id(), error = %e, "stale snapshot not resynced");
                }
            }
        }
        Ok(())
    }

    /// Repairs every legacy record whose parsed price is within `epsilon` of `price`.
    ///
    /// Records with unreadable prices never match.
    #[tracing::instrument(skip(self), fields(price = %price, epsilon = %epsilon))]
    pub async fn repair_by_price(&self, price: Money, epsilon: Money) -> Result<PriceRepairReport> {
        let mut tx = self.store.begin().await?;
        let records = self.store.list_all_legacy_records(&mut tx).await?;
        self.store.abort(tx).await?;

        let scanned = records.len();
        let mut matches = Vec::new();
        for record in records {
            let Some(amount) = record.price.amount() else {
                continue;
            };
            if amount.within(price, epsilon) {
                matches.push(self.repair_record(&record).await?);
            }
        }

        let repaired = matches.iter().filter(|m| m.repaired).count();
        metrics::counter!("reconciliation_price_repairs_total").increment(repaired as u64);
        tracing::info!(scanned, matched = matches.len(), repaired, "price repair finished");
        Ok(PriceRepairReport {
            price,
            epsilon,
            scanned,
            matches,
        })
    }

    async fn repair_record(&self, record: &LegacyRecord) -> Result<PriceRepairMatch> {
        let (existing, snapshot_existed) = {
            let mut tx = self.store.begin().await?;
            let existing = self
                .store
                .find_agreement_by_legacy_record(&mut tx, record.id)
                .await?;
            let snapshot = match &existing {
                Some(agreement) => self.store.get_order_snapshot(&mut tx, agreement.id()).await?,
                None => None,
            };
            self.store.abort(tx).await?;
            (existing.map(|a| a.id()), snapshot.is_some())
        };

        let mut repair = PriceRepairMatch {
            legacy_record_id: record.id,
            agreement_id: existing,
            order_snapshot_exists: snapshot_existed,
            repaired: false,
            error: None,
        };
        if existing.is_some() && snapshot_existed {
            return Ok(repair);
        }

        let agreement = match self.legacy.migrate(record).await {
            Ok(migration) => migration.agreement,
            Err(e) => {
                repair.error = Some(e.to_string());
                return Ok(repair);
            }
        };
        repair.agreement_id = Some(agreement.id());
        repair.repaired = existing.is_none();

        match self.projector.create_from_agreement(&agreement).await {
            Ok(_) => {
                repair.order_snapshot_exists = true;
                repair.repaired = repair.repaired || !snapshot_existed;
            }
            Err(e) => repair.error = Some(e.to_string()),
        }
        Ok(repair)
    }

    /// Reports collection counts and whether they line up.
    pub async fn consistency_check(&self) -> Result<ConsistencyReport> {
        let mut tx = self.store.begin().await?;
        let counts = self.store.collection_counts(&mut tx).await?;
        self.store.abort(tx).await?;
        Ok(ConsistencyReport::from_counts(counts))
    }
}
