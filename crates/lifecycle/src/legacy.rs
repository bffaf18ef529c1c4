//! Bridges legacy pre-contract records onto agreements.
//!
//! Read and write paths that still start from a legacy record call into the
//! adapter in one of three patterns:
//! - [`LegacyAdapter::augment`]: best effort, the caller continues without an agreement
//! - [`LegacyAdapter::ensure`]: strict, the caller needs the agreement
//! - [`LegacyAdapter::dual_identifiers`]: read-only, both ids for responses

use chrono::{DateTime, Utc};
use common::{AgreementId, LegacyRecordId, Version};
use domain::{Agreement, AgreementStatus, LegacyRecord};
use serde::Serialize;
use store::{Store, StoreError};

use crate::error::{LifecycleError, Result};
use crate::service::AgreementService;

/// How a migration resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// A new agreement was built from the record.
    Created,
    /// An existing unlinked agreement of the conversation was linked.
    Linked,
    /// The record was already migrated.
    Existing,
}

impl MigrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationOutcome::Created => "created",
            MigrationOutcome::Linked => "linked",
            MigrationOutcome::Existing => "existing",
        }
    }
}

/// Result of migrating one legacy record.
#[derive(Debug, Clone)]
pub struct Migration {
    pub agreement: Agreement,
    pub outcome: MigrationOutcome,
}

/// Both identifiers of an engagement that may predate agreements.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DualIdentifiers {
    pub legacy_record_id: LegacyRecordId,
    pub agreement_id: Option<AgreementId>,
    pub agreement_status: Option<AgreementStatus>,
}

/// Legacy record adapter.
#[derive(Clone)]
pub struct LegacyAdapter<S: Store> {
    service: AgreementService<S>,
}

impl<S: Store + Clone> LegacyAdapter<S> {
    /// Creates an adapter that writes through the given agreement service.
    pub fn new(service: AgreementService<S>) -> Self {
        Self { service }
    }

    fn store(&self) -> &S {
        self.service.store()
    }

    /// Migrates a stored legacy record.
    pub async fn migrate_by_id(&self, legacy_record_id: LegacyRecordId) -> Result<Migration> {
        let record = {
            let mut tx = self.store().begin().await?;
            let record = self.store().get_legacy_record(&mut tx, legacy_record_id).await?;
            self.store().abort(tx).await?;
            record.ok_or(LifecycleError::LegacyRecordNotFound(legacy_record_id))?
        };
        self.migrate(&record).await
    }

    /// Returns the agreement of a legacy record, creating or linking it first.
    ///
    /// Idempotent by legacy record id. When the conversation already has an
    /// agreement that is not linked to any record, the most recent such
    /// agreement is linked instead of creating a second one, whatever its
    /// status.
    #[tracing::instrument(skip(self, record), fields(legacy_record_id = %record.id))]
    pub async fn migrate(&self, record: &LegacyRecord) -> Result<Migration> {
        let now = Utc::now();
        let mut tx = self.store().begin().await?;
        let migration = match self.migrate_in(&mut tx, record, now).await {
            Ok(migration) => {
                self.store().commit(tx).await?;
                migration
            }
            Err(LifecycleError::Store(e)) if e.is_duplicate() => {
                // A concurrent migration of the same record won.
                self.store().abort(tx).await?;
                let mut tx = self.store().begin().await?;
                let winner = self
                    .store()
                    .find_agreement_by_legacy_record(&mut tx, record.id)
                    .await?;
                self.store().abort(tx).await?;
                let agreement = winner.ok_or(LifecycleError::Store(e))?;
                return Ok(Migration {
                    agreement,
                    outcome: MigrationOutcome::Existing,
                });
            }
            Err(LifecycleError::Store(StoreError::OpenAgreementExists(conversation_id))) => {
                self.store().abort(tx).await?;
                return Err(self.service.open_agreement_conflict(conversation_id).await?);
            }
            Err(e) => {
                self.store().abort(tx).await?;
                return Err(e);
            }
        };

        metrics::counter!("legacy_migrations_total", "outcome" => migration.outcome.as_str())
            .increment(1);
        if migration.outcome != MigrationOutcome::Existing {
            tracing::info!(
                agreement_id = %migration.agreement.id(),
                outcome = migration.outcome.as_str(),
                "legacy record migrated"
            );
            self.service.project_or_enqueue(&migration.agreement).await;
        }
        Ok(migration)
    }

    async fn migrate_in(
        &self,
        tx: &mut S::Tx,
        record: &LegacyRecord,
        now: DateTime<Utc>,
    ) -> Result<Migration> {
        if let Some(agreement) = self
            .store()
            .find_agreement_by_legacy_record(tx, record.id)
            .await?
        {
            return Ok(Migration {
                agreement,
                outcome: MigrationOutcome::Existing,
            });
        }

        let unlinked = self
            .store()
            .list_agreements_for_conversation(tx, record.conversation_id)
            .await?
            .into_iter()
            .rev()
            .find(|a| a.legacy_record_id().is_none());

        let migration = match unlinked {
            Some(mut agreement) => {
                agreement.link_legacy_record(record.id, now)?;
                self.service.persist(tx, &mut agreement).await?;
                Migration {
                    agreement,
                    outcome: MigrationOutcome::Linked,
                }
            }
            None => {
                let mut agreement = record.to_agreement(now)?;
                if !agreement.is_terminal() {
                    self.service
                        .ensure_no_active_agreement(tx, record.conversation_id)
                        .await?;
                }
                agreement.set_version(Version::first());
                self.store().insert_agreement(tx, &agreement).await?;
                Migration {
                    agreement,
                    outcome: MigrationOutcome::Created,
                }
            }
        };

        if let Some(mut conversation) = self
            .store()
            .get_conversation(tx, record.conversation_id)
            .await?
        {
            if conversation.agreement_id.is_none() {
                conversation.link_agreement(migration.agreement.id(), now);
            }
            if conversation.legacy_record_id.is_none() {
                conversation.legacy_record_id = Some(record.id);
            }
            self.store().upsert_conversation(tx, &conversation).await?;
        }

        Ok(migration)
    }

    /// Best-effort migration; failures are logged and yield `None`.
    pub async fn augment(&self, record: &LegacyRecord) -> Option<Agreement> {
        match self.migrate(record).await {
            Ok(migration) => Some(migration.agreement),
            Err(e) => {
                tracing::warn!(legacy_record_id = %record.id, error = %e, "legacy record not migrated");
                None
            }
        }
    }

    /// Strict migration; the agreement is required.
    pub async fn ensure(&self, legacy_record_id: LegacyRecordId) -> Result<Agreement> {
        Ok(self.migrate_by_id(legacy_record_id).await?.agreement)
    }

    /// Returns the legacy id with the agreement id and status, if migrated.
    pub async fn dual_identifiers(&self, legacy_record_id: LegacyRecordId) -> Result<DualIdentifiers> {
        let mut tx = self.store().begin().await?;
        let record = self.store().get_legacy_record(&mut tx, legacy_record_id).await?;
        let agreement = self
            .store()
            .find_agreement_by_legacy_record(&mut tx, legacy_record_id)
            .await?;
        self.store().abort(tx).await?;

        if record.is_none() && agreement.is_none() {
            return Err(LifecycleError::LegacyRecordNotFound(legacy_record_id));
        }
        Ok(DualIdentifiers {
            legacy_record_id,
            agreement_id: agreement.as_ref().map(Agreement::id),
            agreement_status: agreement.as_ref().map(Agreement::status),
        })
    }
}
