//! Order snapshot projector.

use common::{AgreementId, UserId};
use domain::{Agreement, OrderSnapshot};
use store::Store;

use crate::resolver::{Resolution, ResolutionContext, Role, resolve_participant};
use crate::{ProjectionError, Result};

/// Maintains exactly one order snapshot per agreement.
///
/// The `*_in` methods run inside a caller's transaction so the projection can
/// be part of a larger unit of work. The `*_from_agreement` methods open and
/// commit their own transaction.
#[derive(Clone)]
pub struct OrderSnapshotProjector<S: Store> {
    store: S,
}

impl<S: Store + Clone> OrderSnapshotProjector<S> {
    /// Creates a new projector over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns a reference to the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates the agreement's snapshot unless one already exists.
    #[tracing::instrument(skip(self, tx, agreement), fields(agreement_id = %agreement.id()))]
    pub async fn create_in(&self, tx: &mut S::Tx, agreement: &Agreement) -> Result<OrderSnapshot> {
        if let Some(existing) = self.store.get_order_snapshot(tx, agreement.id()).await? {
            return Ok(existing);
        }

        let (client_id, booster_id) = self.resolve_parties(tx, agreement).await?;
        let snapshot = OrderSnapshot::project(agreement, client_id, booster_id);
        self.store.insert_order_snapshot(tx, &snapshot).await?;

        metrics::counter!("order_snapshots_created_total").increment(1);
        tracing::debug!("order snapshot created");
        Ok(snapshot)
    }

    /// Creates the agreement's snapshot in its own transaction.
    ///
    /// A concurrent creator winning the insert is not an error: the winner's
    /// snapshot is read back and returned.
    pub async fn create_from_agreement(&self, agreement: &Agreement) -> Result<OrderSnapshot> {
        let mut tx = self.store.begin().await?;
        match self.create_in(&mut tx, agreement).await {
            Ok(snapshot) => {
                self.store.commit(tx).await?;
                Ok(snapshot)
            }
            Err(ProjectionError::Store(e)) if e.is_duplicate() => {
                self.store.abort(tx).await?;
                self.read_winner(agreement.id(), e).await
            }
            Err(e) => {
                self.store.abort(tx).await?;
                Err(e)
            }
        }
    }

    /// Mirrors the agreement into its snapshot, creating it when missing.
    ///
    /// Participant ids of an existing snapshot are never re-resolved.
    #[tracing::instrument(skip(self, tx, agreement), fields(agreement_id = %agreement.id(), status = %agreement.status()))]
    pub async fn sync_in(&self, tx: &mut S::Tx, agreement: &Agreement) -> Result<OrderSnapshot> {
        match self.sync_existing_in(tx, agreement).await? {
            Some(snapshot) => Ok(snapshot),
            None => self.create_in(tx, agreement).await,
        }
    }

    /// Mirrors the agreement into its snapshot only if one already exists.
    ///
    /// A copy of the agreement no newer than the last synced version leaves
    /// the snapshot untouched.
    pub async fn sync_existing_in(
        &self,
        tx: &mut S::Tx,
        agreement: &Agreement,
    ) -> Result<Option<OrderSnapshot>> {
        let Some(mut snapshot) = self.store.get_order_snapshot(tx, agreement.id()).await? else {
            return Ok(None);
        };
        if !snapshot.is_behind(agreement) {
            tracing::debug!(
                synced_version = %snapshot.agreement_version,
                "order snapshot already at or past this version"
            );
            metrics::counter!("order_snapshots_stale_syncs_skipped_total").increment(1);
            return Ok(Some(snapshot));
        }
        snapshot.sync(agreement);
        self.store.update_order_snapshot(tx, &snapshot).await?;
        metrics::counter!("order_snapshots_synced_total").increment(1);
        Ok(Some(snapshot))
    }

    /// Mirrors the agreement into its snapshot in its own transaction.
    pub async fn sync_from_agreement(&self, agreement: &Agreement) -> Result<OrderSnapshot> {
        let mut tx = self.store.begin().await?;
        match self.sync_in(&mut tx, agreement).await {
            Ok(snapshot) => {
                self.store.commit(tx).await?;
                Ok(snapshot)
            }
            Err(ProjectionError::Store(e)) if e.is_duplicate() => {
                // Lost a creation race; the snapshot now exists, so sync it.
                self.store.abort(tx).await?;
                let mut tx = self.store.begin().await?;
                let snapshot = self.sync_in(&mut tx, agreement).await?;
                self.store.commit(tx).await?;
                Ok(snapshot)
            }
            Err(e) => {
                self.store.abort(tx).await?;
                Err(e)
            }
        }
    }

    /// Loads the agreement and mirrors it into its snapshot.
    pub async fn sync_by_id(&self, agreement_id: AgreementId) -> Result<OrderSnapshot> {
        let agreement = {
            let mut tx = self.store.begin().await?;
            let agreement = self.store.get_agreement(&mut tx, agreement_id).await?;
            self.store.abort(tx).await?;
            agreement.ok_or(ProjectionError::AgreementNotFound(agreement_id))?
        };
        self.sync_from_agreement(&agreement).await
    }

    async fn read_winner(
        &self,
        agreement_id: AgreementId,
        cause: store::StoreError,
    ) -> Result<OrderSnapshot> {
        let mut tx = self.store.begin().await?;
        let winner = self.store.get_order_snapshot(&mut tx, agreement_id).await?;
        self.store.abort(tx).await?;
        match winner {
            Some(snapshot) => {
                tracing::debug!(%agreement_id, "order snapshot created concurrently");
                Ok(snapshot)
            }
            None => Err(cause.into()),
        }
    }

    async fn resolve_parties(
        &self,
        tx: &mut S::Tx,
        agreement: &Agreement,
    ) -> Result<(UserId, UserId)> {
        let empty = ResolutionContext::default();
        let mut client = resolve_participant(agreement, Role::Client, &empty);
        let mut booster = resolve_participant(agreement, Role::Booster, &empty);

        if !client.is_resolved() || !booster.is_resolved() {
            let context = self.load_context(tx, agreement).await?;
            client = resolve_participant(agreement, Role::Client, &context);
            booster = resolve_participant(agreement, Role::Booster, &context);
        }

        Ok((
            Self::require(agreement, Role::Client, client)?,
            Self::require(agreement, Role::Booster, booster)?,
        ))
    }

    async fn load_context(
        &self,
        tx: &mut S::Tx,
        agreement: &Agreement,
    ) -> Result<ResolutionContext> {
        let conversation = self
            .store
            .get_conversation(tx, agreement.conversation_id())
            .await?;
        let legacy_record = match agreement.legacy_record_id() {
            Some(id) => self.store.get_legacy_record(tx, id).await?,
            None => self
                .store
                .list_legacy_records_for_conversation(tx, agreement.conversation_id())
                .await?
                .into_iter()
                .next(),
        };
        Ok(ResolutionContext {
            conversation,
            legacy_record,
        })
    }

    fn require(agreement: &Agreement, role: Role, resolution: Resolution) -> Result<UserId> {
        match resolution {
            Resolution::Resolved { id, source } => {
                tracing::trace!(%role, %source, "participant resolved");
                Ok(id)
            }
            Resolution::Unresolved => {
                metrics::counter!("participant_resolution_failures_total").increment(1);
                tracing::warn!(agreement_id = %agreement.id(), %role, "participant unresolvable");
                Err(ProjectionError::UnresolvableParticipant {
                    agreement_id: agreement.id(),
                    role,
                })
            }
        }
    }
}
