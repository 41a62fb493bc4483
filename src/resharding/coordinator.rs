//! Coordinator state machine.
//!
//! One task per operation drives the persisted record through its phases.
//! Each iteration runs the step for the current phase: fan a command out to
//! the participants, fold their replies into the record, and either persist
//! the next phase or pause and poll again.
//!
//! Every write is a compare-and-swap against the record this instance last
//! wrote. Losing that race means another coordinator owns the operation, so
//! the instance stops without touching anything else.
//!
//! Two cancellation tokens are observed between steps and during pauses:
//! the user abort token moves the operation into `Aborting` (unless it is
//! already committing), and the stop token ends the task so that the next
//! leader can resume from the persisted phase.

use super::cleanup::{CleanupManager, CleanupTarget};
use super::participant::{
    FanOutResult, ParticipantCommand, ParticipantOutcome, ParticipantProxy, ParticipantReply,
    ParticipantRole,
};
use super::phase::{CoordinatorPhase, DonorPhase, RecipientPhase};
use super::record::{AbortKind, AbortReason, CoordinationRecord};
use super::routing::{RoutingDirectory, RoutingTable, SwapOutcome};
use super::store::CoordinatorStore;
use crate::config::ReshardingConfig;
use crate::error::{Error, Result};
use crate::metrics::ReshardingMetrics;
use crate::types::{now_ms, Namespace, ShardId, ShardKeyPattern, Timestamp};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of a resharding operation as seen by waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Routing now uses the new shard key.
    Committed,
    /// The operation was abandoned; routing is unchanged.
    Aborted(AbortReason),
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => write!(f, "committed"),
            Self::Aborted(reason) => write!(f, "aborted ({})", reason),
        }
    }
}

#[derive(Debug, Clone)]
enum InstanceExit {
    Completed(Completion),
    Interrupted,
}

/// Collaborators shared by every coordinator instance.
#[derive(Debug, Clone)]
pub struct CoordinatorServices {
    pub store: Arc<dyn CoordinatorStore>,
    pub directory: Arc<dyn RoutingDirectory>,
    pub proxy: ParticipantProxy,
    pub cleanup: Arc<CleanupManager>,
    pub config: ReshardingConfig,
    pub metrics: Arc<ReshardingMetrics>,
}

/// Handle to a running (or finished) coordinator instance.
#[derive(Debug)]
pub struct ReshardingHandle {
    operation_id: Uuid,
    namespace: Namespace,
    new_shard_key: ShardKeyPattern,
    phase_rx: watch::Receiver<CoordinatorPhase>,
    exit_rx: watch::Receiver<Option<InstanceExit>>,
    abort_token: CancellationToken,
    stop_token: CancellationToken,
}

impl ReshardingHandle {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn new_shard_key(&self) -> &ShardKeyPattern {
        &self.new_shard_key
    }

    /// Last persisted phase.
    pub fn phase(&self) -> CoordinatorPhase {
        *self.phase_rx.borrow()
    }

    /// Receiver notified on every persisted phase change.
    pub fn subscribe_phase(&self) -> watch::Receiver<CoordinatorPhase> {
        self.phase_rx.clone()
    }

    /// Request a user abort. Ignored once the operation is committing.
    pub fn abort(&self) {
        self.abort_token.cancel();
    }

    /// Whether the instance task has exited.
    pub fn is_finished(&self) -> bool {
        self.exit_rx.borrow().is_some() || self.exit_rx.has_changed().is_err()
    }

    /// Wait for the operation to reach a terminal phase.
    ///
    /// Returns `Error::Timeout` if `timeout` elapses first and
    /// `Error::Interrupted` if the instance stopped without finishing.
    pub async fn await_completion(&self, timeout: Duration) -> Result<Completion> {
        let mut rx = self.exit_rx.clone();
        let exit = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Err(_) => return Err(Error::Timeout),
            Ok(Err(_)) => return Err(Error::Interrupted),
            Ok(Ok(exit)) => exit.clone(),
        };
        match exit {
            Some(InstanceExit::Completed(completion)) => Ok(completion),
            _ => Err(Error::Interrupted),
        }
    }

    /// Stop the instance without changing its record.
    pub(crate) fn stop(&self) {
        self.stop_token.cancel();
    }

    /// Wait until the instance task has exited, however it ended.
    pub(crate) async fn wait_exited(&self) {
        let mut rx = self.exit_rx.clone();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

/// Start a coordinator task for `record`.
pub(crate) fn spawn_instance(
    record: CoordinationRecord,
    services: CoordinatorServices,
) -> Arc<ReshardingHandle> {
    let (phase_tx, phase_rx) = watch::channel(record.phase);
    let (exit_tx, exit_rx) = watch::channel(None);
    let abort_token = CancellationToken::new();
    let stop_token = CancellationToken::new();

    let handle = Arc::new(ReshardingHandle {
        operation_id: record.operation_id,
        namespace: record.source_namespace.clone(),
        new_shard_key: record.new_shard_key.clone(),
        phase_rx,
        exit_rx,
        abort_token: abort_token.clone(),
        stop_token: stop_token.clone(),
    });

    let instance = CoordinatorInstance {
        record,
        services,
        phase_tx,
        abort_token,
        stop_token,
        unreachable_rounds: 0,
        critical_section_started: None,
        abort_ignored_logged: false,
    };

    tokio::spawn(async move {
        let exit = instance.run().await;
        exit_tx.send_replace(Some(exit));
    });

    handle
}

/// Replies from one fan-out round, split by outcome.
#[derive(Debug, Default)]
struct Round {
    acks: Vec<(ShardId, ParticipantReply)>,
    timed_out: Vec<ShardId>,
    rejected: Option<AbortReason>,
}

struct CoordinatorInstance {
    record: CoordinationRecord,
    services: CoordinatorServices,
    phase_tx: watch::Sender<CoordinatorPhase>,
    abort_token: CancellationToken,
    stop_token: CancellationToken,
    /// Consecutive rounds in the current phase with unreachable participants.
    unreachable_rounds: u32,
    critical_section_started: Option<Instant>,
    abort_ignored_logged: bool,
}

impl CoordinatorInstance {
    async fn run(mut self) -> InstanceExit {
        let metrics = self.services.metrics.clone();
        metrics.active_operations.inc();

        tracing::info!(
            operation_id = %self.record.operation_id,
            namespace = %self.record.source_namespace,
            phase = %self.record.phase,
            new_shard_key = %self.record.new_shard_key,
            "Coordinator instance started"
        );

        let exit = self.drive().await;
        metrics.active_operations.dec();

        match &exit {
            InstanceExit::Completed(completion) => tracing::info!(
                operation_id = %self.record.operation_id,
                outcome = %completion,
                "Resharding operation finished"
            ),
            InstanceExit::Interrupted => tracing::info!(
                operation_id = %self.record.operation_id,
                phase = %self.record.phase,
                "Coordinator instance stopped before completion"
            ),
        }
        exit
    }

    async fn drive(&mut self) -> InstanceExit {
        if let Err(e) = self.check_resumed_record().await {
            if let Some(exit) = self.on_step_error(e).await {
                return exit;
            }
        }

        loop {
            if self.stop_token.is_cancelled() {
                return InstanceExit::Interrupted;
            }

            match self.record.phase {
                CoordinatorPhase::Done => return self.finish(Completion::Committed),
                CoordinatorPhase::DoneAborted => {
                    let reason = self.record.abort_reason.clone().unwrap_or_else(|| {
                        AbortReason::new(
                            AbortKind::InvalidState,
                            CoordinatorPhase::DoneAborted,
                            "no abort reason recorded",
                        )
                    });
                    return self.finish(Completion::Aborted(reason));
                }
                _ => {}
            }

            let result = if self.user_abort_requested() {
                let reason = AbortReason::new(
                    AbortKind::UserAbort,
                    self.record.phase,
                    "abort requested by user",
                );
                self.begin_abort(reason).await
            } else {
                self.step().await
            };

            if let Err(e) = result {
                if let Some(exit) = self.on_step_error(e).await {
                    return exit;
                }
            }
        }
    }

    /// A resumed record that breaks its invariants is aborted, unless it may
    /// already be committed.
    async fn check_resumed_record(&mut self) -> Result<()> {
        let phase = self.record.phase;
        if phase.is_terminal() || phase.is_aborting() {
            return Ok(());
        }
        if let Err(e) = self.record.check_invariants() {
            if phase.is_past_commit_point() {
                tracing::error!(
                    operation_id = %self.record.operation_id,
                    error = %e,
                    "Committing record violates invariants, continuing commit"
                );
                return Ok(());
            }
            return self
                .begin_abort(AbortReason::new(AbortKind::InvalidState, phase, e.to_string()))
                .await;
        }
        Ok(())
    }

    /// Decide what to do after a failed step. `Some` ends the instance.
    async fn on_step_error(&mut self, error: Error) -> Option<InstanceExit> {
        match error {
            Error::PersistConflict { .. } => {
                tracing::warn!(
                    operation_id = %self.record.operation_id,
                    phase = %self.record.phase,
                    error = %error,
                    "Lost ownership of coordination record, stopping"
                );
                Some(InstanceExit::Interrupted)
            }
            Error::Interrupted => Some(InstanceExit::Interrupted),
            Error::InvalidTransition { .. } | Error::OperationNotFound(_) => {
                tracing::error!(
                    operation_id = %self.record.operation_id,
                    error = %error,
                    "Coordinator cannot continue"
                );
                Some(InstanceExit::Interrupted)
            }
            other => {
                tracing::warn!(
                    operation_id = %self.record.operation_id,
                    phase = %self.record.phase,
                    error = %other,
                    "Coordinator step failed, retrying"
                );
                match self.backoff().await {
                    Ok(()) => None,
                    Err(_) => Some(InstanceExit::Interrupted),
                }
            }
        }
    }

    fn user_abort_requested(&mut self) -> bool {
        if !self.abort_token.is_cancelled() || self.record.phase.is_aborting() {
            return false;
        }
        if self.record.phase.is_past_commit_point() {
            if !self.abort_ignored_logged {
                tracing::info!(
                    operation_id = %self.record.operation_id,
                    "Ignoring abort request, operation is committing"
                );
                self.abort_ignored_logged = true;
            }
            return false;
        }
        true
    }

    async fn step(&mut self) -> Result<()> {
        match self.record.phase {
            CoordinatorPhase::Unused => {
                let reason = AbortReason::new(
                    AbortKind::InvalidState,
                    CoordinatorPhase::Unused,
                    "record was never initialized",
                );
                self.begin_abort(reason).await
            }
            CoordinatorPhase::Initializing => self.initialize().await,
            CoordinatorPhase::PreparingToDonate => self.prepare_donors().await,
            CoordinatorPhase::Cloning => self.clone_recipients().await,
            CoordinatorPhase::Applying => self.apply_recipients().await,
            CoordinatorPhase::BlockingWrites => self.block_writes().await,
            CoordinatorPhase::Committing => self.commit().await,
            CoordinatorPhase::Aborting => self.abort_participants().await,
            CoordinatorPhase::Done | CoordinatorPhase::DoneAborted => Ok(()),
        }
    }

    // ========================================================================
    // Phase steps
    // ========================================================================

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn initialize(&mut self) -> Result<()> {
        let temporary = RoutingTable::new(
            self.record.temporary_namespace.clone(),
            self.record.operation_id,
            self.record.new_shard_key.clone(),
            self.record.initial_chunks.clone(),
        );
        self.services.directory.register_temporary(temporary).await?;

        tracing::debug!(
            temporary_namespace = %self.record.temporary_namespace,
            "Registered temporary routing entry"
        );
        self.advance(CoordinatorPhase::PreparingToDonate, |_| {}).await
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn prepare_donors(&mut self) -> Result<()> {
        let command = ParticipantCommand::PrepareDonor {
            source_namespace: self.record.source_namespace.clone(),
            new_shard_key: self.record.new_shard_key.clone(),
            recipients: self.record.recipient_ids(),
        };
        let targets = self.targets(ParticipantRole::Donor, &command);
        let round = self.round(targets, self.round_deadline()).await?;
        if let Some(reason) = round.rejected {
            return self.begin_abort(reason).await;
        }

        let mut ready = Vec::with_capacity(round.acks.len());
        for (shard_id, reply) in round.acks {
            match reply {
                ParticipantReply::DonorReady {
                    min_fetch_timestamp,
                } => ready.push((shard_id, min_fetch_timestamp)),
                other => return self.begin_abort(self.unexpected_reply(shard_id, &other)).await,
            }
        }

        let apply_ready = |record: &mut CoordinationRecord,
                           ready: &[(ShardId, Timestamp)],
                           phase: DonorPhase| {
            for (shard_id, ts) in ready {
                if let Some(donor) = record.donor_mut(shard_id) {
                    donor.phase = phase;
                    donor.min_fetch_timestamp = Some(*ts);
                }
            }
        };

        if !round.timed_out.is_empty() {
            self.record_progress(|r| apply_ready(r, &ready, DonorPhase::Ready))
                .await?;
            return self.on_unreachable(round.timed_out).await;
        }

        let fetch_timestamp = ready.iter().map(|(_, ts)| *ts).max();
        tracing::info!(
            fetch_timestamp = ?fetch_timestamp,
            donors = ready.len(),
            "All donors prepared"
        );
        self.advance(CoordinatorPhase::Cloning, |r| {
            apply_ready(r, &ready, DonorPhase::Donating);
            r.fetch_timestamp = fetch_timestamp;
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn clone_recipients(&mut self) -> Result<()> {
        let fetch_timestamp = self.record.fetch_timestamp.ok_or_else(|| {
            Error::InvariantViolation("cloning without a fetch timestamp".to_string())
        })?;
        let command = ParticipantCommand::StartClone {
            fetch_timestamp,
            donors: self.record.donor_ids(),
            temporary_namespace: self.record.temporary_namespace.clone(),
            new_shard_key: self.record.new_shard_key.clone(),
            chunks: self.record.initial_chunks.clone(),
        };
        let targets = self.targets(ParticipantRole::Recipient, &command);
        let round = self.round(targets, self.round_deadline()).await?;
        if let Some(reason) = round.rejected {
            return self.begin_abort(reason).await;
        }

        let mut statuses = Vec::with_capacity(round.acks.len());
        for (shard_id, reply) in round.acks {
            match reply {
                ParticipantReply::CloneStatus {
                    documents_copied,
                    documents_total,
                    done,
                } => statuses.push((shard_id, documents_copied, documents_total, done)),
                other => return self.begin_abort(self.unexpected_reply(shard_id, &other)).await,
            }
        }

        let apply_status = |record: &mut CoordinationRecord| {
            for (shard_id, copied, total, done) in &statuses {
                if let Some(recipient) = record.recipient_mut(shard_id) {
                    recipient.phase = if *done {
                        RecipientPhase::Cloned
                    } else {
                        RecipientPhase::Cloning
                    };
                    recipient.clone_progress.documents_copied = *copied;
                    recipient.clone_progress.documents_total = *total;
                }
            }
        };

        if !round.timed_out.is_empty() {
            self.record_progress(apply_status).await?;
            return self.on_unreachable(round.timed_out).await;
        }
        self.unreachable_rounds = 0;

        let all_done = statuses.iter().all(|(_, _, _, done)| *done);
        if all_done {
            return self.advance(CoordinatorPhase::Applying, apply_status).await;
        }
        self.record_progress(apply_status).await?;
        self.pause().await
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn apply_recipients(&mut self) -> Result<()> {
        let targets = self.targets(ParticipantRole::Recipient, &ParticipantCommand::StartApply);
        let round = self.round(targets, self.round_deadline()).await?;
        if let Some(reason) = round.rejected {
            return self.begin_abort(reason).await;
        }

        let mut lags = Vec::with_capacity(round.acks.len());
        for (shard_id, reply) in round.acks {
            match reply {
                ParticipantReply::ApplyStatus { lag_ms } => lags.push((shard_id, lag_ms)),
                other => return self.begin_abort(self.unexpected_reply(shard_id, &other)).await,
            }
        }

        let threshold = self.services.config.apply_lag_threshold_ms;
        let apply_lags = |record: &mut CoordinationRecord| {
            for (shard_id, lag_ms) in &lags {
                if let Some(recipient) = record.recipient_mut(shard_id) {
                    recipient.phase = if *lag_ms <= threshold {
                        RecipientPhase::Consistent
                    } else {
                        RecipientPhase::Applying
                    };
                    recipient.clone_progress.lag_ms = Some(*lag_ms);
                }
            }
        };

        if !round.timed_out.is_empty() {
            self.record_progress(apply_lags).await?;
            return self.on_unreachable(round.timed_out).await;
        }
        self.unreachable_rounds = 0;

        if lags.iter().all(|(_, lag)| *lag <= threshold) {
            return self.advance(CoordinatorPhase::BlockingWrites, apply_lags).await;
        }
        self.record_progress(apply_lags).await?;
        self.pause().await
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn block_writes(&mut self) -> Result<()> {
        let timeout = self.services.config.critical_section_timeout;
        let started = *self.critical_section_started.get_or_insert_with(Instant::now);
        let critical_deadline = started + timeout;

        if Instant::now() >= critical_deadline {
            let reason = AbortReason::new(
                AbortKind::CriticalSectionTimeout,
                CoordinatorPhase::BlockingWrites,
                format!("recipients not strictly consistent within {:?}", timeout),
            );
            return self.begin_abort(reason).await;
        }
        let deadline = self.round_deadline().min(critical_deadline);

        let Some(block_timestamp) = self.record.block_timestamp else {
            return self.block_donor_writes(deadline).await;
        };

        let command = ParticipantCommand::BlockWrites {
            block_timestamp: Some(block_timestamp),
        };
        let targets = self.targets(ParticipantRole::Recipient, &command);
        let round = self.round(targets, deadline).await?;
        if let Some(reason) = round.rejected {
            return self.begin_abort(reason).await;
        }

        let mut consistent = Vec::with_capacity(round.acks.len());
        for (shard_id, reply) in round.acks {
            match reply {
                ParticipantReply::ConsistencyStatus {
                    strictly_consistent,
                } => consistent.push((shard_id, strictly_consistent)),
                other => return self.begin_abort(self.unexpected_reply(shard_id, &other)).await,
            }
        }

        let apply_consistency = |record: &mut CoordinationRecord| {
            for (shard_id, strict) in &consistent {
                if *strict {
                    if let Some(recipient) = record.recipient_mut(shard_id) {
                        recipient.phase = RecipientPhase::StrictlyConsistent;
                    }
                }
            }
        };

        if !round.timed_out.is_empty() {
            self.record_progress(apply_consistency).await?;
            return self.on_unreachable(round.timed_out).await;
        }
        self.unreachable_rounds = 0;

        if consistent.iter().all(|(_, strict)| *strict) {
            return self
                .advance(CoordinatorPhase::Committing, apply_consistency)
                .await;
        }
        self.record_progress(apply_consistency).await?;
        self.pause().await
    }

    /// First half of the critical section: every donor blocks writes.
    async fn block_donor_writes(&mut self, deadline: Instant) -> Result<()> {
        let command = ParticipantCommand::BlockWrites {
            block_timestamp: None,
        };
        let targets = self.targets(ParticipantRole::Donor, &command);
        let round = self.round(targets, deadline).await?;
        if let Some(reason) = round.rejected {
            return self.begin_abort(reason).await;
        }

        let mut blocked = Vec::with_capacity(round.acks.len());
        for (shard_id, reply) in round.acks {
            match reply {
                ParticipantReply::CriticalSection { block_timestamp } => {
                    blocked.push((shard_id, block_timestamp))
                }
                other => return self.begin_abort(self.unexpected_reply(shard_id, &other)).await,
            }
        }

        let all_blocked = round.timed_out.is_empty();
        let block_timestamp = blocked.iter().map(|(_, ts)| *ts).max();
        self.record_progress(|r| {
            for (shard_id, _) in &blocked {
                if let Some(donor) = r.donor_mut(shard_id) {
                    donor.phase = DonorPhase::BlockingWrites;
                }
            }
            if all_blocked {
                r.block_timestamp = block_timestamp;
            }
        })
        .await?;

        if !all_blocked {
            return self.on_unreachable(round.timed_out).await;
        }
        self.unreachable_rounds = 0;
        tracing::info!(block_timestamp = ?block_timestamp, "Donor writes blocked");
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn commit(&mut self) -> Result<()> {
        let namespace = self.record.source_namespace.clone();
        let operation_id = self.record.operation_id;

        let current = self.services.directory.get_routing_table(&namespace).await?;
        let already_swapped = matches!(&current, Some(table) if table.collection_id == operation_id);

        if !already_swapped {
            let table = RoutingTable::new(
                namespace.clone(),
                operation_id,
                self.record.new_shard_key.clone(),
                self.record.initial_chunks.clone(),
            );
            match self
                .services
                .directory
                .atomically_swap_routing(&namespace, self.record.source_collection_id, table)
                .await
            {
                Ok(SwapOutcome::Swapped) => {
                    tracing::info!(namespace = %namespace, "Routing swapped to new shard key");
                }
                Ok(SwapOutcome::Conflict { found }) => {
                    let reason = AbortReason::new(
                        AbortKind::RoutingConflict,
                        CoordinatorPhase::Committing,
                        format!(
                            "{} is routed under collection {:?}, expected {}",
                            namespace, found, self.record.source_collection_id
                        ),
                    );
                    return self.begin_abort(reason).await;
                }
                Err(e) => {
                    // Outcome unknown; the next round reads the directory again.
                    tracing::warn!(error = %e, "Routing swap failed, re-checking directory");
                    return self.pause().await;
                }
            }
        }

        let (donors, recipients) = self
            .finish_participants(ParticipantCommand::CommitCleanup)
            .await?;
        self.services
            .directory
            .drop_routing(&self.record.temporary_namespace)
            .await?;

        self.advance(CoordinatorPhase::Done, |r| {
            for shard_id in &donors {
                if let Some(donor) = r.donor_mut(shard_id) {
                    donor.phase = DonorPhase::Done;
                }
            }
            for shard_id in &recipients {
                if let Some(recipient) = r.recipient_mut(shard_id) {
                    recipient.phase = RecipientPhase::Done;
                }
            }
        })
        .await
    }

    #[tracing::instrument(skip(self), fields(operation_id = %self.record.operation_id))]
    async fn abort_participants(&mut self) -> Result<()> {
        let reason = self
            .record
            .abort_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "aborted".to_string());

        let (donors, recipients) = self
            .finish_participants(ParticipantCommand::Abort { reason })
            .await?;
        self.services
            .directory
            .drop_routing(&self.record.temporary_namespace)
            .await?;

        self.advance(CoordinatorPhase::DoneAborted, |r| {
            for shard_id in &donors {
                if let Some(donor) = r.donor_mut(shard_id) {
                    donor.phase = DonorPhase::Aborted;
                }
            }
            for shard_id in &recipients {
                if let Some(recipient) = r.recipient_mut(shard_id) {
                    recipient.phase = RecipientPhase::Aborted;
                }
            }
        })
        .await
    }

    /// Send a terminal command to every participant once. Participants that
    /// do not ack are handed to the cleanup manager. Returns the donors and
    /// recipients that acked.
    async fn finish_participants(
        &self,
        command: ParticipantCommand,
    ) -> Result<(Vec<ShardId>, Vec<ShardId>)> {
        let mut targets = self.targets(ParticipantRole::Donor, &command);
        targets.extend(self.targets(ParticipantRole::Recipient, &command));

        let results = self.fan_out(targets, self.round_deadline()).await?;

        let mut donors = Vec::new();
        let mut recipients = Vec::new();
        let mut pending = Vec::new();
        for FanOutResult {
            shard_id,
            role,
            outcome,
        } in results
        {
            match (outcome, role) {
                (ParticipantOutcome::Ack(_), ParticipantRole::Donor) => donors.push(shard_id),
                (ParticipantOutcome::Ack(_), ParticipantRole::Recipient) => recipients.push(shard_id),
                (outcome, role) => {
                    tracing::warn!(
                        shard_id = %shard_id,
                        %role,
                        command = command.name(),
                        outcome = ?outcome,
                        "Participant did not ack, deferring to background cleanup"
                    );
                    pending.push(CleanupTarget { shard_id, role });
                }
            }
        }

        if !pending.is_empty() {
            self.services
                .cleanup
                .schedule_cleanup(self.record.operation_id, command, pending);
        }
        Ok((donors, recipients))
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn targets(
        &self,
        role: ParticipantRole,
        command: &ParticipantCommand,
    ) -> Vec<(ShardId, ParticipantRole, ParticipantCommand)> {
        let shards = match role {
            ParticipantRole::Donor => self.record.donor_ids(),
            ParticipantRole::Recipient => self.record.recipient_ids(),
        };
        shards
            .into_iter()
            .map(|shard_id| (shard_id, role, command.clone()))
            .collect()
    }

    fn round_deadline(&self) -> Instant {
        Instant::now() + self.services.config.participant_deadline
    }

    async fn fan_out(
        &self,
        targets: Vec<(ShardId, ParticipantRole, ParticipantCommand)>,
        deadline: Instant,
    ) -> Result<Vec<FanOutResult>> {
        let fan_out = self
            .services
            .proxy
            .fan_out(targets, self.record.operation_id, deadline);
        tokio::select! {
            results = fan_out => Ok(results),
            _ = self.stop_token.cancelled() => Err(Error::Interrupted),
        }
    }

    async fn round(
        &self,
        targets: Vec<(ShardId, ParticipantRole, ParticipantCommand)>,
        deadline: Instant,
    ) -> Result<Round> {
        let phase = self.record.phase;
        let mut round = Round::default();
        for result in self.fan_out(targets, deadline).await? {
            match result.outcome {
                ParticipantOutcome::Ack(reply) => round.acks.push((result.shard_id, reply)),
                ParticipantOutcome::TimedOut => round.timed_out.push(result.shard_id),
                ParticipantOutcome::Rejected { code, message } => {
                    if round.rejected.is_none() {
                        round.rejected = Some(AbortReason::participant(
                            result.shard_id,
                            phase,
                            format!("{}: {}", code, message),
                        ));
                    }
                }
            }
        }
        Ok(round)
    }

    fn unexpected_reply(&self, shard_id: ShardId, reply: &ParticipantReply) -> AbortReason {
        AbortReason::participant(
            shard_id,
            self.record.phase,
            format!("unexpected reply {:?}", reply),
        )
    }

    /// Count a round with unreachable participants; abort once too many
    /// consecutive rounds in this phase have timed out.
    async fn on_unreachable(&mut self, shards: Vec<ShardId>) -> Result<()> {
        self.unreachable_rounds += 1;
        let names = shards
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        tracing::warn!(
            operation_id = %self.record.operation_id,
            phase = %self.record.phase,
            shards = %names,
            rounds = self.unreachable_rounds,
            "Participants unreachable"
        );

        if self.unreachable_rounds >= self.services.config.max_unreachable_rounds {
            let reason = AbortReason::new(
                AbortKind::Unreachable,
                self.record.phase,
                format!(
                    "participants [{}] unreachable for {} rounds",
                    names, self.unreachable_rounds
                ),
            );
            return self.begin_abort(reason).await;
        }
        self.pause().await
    }

    /// Sleep one poll interval. Wakes early on a user abort and fails with
    /// `Interrupted` on stop.
    async fn pause(&self) -> Result<()> {
        let phase = self.record.phase;
        let abortable = !phase.is_aborting() && !phase.is_past_commit_point();
        tokio::select! {
            _ = tokio::time::sleep(self.services.config.poll_interval) => Ok(()),
            _ = self.stop_token.cancelled() => Err(Error::Interrupted),
            _ = self.abort_token.cancelled(), if abortable => Ok(()),
        }
    }

    /// Sleep one poll interval after a failed step. Only a stop cuts it short.
    async fn backoff(&self) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(self.services.config.poll_interval) => Ok(()),
            _ = self.stop_token.cancelled() => Err(Error::Interrupted),
        }
    }

    async fn begin_abort(&mut self, reason: AbortReason) -> Result<()> {
        tracing::warn!(
            operation_id = %self.record.operation_id,
            phase = %self.record.phase,
            reason = %reason,
            "Aborting resharding operation"
        );
        self.advance(CoordinatorPhase::Aborting, move |r| r.set_abort_reason(reason))
            .await
    }

    /// Persist a transition to `to`, then adopt it.
    async fn advance<F>(&mut self, to: CoordinatorPhase, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut CoordinationRecord),
    {
        let from = self.record.phase;
        let mut next = self.record.clone();
        mutate(&mut next);
        next.transition_to(to)?;
        self.write(next, from).await?;

        self.unreachable_rounds = 0;
        self.phase_tx.send_replace(to);
        tracing::info!(
            operation_id = %self.record.operation_id,
            from = %from,
            to = %to,
            revision = self.record.revision,
            "Coordinator phase advanced"
        );
        Ok(())
    }

    /// Fold participant progress into the record. Persisted only when a
    /// participant sub-phase or a timestamp changed; counters stay in memory.
    async fn record_progress<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut CoordinationRecord),
    {
        let mut next = self.record.clone();
        mutate(&mut next);

        if durable_view(&next) == durable_view(&self.record) {
            self.record = next;
            return Ok(());
        }
        next.last_updated_at_ms = now_ms();
        let phase = next.phase;
        self.write(next, phase).await
    }

    async fn write(&mut self, next: CoordinationRecord, expected_prior: CoordinatorPhase) -> Result<()> {
        match self.services.store.persist(&next, expected_prior).await {
            Ok(revision) => {
                self.record = next;
                self.record.revision = revision;
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::PersistConflict { .. }) {
                    self.services.metrics.persist_conflicts.inc();
                }
                Err(e)
            }
        }
    }

    fn finish(&mut self, completion: Completion) -> InstanceExit {
        let metrics = &self.services.metrics;
        if let Some(started) = self.critical_section_started.take() {
            metrics.critical_section_duration.observe(started.elapsed());
        }
        let elapsed = Duration::from_millis(now_ms().saturating_sub(self.record.started_at_ms));
        metrics.record_finished(completion == Completion::Committed, elapsed);
        if let Completion::Aborted(reason) = &completion {
            metrics.aborts_by_kind.inc(&reason.kind.to_string());
        }
        InstanceExit::Completed(completion)
    }
}

/// The parts of a record worth a durable write.
fn durable_view(
    record: &CoordinationRecord,
) -> (
    Vec<(DonorPhase, Option<Timestamp>)>,
    Vec<RecipientPhase>,
    Option<Timestamp>,
    Option<Timestamp>,
) {
    (
        record
            .donor_shards
            .iter()
            .map(|d| (d.phase, d.min_fetch_timestamp))
            .collect(),
        record.recipient_shards.iter().map(|r| r.phase).collect(),
        record.fetch_timestamp,
        record.block_timestamp,
    )
}
