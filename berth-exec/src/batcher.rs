//! Commit batching.
//!
//! Reconfigure is a strict serialization point per VM, but several API
//! calls against the same container often arrive within one window. The
//! batcher groups pending members by an opaque group id (the VM ref),
//! runs a caller-supplied assessor over each member, and hands the
//! accepted set to a single processor call whose result fans out to
//! every member.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use berth_core::CoreError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Outcome of assessing one member before processing.
#[derive(Debug)]
pub enum Assessment {
    Accept,
    /// Fail the member as soon as it is assessed.
    RejectImmediate(CoreError),
    /// Fail the member just before the batch is dispatched.
    RejectWaitIssue(CoreError),
    /// Fail the member after the batch completes.
    RejectWaitComplete(CoreError),
}

/// Batcher tuning.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Bound of each per-group queue.
    pub queue_depth: usize,
    /// A group worker exits after this long without members.
    pub idle_timeout: Duration,
    /// When set, the next batch for a group starts only after the
    /// previous batch's processor returned.
    pub serialize_groups: bool,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            queue_depth: 100,
            idle_timeout: Duration::from_secs(5),
            serialize_groups: true,
        }
    }
}

type Result_<R> = Result<R, CoreError>;
type BoxFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

/// Decides whether each member joins the batch.
pub type Assessor<M> = Arc<dyn Fn(&M) -> Assessment + Send + Sync>;

/// Processes the accepted members of one batch. The single result is
/// delivered to every accepted member.
pub type Processor<M, R> = Arc<dyn Fn(Vec<M>) -> BoxFuture<Result_<R>> + Send + Sync>;

struct Pending<M, R> {
    member: M,
    /// How long this member is willing to linger waiting for batchmates.
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result_<R>>,
}

struct Submission<M, R> {
    group: String,
    pending: Pending<M, R>,
}

/// Groups and dispatches batch members. Cheap to clone.
pub struct Batcher<M, R> {
    tx: mpsc::Sender<Submission<M, R>>,
}

impl<M, R> Clone for Batcher<M, R> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M, R> Batcher<M, R>
where
    M: Send + 'static,
    R: Clone + Send + 'static,
{
    #[must_use]
    pub fn new(config: BatcherConfig, assessor: Assessor<M>, processor: Processor<M, R>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        tokio::spawn(dispatch(config, rx, assessor, processor));
        Self { tx }
    }

    /// Submits `member` and waits for its batch to complete.
    ///
    /// # Errors
    /// The assessor's rejection, the processor's error, or
    /// [`CoreError::InfrastructureFault`] if the batcher is gone.
    pub async fn queue_sync(
        &self,
        group: impl Into<String>,
        member: M,
        tolerance: Option<Duration>,
    ) -> Result_<R> {
        let rx = self.queue_async(group, member, tolerance).await?;
        rx.await
            .map_err(|_| CoreError::InfrastructureFault("batcher dropped member".into()))?
    }

    /// Submits `member`, returning a channel that resolves with the
    /// batch outcome.
    ///
    /// # Errors
    /// [`CoreError::InfrastructureFault`] if the batcher has shut down.
    pub async fn queue_async(
        &self,
        group: impl Into<String>,
        member: M,
        tolerance: Option<Duration>,
    ) -> Result_<oneshot::Receiver<Result_<R>>> {
        let (reply, rx) = oneshot::channel();
        let pending = Pending {
            member,
            deadline: tolerance.map(|t| Instant::now() + t),
            reply,
        };
        self.tx
            .send(Submission {
                group: group.into(),
                pending,
            })
            .await
            .map_err(|_| CoreError::InfrastructureFault("batcher shut down".into()))?;
        Ok(rx)
    }
}

async fn dispatch<M, R>(
    config: BatcherConfig,
    mut rx: mpsc::Receiver<Submission<M, R>>,
    assessor: Assessor<M>,
    processor: Processor<M, R>,
) where
    M: Send + 'static,
    R: Clone + Send + 'static,
{
    let mut groups: HashMap<String, mpsc::Sender<Pending<M, R>>> = HashMap::new();

    while let Some(submission) = rx.recv().await {
        let Submission { group, mut pending } = submission;

        // Workers idle-exit; a closed channel means respawn and resend.
        if let Some(tx) = groups.get(&group) {
            match tx.send(pending).await {
                Ok(()) => continue,
                Err(mpsc::error::SendError(p)) => {
                    pending = p;
                    groups.remove(&group);
                }
            }
        }

        let (tx, worker_rx) = mpsc::channel(config.queue_depth);
        tokio::spawn(group_worker(
            group.clone(),
            config.clone(),
            worker_rx,
            Arc::clone(&assessor),
            Arc::clone(&processor),
        ));
        // The channel was just created; capacity is available.
        if tx.send(pending).await.is_err() {
            tracing::warn!(group, "batch worker exited before first member");
        }
        groups.insert(group, tx);
    }
}

async fn group_worker<M, R>(
    group: String,
    config: BatcherConfig,
    mut rx: mpsc::Receiver<Pending<M, R>>,
    assessor: Assessor<M>,
    processor: Processor<M, R>,
) where
    M: Send + 'static,
    R: Clone + Send + 'static,
{
    loop {
        let first = match tokio::time::timeout(config.idle_timeout, rx.recv()).await {
            Ok(Some(p)) => p,
            // Idle or closed: exit, the dispatcher respawns on demand.
            Ok(None) | Err(_) => return,
        };

        let mut batch = vec![first];
        // Linger until the earliest member deadline, picking up
        // batchmates as they arrive.
        loop {
            let Some(deadline) = batch.iter().filter_map(|p| p.deadline).min() else {
                break;
            };
            let now = Instant::now();
            if deadline <= now {
                break;
            }
            match tokio::time::timeout(deadline - now, rx.recv()).await {
                Ok(Some(p)) => batch.push(p),
                Ok(None) | Err(_) => break,
            }
        }
        // Also drain anything already queued.
        while let Ok(p) = rx.try_recv() {
            batch.push(p);
        }

        tracing::debug!(group, size = batch.len(), "dispatching batch");
        let run = run_batch(batch, Arc::clone(&assessor), Arc::clone(&processor));
        if config.serialize_groups {
            run.await;
        } else {
            tokio::spawn(run);
        }
    }
}

async fn run_batch<M, R>(batch: Vec<Pending<M, R>>, assessor: Assessor<M>, processor: Processor<M, R>)
where
    M: Send + 'static,
    R: Clone + Send + 'static,
{
    let mut accepted = Vec::new();
    let mut accepted_replies = Vec::new();
    let mut reject_after = Vec::new();

    for pending in batch {
        match assessor(&pending.member) {
            Assessment::Accept => {
                accepted.push(pending.member);
                accepted_replies.push(pending.reply);
            }
            Assessment::RejectImmediate(e) | Assessment::RejectWaitIssue(e) => {
                let _ = pending.reply.send(Err(e));
            }
            Assessment::RejectWaitComplete(e) => {
                reject_after.push((pending.reply, e));
            }
        }
    }

    if !accepted.is_empty() {
        let result = processor(accepted).await;
        for reply in accepted_replies {
            let _ = reply.send(result.clone());
        }
    }

    for (reply, e) in reject_after {
        let _ = reply.send(Err(e));
    }
}
