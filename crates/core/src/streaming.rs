use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use serde::Serialize;
use refactory_provider::{is_context_error, CallOpts, ModelRole, ModelRouter};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::agents::prompts::TRANSFORMER_SYSTEM_PROMPT;
use crate::agents::transformer::{build_step_prompt, normalize_change, ChangeSet};
use crate::model::{CodeChange, RefactorPlan, RefactorStep};

/// Token budget for a regular batch and for the single all-steps batch.
const DEFAULT_MAX_TOKENS: u32 = 8192;
const WHOLE_PLAN_MAX_TOKENS: u32 = 30_000;

/// Separator between per-step templates inside one batch prompt.
const STEP_DELIMITER: &str = "\n\n---\n\n";

#[derive(Debug, Clone, Serialize)]
pub struct BatchFileSummary {
    pub file_path: String,
    pub change_type: String,
    pub lines_added: u32,
    pub lines_removed: u32,
}

/// Items the streaming transformer produces, in emission order. The
/// consumer applies each `Change` before the next item is received (the
/// channel is bounded at one item).
#[derive(Debug)]
pub enum TransformerEvent {
    BatchStarted {
        batch: usize,
        step_numbers: Vec<u32>,
        actions: Vec<String>,
    },
    Change(CodeChange),
    BatchCompleted {
        batch: usize,
        step_numbers: Vec<u32>,
        files: Vec<BatchFileSummary>,
    },
}

#[derive(Debug, Clone)]
pub struct TransformOptions {
    /// Steps per streamed call; <= 0 (or >= plan length) means all at once
    /// with an enlarged token budget.
    pub batch_size: i32,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self { batch_size: 4 }
    }
}

/// Start the streaming transformation. Returns the consumer side of a
/// bounded channel of events; the producer runs as its own task and stops
/// at the first non-recoverable error (sent as the final item).
pub fn transform_streaming(
    router: Arc<ModelRouter>,
    plan: RefactorPlan,
    repo_root: Option<PathBuf>,
    opts: TransformOptions,
) -> mpsc::Receiver<Result<TransformerEvent>> {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let total = plan.steps.len();
        let (chunk_size, max_tokens) =
            if opts.batch_size <= 0 || opts.batch_size as usize >= total {
                (total.max(1), WHOLE_PLAN_MAX_TOKENS)
            } else {
                (opts.batch_size as usize, DEFAULT_MAX_TOKENS)
            };

        info!(steps = total, chunk_size, "Starting streaming transformation");

        let mut files_seen: HashSet<String> = HashSet::new();
        let mut batch_counter = 0usize;

        for chunk in plan.steps.chunks(chunk_size) {
            let outcome = stream_group(
                &router,
                &plan,
                repo_root.as_deref(),
                chunk,
                max_tokens,
                &mut files_seen,
                &mut batch_counter,
                &tx,
            )
            .await;
            if let Err(e) = outcome {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }

        info!(files = files_seen.len(), "Streaming transformation finished");
    });

    rx
}

/// Stream one group of steps as a single call, halving the group on
/// token-limit failures until single steps remain. Each successful
/// (sub-)batch is framed by its own started/completed events.
async fn stream_group(
    router: &ModelRouter,
    plan: &RefactorPlan,
    repo_root: Option<&std::path::Path>,
    steps: &[RefactorStep],
    max_tokens: u32,
    files_seen: &mut HashSet<String>,
    batch_counter: &mut usize,
    tx: &mpsc::Sender<Result<TransformerEvent>>,
) -> Result<()> {
    *batch_counter += 1;
    let batch = *batch_counter;
    let step_numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
    let actions: Vec<String> = steps.iter().map(|s| s.action.clone()).collect();

    if tx
        .send(Ok(TransformerEvent::BatchStarted {
            batch,
            step_numbers: step_numbers.clone(),
            actions,
        }))
        .await
        .is_err()
    {
        anyhow::bail!("transformer consumer went away");
    }

    match stream_batch(router, plan, repo_root, steps, max_tokens, files_seen, tx).await {
        Ok(files) => {
            let _ = tx
                .send(Ok(TransformerEvent::BatchCompleted {
                    batch,
                    step_numbers,
                    files,
                }))
                .await;
            Ok(())
        }
        Err(e) if is_context_error(&e) && steps.len() > 1 => {
            warn!(
                batch,
                steps = steps.len(),
                "Token limit hit; halving the batch and retrying"
            );
            let half = steps.len().div_ceil(2);
            for sub in steps.chunks(half) {
                Box::pin(stream_group(
                    router,
                    plan,
                    repo_root,
                    sub,
                    max_tokens,
                    files_seen,
                    batch_counter,
                    tx,
                ))
                .await?;
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// One streamed call over the concatenated step prompts. Emits each newly
/// observed file exactly once, in the order files first appear in the
/// partial snapshots.
async fn stream_batch(
    router: &ModelRouter,
    plan: &RefactorPlan,
    repo_root: Option<&std::path::Path>,
    steps: &[RefactorStep],
    max_tokens: u32,
    files_seen: &mut HashSet<String>,
    tx: &mpsc::Sender<Result<TransformerEvent>>,
) -> Result<Vec<BatchFileSummary>> {
    let prompts: Vec<String> = steps
        .iter()
        .map(|step| build_step_prompt(step, plan, repo_root))
        .collect();
    let prompt = prompts.join(STEP_DELIMITER);

    let mut stream = router
        .stream_json::<ChangeSet>(
            ModelRole::Coder,
            Some(TRANSFORMER_SYSTEM_PROMPT),
            &prompt,
            CallOpts {
                temperature: Some(0.3),
                max_tokens: Some(max_tokens),
            },
        )
        .await?;

    let mut batch_files = Vec::new();
    while let Some(snapshot) = stream.next().await {
        let snapshot = snapshot?;
        for mut change in snapshot.changes {
            if change.file_path.is_empty() || files_seen.contains(&change.file_path) {
                continue;
            }
            files_seen.insert(change.file_path.clone());
            normalize_change(&mut change);
            batch_files.push(BatchFileSummary {
                file_path: change.file_path.clone(),
                change_type: change.change_type.to_string(),
                lines_added: change.lines_added,
                lines_removed: change.lines_removed,
            });
            if tx.send(Ok(TransformerEvent::Change(change))).await.is_err() {
                anyhow::bail!("transformer consumer went away");
            }
        }
    }

    Ok(batch_files)
}
