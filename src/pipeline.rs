//! Asynchronous copy pipeline protocol
//!
//! Copies are issued into an open batch, `commit` turns the open batch into
//! the newest pending group, `wait_group(n)` retires the oldest groups until at
//! most `n` remain and `wait_all` retires everything. [`simulate`] replays the
//! protocol calls of a statement block against an [`AsyncCopyQueue`].

use std::collections::VecDeque;

use serde::Serialize;
use tracing::trace;

use crate::error::{LowerError, LowerResult};
use crate::intrinsics::cp_async::MAX_WAIT_GROUPS;
use crate::intrinsics::registry::CUDA_PREFIX;
use crate::ir::{Expr, Stmt};

/// One protocol operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineEvent {
    Issue { bytes: usize },
    Commit,
    WaitGroup(usize),
    WaitAll,
}

impl PipelineEvent {
    /// Protocol event performed by a call to the intrinsic `name`
    pub fn from_call(name: &str) -> Option<PipelineEvent> {
        let name = name.strip_prefix(CUDA_PREFIX)?;
        match name {
            "cp_async_commit_group" => return Some(PipelineEvent::Commit),
            "cp_async_wait_all" => return Some(PipelineEvent::WaitAll),
            _ => {}
        }
        if let Some(n) = name.strip_prefix("cp_async_wait_group_") {
            return n.parse().ok().map(PipelineEvent::WaitGroup);
        }
        let size = name.strip_prefix("cp_async_size_")?;
        let bytes = size.split('_').next()?.parse().ok()?;
        Some(PipelineEvent::Issue { bytes })
    }
}

/// Copies closed together by one commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopyGroup {
    pub id: usize,
    pub copies: usize,
    pub bytes: usize,
}

/// Ordered queue of outstanding copy groups
#[derive(Debug, Clone, Default, Serialize)]
pub struct AsyncCopyQueue {
    open_copies: usize,
    open_bytes: usize,
    pending: VecDeque<CopyGroup>,
    completed: Vec<CopyGroup>,
    next_group: usize,
}

impl AsyncCopyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, bytes: usize) {
        self.open_copies += 1;
        self.open_bytes += bytes;
    }

    /// Close the open batch into a new pending group (possibly empty)
    pub fn commit(&mut self) -> usize {
        let id = self.next_group;
        self.next_group += 1;
        self.pending.push_back(CopyGroup {
            id,
            copies: std::mem::take(&mut self.open_copies),
            bytes: std::mem::take(&mut self.open_bytes),
        });
        id
    }

    /// Retire the oldest groups until at most `n` are pending
    pub fn wait_group(&mut self, n: usize) -> LowerResult<Vec<CopyGroup>> {
        if n >= MAX_WAIT_GROUPS {
            return Err(LowerError::invalid_param(format!(
                "wait_group count must be in [0, {}), got {}",
                MAX_WAIT_GROUPS, n
            )));
        }
        let mut retired = Vec::new();
        while self.pending.len() > n {
            if let Some(group) = self.pending.pop_front() {
                retired.push(group);
            }
        }
        self.completed.extend(retired.iter().cloned());
        Ok(retired)
    }

    /// Retire every copy, including ones not yet committed
    pub fn wait_all(&mut self) -> Vec<CopyGroup> {
        if self.open_copies > 0 {
            self.commit();
        }
        let retired: Vec<CopyGroup> = self.pending.drain(..).collect();
        self.completed.extend(retired.iter().cloned());
        retired
    }

    pub fn apply(&mut self, event: PipelineEvent) -> LowerResult<()> {
        trace!(?event, pending = self.pending.len(), "pipeline event");
        match event {
            PipelineEvent::Issue { bytes } => self.issue(bytes),
            PipelineEvent::Commit => {
                self.commit();
            }
            PipelineEvent::WaitGroup(n) => {
                self.wait_group(n)?;
            }
            PipelineEvent::WaitAll => {
                self.wait_all();
            }
        }
        Ok(())
    }

    pub fn pending_groups(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &CopyGroup> {
        self.pending.iter()
    }

    /// Copies issued since the last commit
    pub fn uncommitted(&self) -> usize {
        self.open_copies
    }

    pub fn completed(&self) -> &[CopyGroup] {
        &self.completed
    }

    /// No copy is outstanding, committed or not
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.open_copies == 0
    }
}

/// Replay the copy protocol calls in `stmt`.
///
/// Loops with a constant extent are unrolled; data-dependent control flow
/// cannot be replayed and is rejected.
pub fn simulate(stmt: &Stmt) -> LowerResult<AsyncCopyQueue> {
    let mut queue = AsyncCopyQueue::new();
    replay(stmt, &mut queue)?;
    Ok(queue)
}

fn replay(stmt: &Stmt, queue: &mut AsyncCopyQueue) -> LowerResult<()> {
    match stmt {
        Stmt::Seq(stmts) => stmts.iter().try_for_each(|s| replay(s, queue)),
        Stmt::For { var, extent, body } => {
            let Some(extent) = extent.as_const_int() else {
                return Err(LowerError::unsupported(format!(
                    "cannot replay loop over `{}` with non-constant extent {}",
                    var, extent
                )));
            };
            for _ in 0..extent.max(0) {
                replay(body, queue)?;
            }
            Ok(())
        }
        Stmt::If { cond, .. } => Err(LowerError::unsupported(format!(
            "cannot replay conditional on {}",
            cond
        ))),
        Stmt::Evaluate(Expr::Call { func, .. }) => match PipelineEvent::from_call(func) {
            Some(event) => queue.apply(event),
            None => Ok(()),
        },
        _ => Ok(()),
    }
}
