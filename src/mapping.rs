//! Task mappings: distributing a task grid over workers
//!
//! A mapping assigns every point of a `task_shape` grid to one of
//! `num_workers` workers (warp lanes). Two primitives exist:
//!
//! - spatial: each worker owns exactly one task
//! - repeat: a single worker iterates over every task
//!
//! and `compose(outer, inner)` (also `outer * inner`) nests `inner` inside
//! `outer`: the task grid and the worker count multiply, and each worker's
//! task list is the outer list with every entry expanded by the inner list.
//! The order of a worker's task list is the order of its fragment registers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LowerError, LowerResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum MappingKind {
    Spatial { ranks: Vec<usize> },
    Repeat { ranks: Vec<usize> },
    Compose { outer: Box<TaskMapping>, inner: Box<TaskMapping> },
}

/// Immutable task-to-worker distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMapping {
    task_shape: Vec<usize>,
    num_workers: usize,
    tasks_per_worker: usize,
    kind: MappingKind,
}

/// Spatial mapping with an explicit dimension order.
///
/// `ranks[d]` is the nesting position of dimension `d`: rank 0 varies slowest.
pub fn spatial_map(task_shape: &[usize], ranks: &[usize]) -> LowerResult<TaskMapping> {
    check_ranks(task_shape, ranks)?;
    Ok(TaskMapping {
        task_shape: task_shape.to_vec(),
        num_workers: task_shape.iter().product(),
        tasks_per_worker: 1,
        kind: MappingKind::Spatial {
            ranks: ranks.to_vec(),
        },
    })
}

/// Repeat mapping with an explicit dimension order
pub fn repeat_map(task_shape: &[usize], ranks: &[usize]) -> LowerResult<TaskMapping> {
    check_ranks(task_shape, ranks)?;
    Ok(TaskMapping {
        task_shape: task_shape.to_vec(),
        num_workers: 1,
        tasks_per_worker: task_shape.iter().product(),
        kind: MappingKind::Repeat {
            ranks: ranks.to_vec(),
        },
    })
}

/// One task per worker, workers laid out row-major
pub fn row_spatial(task_shape: &[usize]) -> TaskMapping {
    TaskMapping {
        task_shape: task_shape.to_vec(),
        num_workers: task_shape.iter().product(),
        tasks_per_worker: 1,
        kind: MappingKind::Spatial {
            ranks: row_ranks(task_shape.len()),
        },
    }
}

/// One task per worker, workers laid out column-major
pub fn col_spatial(task_shape: &[usize]) -> TaskMapping {
    TaskMapping {
        task_shape: task_shape.to_vec(),
        num_workers: task_shape.iter().product(),
        tasks_per_worker: 1,
        kind: MappingKind::Spatial {
            ranks: col_ranks(task_shape.len()),
        },
    }
}

/// All tasks on one worker, iterated row-major
pub fn row_repeat(task_shape: &[usize]) -> TaskMapping {
    TaskMapping {
        task_shape: task_shape.to_vec(),
        num_workers: 1,
        tasks_per_worker: task_shape.iter().product(),
        kind: MappingKind::Repeat {
            ranks: row_ranks(task_shape.len()),
        },
    }
}

/// All tasks on one worker, iterated column-major
pub fn col_repeat(task_shape: &[usize]) -> TaskMapping {
    TaskMapping {
        task_shape: task_shape.to_vec(),
        num_workers: 1,
        tasks_per_worker: task_shape.iter().product(),
        kind: MappingKind::Repeat {
            ranks: col_ranks(task_shape.len()),
        },
    }
}

/// Ordered product: `inner` is nested inside `outer`
pub fn compose(outer: &TaskMapping, inner: &TaskMapping) -> LowerResult<TaskMapping> {
    if outer.task_shape.len() != inner.task_shape.len() {
        return Err(LowerError::config(format!(
            "cannot compose {}-d mapping {} with {}-d mapping {}",
            outer.task_shape.len(),
            outer,
            inner.task_shape.len(),
            inner
        )));
    }
    Ok(TaskMapping {
        task_shape: outer
            .task_shape
            .iter()
            .zip(&inner.task_shape)
            .map(|(a, b)| a * b)
            .collect(),
        num_workers: outer.num_workers * inner.num_workers,
        tasks_per_worker: outer.tasks_per_worker * inner.tasks_per_worker,
        kind: MappingKind::Compose {
            outer: Box::new(outer.clone()),
            inner: Box::new(inner.clone()),
        },
    })
}

impl TaskMapping {
    pub fn task_shape(&self) -> &[usize] {
        &self.task_shape
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn tasks_per_worker(&self) -> usize {
        self.tasks_per_worker
    }

    pub fn num_tasks(&self) -> usize {
        self.task_shape.iter().product()
    }

    /// Task coordinates owned by `worker`, in fragment order
    pub fn worker_tasks(&self, worker: usize) -> LowerResult<Vec<Vec<usize>>> {
        if worker >= self.num_workers {
            return Err(LowerError::invalid_param(format!(
                "worker {} out of range for {} (has {} workers)",
                worker, self, self.num_workers
            )));
        }
        Ok(self.tasks_of(worker))
    }

    fn tasks_of(&self, worker: usize) -> Vec<Vec<usize>> {
        match &self.kind {
            MappingKind::Spatial { ranks } => vec![unravel(worker, &self.task_shape, ranks)],
            MappingKind::Repeat { ranks } => (0..self.num_tasks())
                .map(|t| unravel(t, &self.task_shape, ranks))
                .collect(),
            MappingKind::Compose { outer, inner } => {
                let outer_tasks = outer.tasks_of(worker / inner.num_workers);
                let inner_tasks = inner.tasks_of(worker % inner.num_workers);
                let mut tasks = Vec::with_capacity(outer_tasks.len() * inner_tasks.len());
                for ot in &outer_tasks {
                    for it in &inner_tasks {
                        tasks.push(
                            ot.iter()
                                .zip(it)
                                .zip(&inner.task_shape)
                                .map(|((o, i), extent)| o * extent + i)
                                .collect(),
                        );
                    }
                }
                tasks
            }
        }
    }

    /// Check this mapping can be bound to `lanes` physical workers
    pub fn bind(&self, lanes: usize) -> LowerResult<()> {
        if self.num_workers == 0 || lanes % self.num_workers != 0 {
            return Err(LowerError::config(format!(
                "{} uses {} workers, which does not divide {} lanes",
                self, self.num_workers, lanes
            )));
        }
        Ok(())
    }

    /// Whether every task is owned by exactly one (worker, slot) pair
    pub fn is_partition(&self) -> bool {
        let total = self.num_tasks();
        if self.num_workers * self.tasks_per_worker != total {
            return false;
        }
        let mut seen = vec![false; total];
        for worker in 0..self.num_workers {
            for task in self.tasks_of(worker) {
                let flat = task
                    .iter()
                    .zip(&self.task_shape)
                    .fold(0, |acc, (i, extent)| acc * extent + i);
                if flat >= total || seen[flat] {
                    return false;
                }
                seen[flat] = true;
            }
        }
        true
    }
}

impl std::ops::Mul for TaskMapping {
    type Output = LowerResult<TaskMapping>;

    /// Shorthand for [`compose`]
    fn mul(self, inner: TaskMapping) -> LowerResult<TaskMapping> {
        compose(&self, &inner)
    }
}

/// Lets products chain: `a * b * c`; an earlier rank error is passed through
impl std::ops::Mul<TaskMapping> for LowerResult<TaskMapping> {
    type Output = LowerResult<TaskMapping>;

    fn mul(self, inner: TaskMapping) -> LowerResult<TaskMapping> {
        compose(&self?, &inner)
    }
}

impl fmt::Display for TaskMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self
            .task_shape
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match &self.kind {
            MappingKind::Spatial { ranks } | MappingKind::Repeat { ranks } => {
                let base = if matches!(self.kind, MappingKind::Spatial { .. }) {
                    "spatial"
                } else {
                    "repeat"
                };
                if *ranks == row_ranks(ranks.len()) {
                    write!(f, "row_{}({})", base, shape)
                } else if *ranks == col_ranks(ranks.len()) {
                    write!(f, "col_{}({})", base, shape)
                } else {
                    write!(f, "{}({}; ranks={:?})", base, shape, ranks)
                }
            }
            MappingKind::Compose { outer, inner } => write!(f, "{} * {}", outer, inner),
        }
    }
}

fn row_ranks(rank: usize) -> Vec<usize> {
    (0..rank).collect()
}

fn col_ranks(rank: usize) -> Vec<usize> {
    (0..rank).rev().collect()
}

fn check_ranks(task_shape: &[usize], ranks: &[usize]) -> LowerResult<()> {
    let mut sorted = ranks.to_vec();
    sorted.sort_unstable();
    if ranks.len() != task_shape.len() || sorted != row_ranks(ranks.len()) {
        return Err(LowerError::config(format!(
            "ranks {:?} are not a permutation of the {} dimensions",
            ranks,
            task_shape.len()
        )));
    }
    Ok(())
}

/// Coordinates of the `index`-th point when dimensions nest in rank order
fn unravel(mut index: usize, shape: &[usize], ranks: &[usize]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..shape.len()).collect();
    order.sort_by_key(|d| ranks[*d]);
    let mut coords = vec![0; shape.len()];
    for &dim in order.iter().rev() {
        coords[dim] = index % shape[dim];
        index /= shape[dim];
    }
    coords
}
