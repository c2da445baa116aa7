// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Grouping the levels of a butterfly network into passes that fit in local memory.

use super::params::BucketLayout;
use crate::ObliviousError;

/// How consecutive levels of the butterfly network are batched into passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MergeSchedule {
    /// One level per pass.
    Naive,
    /// Halve the level range recursively until each half fits the memory budget.
    CacheAware,
    /// Take as many levels as fit the memory budget, front to back.
    Greedy,
}

/// A run of consecutive levels applied while a group of buckets is held in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pass {
    pub first_level: u32,
    pub levels: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct NetworkPlan {
    pub layout: BucketLayout,
    pub passes: Vec<Pass>,
    /// The number of tasks loaded together, each processed independently.
    pub tasks_per_batch: usize,
    pub parallel: bool,
}

fn task_elements(layout: &BucketLayout, levels: u32) -> Option<usize> {
    layout
        .way
        .checked_pow(levels)?
        .checked_mul(layout.bucket_capacity)
}

fn fits(layout: &BucketLayout, levels: u32, memory_budget: usize) -> bool {
    task_elements(layout, levels).is_some_and(|size| size <= memory_budget)
}

fn cache_aware_passes(
    layout: &BucketLayout,
    first_level: u32,
    levels: u32,
    memory_budget: usize,
    passes: &mut Vec<Pass>,
) {
    if levels <= 1 || fits(layout, levels, memory_budget) {
        passes.push(Pass {
            first_level,
            levels,
        });
        return;
    }
    let half = levels / 2;
    cache_aware_passes(layout, first_level, half, memory_budget, passes);
    cache_aware_passes(
        layout,
        first_level + half,
        levels - half,
        memory_budget,
        passes,
    );
}

impl NetworkPlan {
    /// Plans the passes over `layout`, holding at most `memory_budget` elements per task.
    /// A parallel plan splits the budget between the worker threads of the rayon pool.
    pub fn new(
        layout: BucketLayout,
        schedule: MergeSchedule,
        memory_budget: usize,
        parallel: bool,
    ) -> Result<Self, ObliviousError> {
        if !fits(&layout, 1, memory_budget) {
            return Err(ObliviousError::InvalidConfigurationError(
                "the memory budget cannot hold the buckets of one merge-split",
            ));
        }

        let mut task_budget = memory_budget;
        if parallel {
            let threads = rayon::current_num_threads().max(1);
            task_budget = memory_budget / threads;
            if !fits(&layout, 1, task_budget) {
                log::warn!(
                    "Memory budget of {} elements too small to split between {} threads, \
                     falling back to one task per thread of {} elements.",
                    memory_budget,
                    threads,
                    memory_budget
                );
                task_budget = memory_budget;
            }
        }

        let mut passes = Vec::new();
        match schedule {
            MergeSchedule::Naive => {
                passes.extend((0..layout.levels).map(|first_level| Pass {
                    first_level,
                    levels: 1,
                }));
            }
            MergeSchedule::CacheAware => {
                cache_aware_passes(&layout, 0, layout.levels, task_budget, &mut passes);
            }
            MergeSchedule::Greedy => {
                let mut first_level = 0;
                while first_level < layout.levels {
                    let mut levels = 1;
                    while first_level + levels < layout.levels
                        && fits(&layout, levels + 1, task_budget)
                    {
                        levels += 1;
                    }
                    passes.push(Pass {
                        first_level,
                        levels,
                    });
                    first_level += levels;
                }
            }
        }

        let largest_task = passes
            .iter()
            .filter_map(|pass| task_elements(&layout, pass.levels))
            .max()
            .unwrap_or(layout.bucket_capacity);
        let tasks_per_batch = if parallel {
            (memory_budget / largest_task).max(1)
        } else {
            1
        };

        log::info!(
            "Butterfly plan: {} buckets of {} elements, {}-way, {} levels in {} passes.",
            layout.bucket_count,
            layout.bucket_capacity,
            layout.way,
            layout.levels,
            passes.len()
        );

        Ok(Self {
            layout,
            passes,
            tasks_per_batch,
            parallel,
        })
    }

    /// The number of independent tasks in `pass`.
    pub fn task_count(&self, pass: &Pass) -> usize {
        self.layout.bucket_count / self.layout.way.pow(pass.levels)
    }

    /// The number of buckets in each task of `pass`.
    pub fn buckets_per_task(&self, pass: &Pass) -> usize {
        self.layout.way.pow(pass.levels)
    }

    /// The index of the `local`-th bucket of task `task` in `pass`.
    ///
    /// The buckets of a task agree on every base-`way` digit of their index outside the levels
    /// of the pass; `local` supplies the digits inside.
    pub fn bucket_of(&self, pass: &Pass, task: usize, local: usize) -> usize {
        let way = self.layout.way;
        let stride = way.pow(pass.first_level);
        let low = task % stride;
        let high = task / stride;
        high * stride * way.pow(pass.levels) + local * stride + low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn layout(levels: u32, way: usize, bucket_capacity: usize) -> BucketLayout {
        let bucket_count = way.pow(levels);
        let n = (bucket_count * bucket_capacity / 2) as u64;
        let layout = BucketLayout::new(n, bucket_capacity, way).unwrap();
        assert_eq!(layout.levels, levels);
        layout
    }

    fn levels_of(plan: &NetworkPlan) -> Vec<u32> {
        plan.passes.iter().map(|pass| pass.levels).collect()
    }

    #[test]
    fn schedules_cover_every_level_in_order() {
        let layout = layout(7, 2, 4);
        let naive = NetworkPlan::new(layout, MergeSchedule::Naive, 32, false).unwrap();
        assert_eq!(levels_of(&naive), vec![1; 7]);

        // 2^3 buckets of 4 elements fit in 32.
        let greedy = NetworkPlan::new(layout, MergeSchedule::Greedy, 32, false).unwrap();
        assert_eq!(levels_of(&greedy), vec![3, 3, 1]);

        let cache_aware = NetworkPlan::new(layout, MergeSchedule::CacheAware, 32, false).unwrap();
        assert_eq!(levels_of(&cache_aware), vec![3, 2, 2]);

        for plan in [naive, greedy, cache_aware] {
            let mut next = 0;
            for pass in &plan.passes {
                assert_eq!(pass.first_level, next);
                next += pass.levels;
            }
            assert_eq!(next, 7);
        }
    }

    #[test]
    fn tasks_partition_the_buckets() {
        let layout = layout(4, 4, 2);
        let plan = NetworkPlan::new(layout, MergeSchedule::Naive, 1 << 10, false).unwrap();
        for pass in &plan.passes {
            let mut seen = HashSet::new();
            for task in 0..plan.task_count(pass) {
                for local in 0..plan.buckets_per_task(pass) {
                    let bucket = plan.bucket_of(pass, task, local);
                    // The local index supplies exactly the digit of this level.
                    let digit = (bucket / 4usize.pow(pass.first_level)) % 4;
                    assert_eq!(digit, local);
                    assert!(seen.insert(bucket));
                }
            }
            assert_eq!(seen.len(), layout.bucket_count);
        }
    }

    #[test]
    fn budget_too_small_is_rejected() {
        let layout = layout(3, 4, 8);
        assert!(matches!(
            NetworkPlan::new(layout, MergeSchedule::Greedy, 31, false),
            Err(ObliviousError::InvalidConfigurationError(_))
        ));
    }

    #[test]
    fn parallel_plans_batch_tasks() {
        let layout = layout(6, 2, 4);
        let plan = NetworkPlan::new(layout, MergeSchedule::Greedy, 1 << 12, true).unwrap();
        assert!(plan.tasks_per_batch >= 1);
        let sequential = NetworkPlan::new(layout, MergeSchedule::Greedy, 1 << 12, false).unwrap();
        assert_eq!(sequential.tasks_per_batch, 1);
        assert_eq!(levels_of(&sequential), vec![6]);
    }
}
