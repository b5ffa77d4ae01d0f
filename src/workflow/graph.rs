//! 步骤依赖图
//!
//! 使用邻接表和入度表按「波次」推进：入度为 0 的步骤可以一起执行，完成后释放其后继。

use crate::workflow::types::{Step, WorkflowError};

pub struct StepGraph {
    /// 邻接表：步骤下标 -> 依赖它的步骤
    pub dependents: Vec<Vec<usize>>,
    /// 入度表：步骤下标 -> 未终结的依赖数
    pub in_degree: Vec<usize>,
}

impl StepGraph {
    /// 依赖只能指向更早的步骤，因此图必然无环
    pub fn new(steps: &[Step]) -> Result<Self, WorkflowError> {
        let mut dependents = vec![Vec::new(); steps.len()];
        let mut in_degree = vec![0; steps.len()];

        for (position, step) in steps.iter().enumerate() {
            if step.index != position {
                return Err(WorkflowError::InvalidPlan(format!(
                    "step at position {position} has index {}",
                    step.index
                )));
            }
            for &dep in &step.depends_on {
                if dep >= position {
                    return Err(WorkflowError::InvalidPlan(format!(
                        "step {position} depends on non-earlier step {dep}"
                    )));
                }
                dependents[dep].push(position);
                in_degree[position] += 1;
            }
        }

        Ok(Self {
            dependents,
            in_degree,
        })
    }

    /// 初始即可执行的步骤（升序）
    pub fn initial_ready(&self) -> Vec<usize> {
        self.in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| index)
            .collect()
    }

    /// 标记步骤终结，返回新变为可执行的步骤
    pub fn mark_terminal(&mut self, index: usize) -> Vec<usize> {
        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.dependents.get(index) {
            for &dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        newly_ready
    }
}
