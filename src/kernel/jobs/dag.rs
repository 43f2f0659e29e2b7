//! DAG planner (§4.D): Kahn's algorithm over `depends_on`, with level
//! partitioning for intra-level parallelism and deterministic tie-breaking.

use crate::kernel::jobs::model::Task;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    #[error("unknown dependency '{0}'")]
    UnknownDependency(String),
    #[error("cyclic dependency")]
    CyclicDependency,
}

/// Tasks grouped by level (level 0 = roots), each level internally ordered
/// by Task `order` then name for reproducible output.
#[derive(Debug)]
pub struct Plan {
    pub levels: Vec<Vec<Task>>,
}

impl Plan {
    /// Flatten into a single linear execution order (level by level).
    pub fn linear(self) -> Vec<Task> {
        self.levels.into_iter().flatten().collect()
    }
}

pub fn plan(tasks: Vec<Task>) -> Result<Plan, PlannerError> {
    let name_index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    // graph[i] = tasks that depend on task i; in_degree[i] = |task i's dependencies|
    let mut graph: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    let mut in_degree: Vec<usize> = vec![0; tasks.len()];

    for (i, task) in tasks.iter().enumerate() {
        for dep_name in &task.config.depends_on {
            let dep_index = *name_index
                .get(dep_name.as_str())
                .ok_or_else(|| PlannerError::UnknownDependency(dep_name.clone()))?;
            graph[dep_index].push(i);
            in_degree[i] += 1;
        }
    }

    let mut level_of: Vec<Option<usize>> = vec![None; tasks.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();
    let mut remaining = in_degree.clone();

    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            level_of[i] = Some(0);
            queue.push_back(i);
        }
    }

    let mut processed = 0;
    while let Some(i) = queue.pop_front() {
        processed += 1;
        let my_level = level_of[i].unwrap();
        for &next in &graph[i] {
            level_of[next] = Some(level_of[next].map_or(my_level + 1, |l| l.max(my_level + 1)));
            remaining[next] -= 1;
            if remaining[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if processed != tasks.len() {
        return Err(PlannerError::CyclicDependency);
    }

    let max_level = level_of.iter().filter_map(|l| *l).max().unwrap_or(0);
    let mut levels: Vec<Vec<Task>> = (0..=max_level).map(|_| Vec::new()).collect();

    let mut indexed: Vec<(usize, Task)> = tasks.into_iter().enumerate().collect();
    // Deterministic placement: iterate by (order, name) so ties within a
    // level come out reproducible regardless of input order.
    indexed.sort_by(|(_, a), (_, b)| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

    for (i, task) in indexed {
        levels[level_of[i].unwrap()].push(task);
    }

    Ok(Plan { levels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::model::{TaskConfig, TaskType};
    use uuid::Uuid;

    fn task(name: &str, order: i32, depends_on: &[&str]) -> Task {
        Task {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            name: name.to_string(),
            task_type: TaskType::Builtin,
            order,
            config: TaskConfig {
                depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn linear_chain_orders_by_dependency() {
        let tasks = vec![task("c", 2, &["b"]), task("a", 0, &[]), task("b", 1, &["a"])];
        let order: Vec<String> = plan(tasks).unwrap().linear().into_iter().map(|t| t.name).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_tasks_share_a_level() {
        let tasks = vec![task("a", 0, &[]), task("b", 1, &[]), task("c", 2, &["a", "b"])];
        let plan = plan(tasks).unwrap();
        assert_eq!(plan.levels.len(), 2);
        assert_eq!(plan.levels[0].len(), 2);
        assert_eq!(plan.levels[1][0].name, "c");
    }

    #[test]
    fn unknown_dependency_is_an_error() {
        let tasks = vec![task("a", 0, &["ghost"])];
        assert_eq!(plan(tasks).unwrap_err(), PlannerError::UnknownDependency("ghost".into()));
    }

    #[test]
    fn cycle_is_rejected() {
        let tasks = vec![task("a", 0, &["c"]), task("b", 1, &["a"]), task("c", 2, &["b"])];
        assert_eq!(plan(tasks).unwrap_err(), PlannerError::CyclicDependency);
    }

    #[test]
    fn ties_within_a_level_break_by_order_then_name() {
        let tasks = vec![task("z", 0, &[]), task("a", 1, &[])];
        let order: Vec<String> = plan(tasks).unwrap().linear().into_iter().map(|t| t.name).collect();
        assert_eq!(order, vec!["z", "a"]);
    }

    #[test]
    fn planner_is_idempotent() {
        let tasks = vec![task("b", 1, &["a"]), task("a", 0, &[])];
        let first: Vec<String> = plan(tasks.clone()).unwrap().linear().into_iter().map(|t| t.name).collect();
        let second: Vec<String> = plan(tasks).unwrap().linear().into_iter().map(|t| t.name).collect();
        assert_eq!(first, second);
    }
}
