//! Dependency readiness and cycle detection.
//!
//! Cycle checks run when a job is created or its dependencies change. Readiness
//! is evaluated on every dispatch tick against a fresh snapshot of the
//! dependencies' statuses and is never cached.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};

#[derive(Debug, Clone)]
struct DependencyNode {
    name: String,
    dependencies: Vec<Uuid>,
}

/// Name and edge view of the job set, built from a store snapshot.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<Uuid, DependencyNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleCheck {
    pub cyclic: bool,
    /// Job names along the cycle; first and last entries are the same job.
    pub path: Vec<String>,
}

impl DependencyGraph {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let nodes = jobs
            .into_iter()
            .map(|job| {
                (
                    job.id,
                    DependencyNode {
                        name: job.name.clone(),
                        dependencies: job.dependencies.clone(),
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    /// Insert or replace one job's name and edges, e.g. with proposed values
    /// before they are stored.
    pub fn set_job(&mut self, id: Uuid, name: impl Into<String>, dependencies: Vec<Uuid>) {
        self.nodes.insert(
            id,
            DependencyNode {
                name: name.into(),
                dependencies,
            },
        );
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.nodes.contains_key(id)
    }

    /// Ids in `candidates` that are not in the graph.
    pub fn missing(&self, candidates: &[Uuid]) -> Vec<Uuid> {
        candidates
            .iter()
            .filter(|id| !self.contains(id))
            .copied()
            .collect()
    }

    /// Walk the chain from `job_name` through `candidate_deps`, depth first.
    ///
    /// Reports a cycle as soon as a name reappears on the current path. For an
    /// update, register the proposed name and edges with [`set_job`] first so
    /// the walk meets the job again under its new name.
    ///
    /// [`set_job`]: DependencyGraph::set_job
    pub fn check_cycle(&self, job_name: &str, candidate_deps: &[Uuid]) -> CycleCheck {
        let mut path = Vec::new();
        let mut finished = HashSet::new();
        match self.walk(job_name, candidate_deps, &mut path, &mut finished) {
            Some(cycle) => CycleCheck {
                cyclic: true,
                path: cycle,
            },
            None => CycleCheck {
                cyclic: false,
                path: Vec::new(),
            },
        }
    }

    fn walk(
        &self,
        name: &str,
        dependencies: &[Uuid],
        path: &mut Vec<String>,
        finished: &mut HashSet<Uuid>,
    ) -> Option<Vec<String>> {
        if let Some(start) = path.iter().position(|seen| seen == name) {
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Some(cycle);
        }

        path.push(name.to_string());
        for dep_id in dependencies {
            if finished.contains(dep_id) {
                continue;
            }
            let Some(node) = self.nodes.get(dep_id) else {
                continue;
            };
            if let Some(cycle) = self.walk(&node.name, &node.dependencies, path, finished) {
                return Some(cycle);
            }
            finished.insert(*dep_id);
        }
        path.pop();
        None
    }
}

/// Current name and status of a dependency, as read at tick time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyState {
    pub name: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingDependency {
    pub id: Uuid,
    /// `None` when the dependency no longer exists.
    pub state: Option<DependencyState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub blocking: Vec<BlockingDependency>,
    no_dependencies: bool,
}

impl Readiness {
    pub fn reason(&self) -> String {
        if self.no_dependencies {
            return "No dependencies".to_string();
        }
        if self.ready {
            return "All dependencies met".to_string();
        }
        let waiting: Vec<String> = self
            .blocking
            .iter()
            .map(|dep| match &dep.state {
                Some(state) => format!("{} ({})", state.name, state.status),
                None => format!("{} (missing)", dep.id),
            })
            .collect();
        format!("Waiting for dependencies: {}", waiting.join(", "))
    }
}

/// A job is ready when every dependency has status `success`.
pub fn is_ready(job: &Job, snapshot: &HashMap<Uuid, DependencyState>) -> Readiness {
    if job.dependencies.is_empty() {
        return Readiness {
            ready: true,
            blocking: Vec::new(),
            no_dependencies: true,
        };
    }

    let blocking: Vec<BlockingDependency> = job
        .dependencies
        .iter()
        .filter_map(|id| match snapshot.get(id) {
            Some(state) if state.status == JobStatus::Success => None,
            state => Some(BlockingDependency {
                id: *id,
                state: state.cloned(),
            }),
        })
        .collect();

    Readiness {
        ready: blocking.is_empty(),
        blocking,
        no_dependencies: false,
    }
}
