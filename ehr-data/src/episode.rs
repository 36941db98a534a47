use crate::subset::{LabeledBatch, Subset};

/// One task of an episode: adapt on `support`, score on `query`
pub struct TaskBatch {
    pub support: LabeledBatch,
    pub query: LabeledBatch,
}

/// A meta-batch of tasks
pub struct Episode {
    pub iteration: usize,
    pub tasks: Vec<TaskBatch>,
}

impl Episode {
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }
}

/// Support and query samples for evaluation; the query side may be a
/// whole held-out fold, so it stays unmaterialized
#[derive(Clone)]
pub struct EvalTask {
    pub support: Subset,
    pub query: Subset,
}
