use undoable_types::ScheduledJob;

/// One recorded job mutation, held as full snapshots so undo and redo can
/// replay without diffing.
#[derive(Debug, Clone)]
pub enum JobMutation {
    Create { after: ScheduledJob },
    Update { before: ScheduledJob, after: ScheduledJob },
    Delete { before: ScheduledJob },
}

impl JobMutation {
    pub fn kind(&self) -> &'static str {
        match self {
            JobMutation::Create { .. } => "create",
            JobMutation::Update { .. } => "update",
            JobMutation::Delete { .. } => "delete",
        }
    }
}

/// In-memory only: the job store on disk stays authoritative.
#[derive(Default)]
pub struct JobHistory {
    undo: Vec<JobMutation>,
    redo: Vec<JobMutation>,
}

impl JobHistory {
    pub fn record(&mut self, mutation: JobMutation) {
        self.undo.push(mutation);
        // Any new user mutation invalidates the redo branch.
        self.redo.clear();
    }

    pub fn pop_undo(&mut self) -> Option<JobMutation> {
        let mutation = self.undo.pop()?;
        self.redo.push(mutation.clone());
        Some(mutation)
    }

    pub fn pop_redo(&mut self) -> Option<JobMutation> {
        let mutation = self.redo.pop()?;
        self.undo.push(mutation.clone());
        Some(mutation)
    }

    pub fn depths(&self) -> (usize, usize) {
        (self.undo.len(), self.redo.len())
    }
}
