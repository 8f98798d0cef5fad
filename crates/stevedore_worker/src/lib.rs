//! Job lifecycle engine and the import/export pipelines.
//!
//! A job run is one logical flow of control: claim, process in small
//! cooperative steps with suspension points at I/O, finalize, emit the
//! lifecycle event. Failure in one job never fails another.

pub mod abort;
pub mod engine;
pub mod events;
pub mod export;
pub mod import;
pub mod report;

pub use abort::AbortSignal;
pub use engine::{
    derive_import_status, start_job, CancelWatch, StartOutcome, WorkerSettings,
};
pub use events::{job_completed, job_started, JobEvent};
pub use export::{run_export_job, stream_export, StreamExportParams, StreamSummary};
pub use import::run_import_job;

use stevedore_db::{DbPool, EntityReader, ErrorJournal, JobQueue, JobStore};
use stevedore_protocol::{JobKind, TransferResult};
use stevedore_storage::LocalStorage;

/// Everything a worker process needs to run jobs.
pub struct WorkerContext {
    pub jobs: JobStore,
    pub queue: JobQueue,
    pub reader: EntityReader,
    pub journal: ErrorJournal,
    pub storage: LocalStorage,
    pub settings: WorkerSettings,
}

impl WorkerContext {
    pub fn new(pool: DbPool, storage: LocalStorage, settings: WorkerSettings) -> Self {
        Self {
            jobs: JobStore::new(pool.clone()),
            queue: JobQueue::new(pool.clone()),
            reader: EntityReader::new(pool.clone()),
            journal: ErrorJournal::new(pool),
            storage,
            settings,
        }
    }

    /// Drive one job end to end. Dispatches on the persisted kind; a job
    /// that another worker already claimed is returned as observed.
    pub async fn run_job(&self, job_id: &str) -> TransferResult<stevedore_db::JobRow> {
        let job = match start_job(&self.jobs, job_id).await? {
            StartOutcome::Observed(row) => return Ok(row),
            StartOutcome::Started(row) => row,
        };
        match job.kind {
            JobKind::Import => run_import_job(self, &job).await,
            JobKind::Export => run_export_job(self, &job).await,
        }
    }
}
