use crate::error::RunnerResult;
use crate::job::JobId;
use std::path::{Path, PathBuf};

/// Filesystem layout for per-job working files.
///
/// Layout is `<work_dir>/jobs/<job_id>/{checkpoints,output}`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(work_dir: &Path) -> Self {
        Self { root: work_dir.join("jobs") }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn job_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join(job_id.as_str())
    }

    #[must_use]
    pub fn checkpoints_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("checkpoints")
    }

    #[must_use]
    pub fn checkpoint_path(&self, job_id: &JobId, step: u64) -> PathBuf {
        self.checkpoints_dir(job_id).join(format!("step-{step:06}.ckpt"))
    }

    #[must_use]
    pub fn output_dir(&self, job_id: &JobId) -> PathBuf {
        self.job_dir(job_id).join("output")
    }

    pub fn ensure_job_dirs(&self, job_id: &JobId) -> RunnerResult<()> {
        std::fs::create_dir_all(self.checkpoints_dir(job_id))?;
        std::fs::create_dir_all(self.output_dir(job_id))?;
        Ok(())
    }
}
