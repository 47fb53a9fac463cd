pub mod analyze;
pub mod clone;
pub mod detect;
pub mod report;
pub mod scan;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::Result;
use crate::model::JobStatus;

/// One phase of a job. Stages run strictly one after another; each owns a
/// fixed slice of the job's 0..=100 progress range.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(&self, ctx: &mut JobContext) -> Result<()>;
    fn name(&self) -> &'static str;
    /// The job status while this stage runs.
    fn status(&self) -> JobStatus;
    /// Inclusive start and end of the stage's progress band.
    fn band(&self) -> (u32, u32);
}

pub use analyze::AnalyzeStage;
pub use clone::CloneStage;
pub use detect::DetectStage;
pub use report::ReportStage;
pub use scan::ScanStage;

#[cfg(test)]
pub(crate) mod fixtures {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::cancel::StopSignal;
    use crate::context::{JobContext, JobReporter};
    use crate::detect::ComponentDetector;
    use crate::events::EventHub;
    use crate::llm::{Credential, LlmAdapter, LlmError, LlmProvider, Prompt};
    use crate::model::NewJob;
    use crate::store::{SqliteStore, Store};

    type Reply = dyn Fn(&Prompt) -> Result<String, LlmError> + Send + Sync;

    /// Answers every prompt with a fixed function and records the prompts.
    pub(crate) struct ScriptedProvider {
        reply: Arc<Reply>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProvider {
        pub fn replying(reply: impl Fn(&Prompt) -> Result<String, LlmError> + Send + Sync + 'static) -> Self {
            Self {
                reply: Arc::new(reply),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    struct ScriptedAdapter {
        reply: Arc<Reply>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl LlmAdapter for ScriptedAdapter {
        async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(prompt.user.clone());
            (self.reply)(prompt)
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn connect(&self, _credential: &Credential) -> Arc<dyn LlmAdapter> {
            Arc::new(ScriptedAdapter {
                reply: self.reply.clone(),
                calls: self.calls.clone(),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    pub(crate) fn write_file(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    /// A job with the given files checked out and its components recorded.
    pub(crate) async fn job_context(files: &[(&str, &str)]) -> (JobContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            write_file(dir.path(), rel, content);
        }
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let (job, _) = store
            .create_job(NewJob {
                name: "fixture".into(),
                repo_url: "https://example.com/fixture.git".into(),
                branch: "main".into(),
                model: "test-model".into(),
                config: serde_json::json!({}),
            })
            .await
            .unwrap();
        let reporter = Arc::new(JobReporter::new(store.clone(), Arc::new(EventHub::new(64)), &job));
        let detected = ComponentDetector::new(500, 50).detect(dir.path(), "fixture").unwrap();
        let components = store.insert_components(job.id, &detected).await.unwrap();

        let mut ctx = JobContext::new(
            job,
            vec![Credential::anonymous()],
            StopSignal::new(),
            reporter,
            store,
            dir.path().to_path_buf(),
        );
        ctx.components = components;
        (ctx, dir)
    }
}
