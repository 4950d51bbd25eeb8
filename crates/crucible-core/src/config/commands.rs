//! Remote command templates.
//!
//! Placeholders: `{job_id}`, `{dataset_uri}`, `{total_steps}`,
//! `{model_family}`, `{workdir}`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    pub workdir: String,
    pub stage_dataset: String,
    /// Must start the trainer in the background and return.
    pub launch: String,
    /// Prints recent trainer output containing a progress line.
    pub progress: String,
    /// Exit status 0 while the trainer process is alive.
    pub process_alive: String,
    pub kill: String,
    /// Uploads whatever the trainer produced and prints the artifact URI.
    pub collect_artifact: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            workdir: "/workspace/jobs".to_string(),
            stage_dataset: "mkdir -p {workdir}/{job_id}/data && curl -fsSL '{dataset_uri}' | tar -x -C {workdir}/{job_id}/data"
                .to_string(),
            launch: "cd {workdir}/{job_id} && nohup crucible-train --family {model_family} --steps {total_steps} --data data --out out > train.log 2>&1 & echo $! > {workdir}/{job_id}/train.pid"
                .to_string(),
            progress: "tail -c 8192 {workdir}/{job_id}/train.log".to_string(),
            process_alive: "kill -0 \"$(cat {workdir}/{job_id}/train.pid)\"".to_string(),
            kill: "kill -TERM \"$(cat {workdir}/{job_id}/train.pid)\"; sleep 5; kill -KILL \"$(cat {workdir}/{job_id}/train.pid)\" 2>/dev/null; true"
                .to_string(),
            collect_artifact: "upload-artifact {workdir}/{job_id}/out {job_id}".to_string(),
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub job_id: &'a str,
    pub dataset_uri: &'a str,
    pub total_steps: u64,
    pub model_family: &'a str,
}

impl CommandTemplates {
    pub fn render(&self, template: &str, ctx: &CommandContext<'_>) -> String {
        template
            .replace("{workdir}", &self.workdir)
            .replace("{job_id}", ctx.job_id)
            .replace("{dataset_uri}", ctx.dataset_uri)
            .replace("{total_steps}", &ctx.total_steps.to_string())
            .replace("{model_family}", ctx.model_family)
    }

    pub(crate) fn empty_templates(&self) -> Vec<&'static str> {
        [
            ("stage_dataset", &self.stage_dataset),
            ("launch", &self.launch),
            ("progress", &self.progress),
            ("process_alive", &self.process_alive),
            ("kill", &self.kill),
            ("collect_artifact", &self.collect_artifact),
        ]
        .into_iter()
        .filter(|(_, t)| t.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}
