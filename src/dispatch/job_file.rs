// src/dispatch/job_file.rs

//! Job script and job log layout.
//!
//! Every submission gets its own directory:
//!
//! ```text
//! <run_dir>/log/job/<point>/<name>/<NN>/
//!     job          the bash script submitted to the batch system
//!     job.status   KEY=VALUE lines written by the running job
//!     job.out      stdout
//!     job.err      stderr
//! ```
//!
//! Jobs on push platforms also append each message to an inbox file under
//! `<run_dir>/.service/messages/`, which the scheduler watches.

use std::path::{Path, PathBuf};

use crate::cycling::CyclePoint;
use crate::dispatch::batch_system::BatchSystemKind;
use crate::dispatch::job::{JobKey, JobSpec};
use crate::dispatch::remote::shell_quote;
use crate::task::TaskId;
use crate::types::CyclingMode;

pub const STATUS_INIT_TIME: &str = "JOB_INIT_TIME";
pub const STATUS_EXIT: &str = "JOB_EXIT";
pub const STATUS_EXIT_TIME: &str = "JOB_EXIT_TIME";
pub const STATUS_MESSAGE: &str = "JOB_MESSAGE";
pub const STATUS_JOB_ID: &str = "JOB_RUNNER_JOB_ID";

/// Exit value written for a successful job.
pub const EXIT_SUCCEEDED: &str = "SUCCEEDED";

const INBOX_DIR: &str = ".service/messages";
const INBOX_SEP: &str = "__";
const INBOX_EXT: &str = "msg";
const HEREDOC_MARK: &str = "__CYCLORAMA_JOB_EOF__";

/// Locations of one job's files below a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub dir: String,
    pub job: String,
    pub status: String,
    pub out: String,
    pub err: String,
}

impl JobPaths {
    /// `run_root` is a path on the job host, hence a plain string.
    pub fn new(run_root: &str, key: &JobKey) -> Self {
        let dir = format!(
            "{}/log/job/{}/{}/{}",
            run_root.trim_end_matches('/'),
            key.task.point,
            key.task.name,
            key.job_dir_name()
        );
        Self {
            job: format!("{dir}/job"),
            status: format!("{dir}/job.status"),
            out: format!("{dir}/job.out"),
            err: format!("{dir}/job.err"),
            dir,
        }
    }
}

pub fn inbox_dir(run_dir: &Path) -> PathBuf {
    run_dir.join(INBOX_DIR)
}

pub fn inbox_file_name(key: &JobKey) -> String {
    format!(
        "{}{INBOX_SEP}{}{INBOX_SEP}{}.{INBOX_EXT}",
        key.task.point,
        key.task.name,
        key.job_dir_name()
    )
}

/// Recover the job from an inbox file name.
pub fn parse_inbox_file_name(file_name: &str, mode: CyclingMode) -> Option<JobKey> {
    let stem = file_name.strip_suffix(&format!(".{INBOX_EXT}"))?;
    let (point, rest) = stem.split_once(INBOX_SEP)?;
    let (name, num) = rest.rsplit_once(INBOX_SEP)?;
    let point = CyclePoint::parse(point, mode).ok()?;
    let submit_num = num.parse().ok()?;
    Some(JobKey::new(TaskId::new(name, point), submit_num))
}

/// Inputs for rendering a job script.
#[derive(Debug, Clone)]
pub struct JobScript<'a> {
    pub spec: &'a JobSpec,
    pub paths: &'a JobPaths,
    pub batch_system: BatchSystemKind,
    pub platform: &'a str,
    /// Run directory on the job host.
    pub run_root: &'a str,
    /// Inbox file for push communication, `None` for polled platforms.
    pub inbox: Option<&'a str>,
}

impl JobScript<'_> {
    pub fn render(&self) -> String {
        let spec = self.spec;
        let key = &spec.key;
        let mut s = String::from("#!/usr/bin/env bash\n");
        let job_name = format!("{}.{}", key.task.name, key.task.point);
        for d in self
            .batch_system
            .directives(&job_name, &self.paths.out, &self.paths.err, spec.execution_time_limit())
        {
            s.push_str(&d);
            s.push('\n');
        }
        s.push_str(&format!("# job {key} on platform {}\n\n", self.platform));

        let vars = [
            ("CYCLORAMA_TASK_NAME", key.task.name.clone()),
            ("CYCLORAMA_TASK_CYCLE_POINT", key.task.point.to_string()),
            ("CYCLORAMA_TASK_SUBMIT_NUMBER", key.submit_num.to_string()),
            ("CYCLORAMA_TASK_TRY_NUMBER", spec.try_num.to_string()),
            ("CYCLORAMA_TASK_JOB", key.to_string()),
            ("CYCLORAMA_TASK_PLATFORM", self.platform.to_string()),
            ("CYCLORAMA_WORKFLOW_RUN_DIR", self.run_root.to_string()),
        ];
        for (k, v) in vars {
            s.push_str(&format!("export {k}={}\n", shell_quote(&v)));
        }
        for (k, v) in &spec.runtime.environment {
            s.push_str(&format!("export {k}={}\n", shell_quote(v)));
        }
        s.push_str(&format!("STATUS_FILE={}\n", shell_quote(&self.paths.status)));
        s.push_str(&format!("INBOX={}\n", shell_quote(self.inbox.unwrap_or(""))));

        s.push_str(
            r#"
cyclorama_message() {
    local line
    line="$(date -u +%Y-%m-%dT%H:%M:%SZ)|$1|$2"
    echo "JOB_MESSAGE=${line}" >>"${STATUS_FILE}"
    if [[ -n "${INBOX}" ]]; then
        mkdir -p "$(dirname "${INBOX}")"
        echo "${line}" >>"${INBOX}"
    fi
}

cyclorama_finish() {
    echo "JOB_EXIT=$1" >>"${STATUS_FILE}"
    echo "JOB_EXIT_TIME=$(date -u +%Y-%m-%dT%H:%M:%SZ)" >>"${STATUS_FILE}"
    if [[ "$1" == "SUCCEEDED" ]]; then
        cyclorama_message INFO succeeded
    else
        cyclorama_message CRITICAL "failed/$1"
    fi
}

mkdir -p "$(dirname "${STATUS_FILE}")"
echo "JOB_INIT_TIME=$(date -u +%Y-%m-%dT%H:%M:%SZ)" >>"${STATUS_FILE}"
cyclorama_message INFO started

(
    set -eo pipefail
"#,
        );
        for part in [&spec.runtime.pre_script, &spec.runtime.script, &spec.runtime.post_script]
            .into_iter()
            .flatten()
        {
            for line in part.lines() {
                s.push_str("    ");
                s.push_str(line);
                s.push('\n');
            }
        }
        s.push_str(
            r#"    :
) &
child=$!
trap 'kill -TERM "${child}" 2>/dev/null; cyclorama_finish TERM; exit 143' TERM INT
wait "${child}"
rc=$?
if [[ ${rc} -eq 0 ]]; then
    cyclorama_finish SUCCEEDED
else
    cyclorama_finish "EXIT:${rc}"
fi
exit ${rc}
"#,
        );
        s
    }

    /// Bash snippet that writes the job script into place, then submits it.
    pub fn install_and_submit(&self) -> String {
        let rendered = self.render();
        format!(
            "mkdir -p {dir} && cat >{job} <<'{HEREDOC_MARK}'\n{rendered}{HEREDOC_MARK}\nchmod +x {job} && rm -f {status} && {submit}",
            dir = shell_quote(&self.paths.dir),
            job = shell_quote(&self.paths.job),
            status = shell_quote(&self.paths.status),
            submit = self.batch_system.submit_command(&self.paths.job),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::definition::TaskRuntime;
    use crate::platform::model::PlatformSpec;

    fn spec() -> JobSpec {
        let mut runtime = TaskRuntime {
            script: Some("echo hello\nrun-model --fast".into()),
            ..Default::default()
        };
        runtime.environment.insert("MODEL_RES".into(), "n 320".into());
        JobSpec {
            key: JobKey::new(TaskId::new("model", CyclePoint::Integer(4)), 3),
            platform: PlatformSpec::Local,
            resolved_platform: None,
            runtime,
            try_num: 2,
        }
    }

    #[test]
    fn layout_and_inbox_names() {
        let key = spec().key;
        let paths = JobPaths::new("/runs/wf/", &key);
        assert_eq!(paths.job, "/runs/wf/log/job/4/model/03/job");
        assert_eq!(paths.status, "/runs/wf/log/job/4/model/03/job.status");

        let name = inbox_file_name(&key);
        assert_eq!(name, "4__model__03.msg");
        assert_eq!(parse_inbox_file_name(&name, CyclingMode::Integer), Some(key));
        assert_eq!(parse_inbox_file_name("junk", CyclingMode::Integer), None);
    }

    #[test]
    fn script_exports_environment_and_body() {
        let spec = spec();
        let paths = JobPaths::new("/runs/wf", &spec.key);
        let script = JobScript {
            spec: &spec,
            paths: &paths,
            batch_system: BatchSystemKind::Slurm,
            platform: "hpc",
            run_root: "/runs/wf",
            inbox: None,
        };
        let text = script.render();
        assert!(text.starts_with("#!/usr/bin/env bash\n#SBATCH --job-name=model.4\n"));
        assert!(text.contains("export MODEL_RES='n 320'\n"));
        assert!(text.contains("export CYCLORAMA_TASK_TRY_NUMBER=2\n"));
        assert!(text.contains("    run-model --fast\n"));

        let submit = script.install_and_submit();
        assert!(submit.ends_with("sbatch /runs/wf/log/job/4/model/03/job"));
    }
}
