// src/dispatch/batch_system.rs

//! Batch system command builders.
//!
//! Each batch system knows how to submit a job script, recognise the job id
//! in the submission output, list which of a set of job ids are still
//! known to it, and kill a job. Commands are bash snippets run through a
//! [`RemoteRunner`](super::remote::RemoteRunner) on the selected host.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::dispatch::remote::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchSystemKind {
    /// Detached local process on the job host.
    #[default]
    Background,
    At,
    Slurm,
    Pbs,
}

impl FromStr for BatchSystemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(BatchSystemKind::Background),
            "at" => Ok(BatchSystemKind::At),
            "slurm" => Ok(BatchSystemKind::Slurm),
            "pbs" => Ok(BatchSystemKind::Pbs),
            other => Err(format!(
                "unknown job runner '{other}' (expected background, at, slurm or pbs)"
            )),
        }
    }
}

impl fmt::Display for BatchSystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchSystemKind::Background => "background",
            BatchSystemKind::At => "at",
            BatchSystemKind::Slurm => "slurm",
            BatchSystemKind::Pbs => "pbs",
        };
        f.write_str(s)
    }
}

fn at_job_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^job\s+(\d+)\s+at").expect("static regex"))
}

fn slurm_job_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Submitted batch job\s+(\d+)").expect("static regex"))
}

fn pbs_job_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+(?:\.[\w.-]+)?)\s*$").expect("static regex"))
}

fn pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*(\d+)\s*$").expect("static regex"))
}

fn format_walltime(limit: Duration) -> String {
    let secs = limit.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

impl BatchSystemKind {
    /// Header lines for the job script.
    pub fn directives(&self, job_name: &str, out: &str, err: &str, time_limit: Option<Duration>) -> Vec<String> {
        match self {
            BatchSystemKind::Background | BatchSystemKind::At => Vec::new(),
            BatchSystemKind::Slurm => {
                let mut d = vec![
                    format!("#SBATCH --job-name={job_name}"),
                    format!("#SBATCH --output={out}"),
                    format!("#SBATCH --error={err}"),
                ];
                if let Some(limit) = time_limit {
                    d.push(format!("#SBATCH --time={}", format_walltime(limit)));
                }
                d
            }
            BatchSystemKind::Pbs => {
                let mut d = vec![
                    format!("#PBS -N {job_name}"),
                    format!("#PBS -o {out}"),
                    format!("#PBS -e {err}"),
                ];
                if let Some(limit) = time_limit {
                    d.push(format!("#PBS -l walltime={}", format_walltime(limit)));
                }
                d
            }
        }
    }

    /// Snippet submitting the job script at `job_path`; prints the job id.
    pub fn submit_command(&self, job_path: &str) -> String {
        let job = shell_quote(job_path);
        match self {
            BatchSystemKind::Background => format!(
                "nohup bash {job} >{out} 2>{err} </dev/null & echo $!",
                out = shell_quote(&format!("{job_path}.out")),
                err = shell_quote(&format!("{job_path}.err")),
            ),
            BatchSystemKind::At => format!("at now -f {job} 2>&1"),
            BatchSystemKind::Slurm => format!("sbatch {job}"),
            BatchSystemKind::Pbs => format!("qsub {job}"),
        }
    }

    /// Job id from submission output.
    pub fn parse_job_id(&self, output: &str) -> Option<String> {
        let re = match self {
            BatchSystemKind::Background => pid_re(),
            BatchSystemKind::At => at_job_re(),
            BatchSystemKind::Slurm => slurm_job_re(),
            BatchSystemKind::Pbs => pbs_job_re(),
        };
        re.captures(output).map(|c| c[1].to_string())
    }

    /// Snippet listing those of `job_ids` still known to the batch system,
    /// one per line. Never fails just because a job is gone.
    pub fn poll_command(&self, job_ids: &[String]) -> String {
        let ids: Vec<String> = job_ids.iter().map(|id| shell_quote(id)).collect();
        let ids = ids.join(" ");
        match self {
            BatchSystemKind::Background => {
                format!("for p in {ids}; do if kill -0 \"$p\" 2>/dev/null; then echo \"$p\"; fi; done")
            }
            BatchSystemKind::At => "atq | awk '{print $1}'".to_string(),
            BatchSystemKind::Slurm => format!("squeue -h -o %i -j {} 2>/dev/null || true", job_ids.join(",")),
            BatchSystemKind::Pbs => format!("qstat {ids} 2>/dev/null | awk 'NR>2 {{print $1}}' || true"),
        }
    }

    /// Which of `job_ids` appear in poll output.
    pub fn parse_poll(&self, output: &str, job_ids: &[String]) -> BTreeSet<String> {
        let listed: BTreeSet<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        job_ids
            .iter()
            .filter(|id| {
                listed.contains(id.as_str())
                    || (*self == BatchSystemKind::Pbs
                        && listed.iter().any(|l| l.split('.').next() == id.split('.').next()))
            })
            .cloned()
            .collect()
    }

    pub fn kill_command(&self, job_id: &str) -> String {
        let id = shell_quote(job_id);
        match self {
            BatchSystemKind::Background => format!("kill -TERM {id}"),
            BatchSystemKind::At => format!("atrm {id}"),
            BatchSystemKind::Slurm => format!("scancel {id}"),
            BatchSystemKind::Pbs => format!("qdel {id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_ids() {
        assert_eq!(BatchSystemKind::Background.parse_job_id("4242\n").as_deref(), Some("4242"));
        assert_eq!(
            BatchSystemKind::At
                .parse_job_id("warning: commands will be executed using /bin/sh\njob 17 at Mon Jan  1 00:00:00 2024\n")
                .as_deref(),
            Some("17")
        );
        assert_eq!(
            BatchSystemKind::Slurm.parse_job_id("Submitted batch job 991\n").as_deref(),
            Some("991")
        );
        assert_eq!(
            BatchSystemKind::Pbs.parse_job_id("1234.pbs-server\n").as_deref(),
            Some("1234.pbs-server")
        );
        assert_eq!(BatchSystemKind::Slurm.parse_job_id("error"), None);
    }

    #[test]
    fn poll_output_filters_requested_ids() {
        let ids = vec!["1".to_string(), "2".to_string()];
        let alive = BatchSystemKind::Slurm.parse_poll("2\n7\n", &ids);
        assert_eq!(alive.into_iter().collect::<Vec<_>>(), vec!["2".to_string()]);

        let ids = vec!["55.server".to_string()];
        assert_eq!(BatchSystemKind::Pbs.parse_poll("55.ser\n", &ids).len(), 1);
    }

    #[test]
    fn directives_include_walltime() {
        let d = BatchSystemKind::Slurm.directives("foo.1", "o", "e", Some(Duration::from_secs(5400)));
        assert!(d.contains(&"#SBATCH --time=01:30:00".to_string()));
        assert!(BatchSystemKind::Background.directives("x", "o", "e", None).is_empty());
        assert!("lsf".parse::<BatchSystemKind>().is_err());
        assert_eq!("SLURM".parse::<BatchSystemKind>(), Ok(BatchSystemKind::Slurm));
    }
}
