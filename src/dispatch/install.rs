// src/dispatch/install.rs

//! Files installed on remote platforms during remote init.
//!
//! The set is collected once at startup from the workflow source directory:
//! every file matching one of the configured `install` globs. A `blake3`
//! fingerprint over paths and contents is written next to the installed
//! files so that a later run with the same set skips the copy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::Hasher;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::dispatch::remote::shell_quote;
use crate::fs::FileSystem;

/// Relative to the remote run directory.
pub const FINGERPRINT_FILE: &str = ".service/install.blake3";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallFile {
    /// Relative to the source directory, `/`-separated.
    pub rel_path: String,
    pub contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSet {
    files: Vec<InstallFile>,
    fingerprint: String,
}

impl Default for InstallSet {
    fn default() -> Self {
        Self::from_files(Vec::new())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).with_context(|| format!("invalid install pattern '{pattern}'"))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn walk(fs: &dyn FileSystem, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs.read_dir(dir)? {
        if fs.is_dir(&entry) {
            walk(fs, &entry, out)?;
        } else if fs.is_file(&entry) {
            out.push(entry);
        }
    }
    Ok(())
}

impl InstallSet {
    /// Collect every file under `source_dir` matching `patterns`.
    pub fn collect(fs: &dyn FileSystem, source_dir: &Path, patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let globs = build_globset(patterns)?;
        let mut paths = Vec::new();
        walk(fs, source_dir, &mut paths)?;

        let mut files = Vec::new();
        for path in paths {
            let Ok(rel) = path.strip_prefix(source_dir) else {
                continue;
            };
            let rel_path = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !globs.is_match(&rel_path) {
                continue;
            }
            let contents = fs.read_to_string(&path)?;
            debug!(file = %rel_path, "selected for remote install");
            files.push(InstallFile { rel_path, contents });
        }
        Ok(Self::from_files(files))
    }

    pub fn from_files(mut files: Vec<InstallFile>) -> Self {
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let mut hasher = Hasher::new();
        for f in &files {
            hasher.update(f.rel_path.as_bytes());
            hasher.update(&[0]);
            hasher.update(f.contents.as_bytes());
            hasher.update(&[0]);
        }
        let fingerprint = hasher.finalize().to_hex().to_string();
        Self { files, fingerprint }
    }

    pub fn files(&self) -> &[InstallFile] {
        &self.files
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Bash snippet creating the run directory layout and installing the
    /// files under `run_root`, unless the recorded fingerprint matches.
    /// Prints `[INSTALL] current` or `[INSTALL] done`.
    pub fn script(&self, run_root: &str) -> String {
        let root = run_root.trim_end_matches('/');
        let fp_path = shell_quote(&format!("{root}/{FINGERPRINT_FILE}"));
        let mut s = String::from("set -e\n");
        s.push_str(&format!(
            "mkdir -p {} {}\n",
            shell_quote(&format!("{root}/log/job")),
            shell_quote(&format!("{root}/.service"))
        ));
        s.push_str(&format!(
            "if [ \"$(cat {fp_path} 2>/dev/null)\" = {} ]; then echo '[INSTALL] current'; exit 0; fi\n",
            shell_quote(&self.fingerprint)
        ));
        for f in &self.files {
            let dest = format!("{root}/{}", f.rel_path);
            if let Some((dir, _)) = dest.rsplit_once('/') {
                s.push_str(&format!("mkdir -p {}\n", shell_quote(dir)));
            }
            s.push_str(&format!(
                "printf '%s' {} >{}\n",
                shell_quote(&f.contents),
                shell_quote(&dest)
            ));
        }
        s.push_str(&format!(
            "printf '%s\\n' {} >{fp_path}\n",
            shell_quote(&self.fingerprint)
        ));
        s.push_str("echo '[INSTALL] done'\n");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    #[test]
    fn collects_matching_files_only() {
        let fs = MockFileSystem::new();
        fs.add_file("/src/wf/bin/run-model", "#!/bin/sh\necho run\n");
        fs.add_file("/src/wf/bin/notes.txt", "ignore me");
        fs.add_file("/src/wf/lib/util.sh", "util() { :; }\n");
        fs.add_file("/src/wf/flow.toml", "[scheduling]");

        let patterns = vec!["bin/run-*".to_string(), "lib/**".to_string()];
        let set = InstallSet::collect(&fs, Path::new("/src/wf"), &patterns).unwrap();
        let names: Vec<&str> = set.files().iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(names, vec!["bin/run-model", "lib/util.sh"]);
    }

    #[test]
    fn fingerprint_depends_on_content() {
        let a = InstallSet::from_files(vec![InstallFile {
            rel_path: "bin/x".into(),
            contents: "one".into(),
        }]);
        let b = InstallSet::from_files(vec![InstallFile {
            rel_path: "bin/x".into(),
            contents: "two".into(),
        }]);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());

        let script = a.script("/remote/run/");
        assert!(script.contains("mkdir -p /remote/run/log/job /remote/run/.service\n"));
        assert!(script.contains("printf '%s' one >/remote/run/bin/x\n"));
        assert!(script.ends_with("echo '[INSTALL] done'\n"));
    }
}
