// Launch options for a forked worker process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Options controlling how a worker process is launched: which executable,
/// extra arguments, environment, and working directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkOptions {
    /// Worker executable; `None` means locate the default worker binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,

    /// Extra arguments appended after the channel arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables set on the worker.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl ForkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Copy these options into `target`. Set values overwrite, arguments are
    /// appended, environment entries are merged with ours winning.
    pub fn copy_to(&self, target: &mut ForkOptions) {
        if let Some(ref exe) = self.executable {
            target.executable = Some(exe.clone());
        }
        target.args.extend(self.args.iter().cloned());
        for (k, v) in &self.environment {
            target.environment.insert(k.clone(), v.clone());
        }
        if let Some(ref dir) = self.working_dir {
            target.working_dir = Some(dir.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_to_merges_into_target() {
        let mut target = ForkOptions::new();
        target.arg("--base").env("A", "target").env("B", "kept");
        target.working_dir = Some(PathBuf::from("/target"));

        let mut source = ForkOptions::new();
        source.arg("--extra").env("A", "source");
        source.executable = Some(PathBuf::from("/opt/worker"));

        source.copy_to(&mut target);
        assert_eq!(target.args, vec!["--base", "--extra"]);
        assert_eq!(target.environment["A"], "source");
        assert_eq!(target.environment["B"], "kept");
        assert_eq!(target.executable, Some(PathBuf::from("/opt/worker")));
        assert_eq!(target.working_dir, Some(PathBuf::from("/target")));
    }

    #[test]
    fn deserializes_with_defaults() {
        let opts: ForkOptions = serde_json::from_str(r#"{"args":["-v"]}"#).unwrap();
        assert_eq!(opts.args, vec!["-v"]);
        assert!(opts.environment.is_empty());
        assert!(opts.executable.is_none());
    }
}
