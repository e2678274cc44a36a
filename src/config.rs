//! Process settings, fixed at startup.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use crate::{
    discovery::DEFAULT_SUFFIX,
    filter::{FilterPolicy, PolicyError},
    sink::{EventSink, FileSink, LogSink},
};

/// Watch every kubeconfig under a directory and record pod, network policy and deployment
/// changes of the clusters they point at.
#[derive(Debug, Clone, Parser)]
#[command(name = "kubeconfig-fanout", version, about)]
pub struct Settings {
    /// Directory tree to search for kubeconfigs.
    #[arg(long, env = "KUBECONFIG_FANOUT_ROOT")]
    pub root: PathBuf,

    /// Write events under `<DIR>/<context>/<kind>.log` instead of logging them.
    #[arg(long, value_name = "DIR", env = "KUBECONFIG_FANOUT_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// File name suffix identifying a kubeconfig.
    #[arg(long, default_value = DEFAULT_SUFFIX, env = "KUBECONFIG_FANOUT_SUFFIX")]
    pub suffix: String,

    /// TOML file overriding which events are kept.
    #[arg(long, value_name = "FILE", env = "KUBECONFIG_FANOUT_POLICY")]
    pub policy: Option<PathBuf>,
}

impl Settings {
    pub fn filter_policy(&self) -> Result<FilterPolicy, PolicyError> {
        match &self.policy {
            Some(path) => FilterPolicy::load(path),
            None => Ok(FilterPolicy::default()),
        }
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        match &self.output_dir {
            Some(dir) => Arc::new(FileSink::new(dir)),
            None => Arc::new(LogSink),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::try_parse_from(["kubeconfig-fanout", "--root", "/etc/clusters"])
            .unwrap();
        assert_eq!(settings.root, PathBuf::from("/etc/clusters"));
        assert_eq!(settings.suffix, "kubeconfig");
        assert!(settings.output_dir.is_none());
        assert_eq!(settings.filter_policy().unwrap(), FilterPolicy::default());
    }

    #[test]
    fn root_is_required() {
        assert!(Settings::try_parse_from(["kubeconfig-fanout"]).is_err());
    }

    #[test]
    fn policy_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "excluded_namespaces = [\"monitoring\"]").unwrap();

        let settings = Settings::try_parse_from([
            "kubeconfig-fanout",
            "--root",
            "/etc/clusters",
            "--output-dir",
            "/var/log/fanout",
            "--policy",
            path.to_str().unwrap(),
        ])
        .unwrap();
        let policy = settings.filter_policy().unwrap();
        assert!(policy.excluded_namespaces.contains("monitoring"));
        assert!(!policy.excluded_namespaces.contains("kube-system"));
    }
}
