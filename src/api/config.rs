//! Purpose: Harness settings shared by the CLI (`restmock run`) and by tests (`from_env`).
//! Exports: `HarnessArgs`, `Backend`, `BuildMode`, `HarnessConfig`.
//! Role: Resolves binaries and addresses from flags or `RESTMOCK_*` environment variables.
//! Invariants: Relative paths are resolved against `--root`, never the test's working dir.
#![allow(clippy::result_large_err)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};

use super::invoker::CommandLayout;
use crate::core::address::{AddressAllocator, prepare_namespace};
use crate::core::error::{Error, ErrorKind};

/// Which implementation of the CLI under test is driven.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Backend {
    /// The database binary's built-in tool talks to the mock directly.
    #[default]
    Native,
    /// A standalone CLI talks to a bridge process, which talks to the mock.
    Bridged,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum BuildMode {
    Debug,
    Release,
    #[default]
    Dev,
    Sanitize,
    Coverage,
}

impl BuildMode {
    /// Output directory name; multi-config (ninja) trees use CMake configuration names.
    pub fn build_subdir(self, multi_config: bool) -> &'static str {
        match (self, multi_config) {
            (BuildMode::Debug, true) => "Debug",
            (BuildMode::Release, true) => "RelWithDebInfo",
            (BuildMode::Dev, true) => "Dev",
            (BuildMode::Sanitize, true) => "Sanitize",
            (BuildMode::Coverage, true) => "Coverage",
            (BuildMode::Debug, false) => "debug",
            (BuildMode::Release, false) => "release",
            (BuildMode::Dev, false) => "dev",
            (BuildMode::Sanitize, false) => "sanitize",
            (BuildMode::Coverage, false) => "coverage",
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct HarnessArgs {
    #[arg(
        long,
        value_enum,
        default_value = "native",
        env = "RESTMOCK_BACKEND",
        help = "CLI implementation under test: native|bridged"
    )]
    pub backend: Backend,
    #[arg(
        long,
        value_enum,
        default_value = "dev",
        env = "RESTMOCK_MODE",
        help = "Build mode used to locate the native binary"
    )]
    pub mode: BuildMode,
    #[arg(
        long,
        default_value = ".",
        env = "RESTMOCK_ROOT",
        help = "Source tree root that default paths are relative to"
    )]
    pub root: PathBuf,
    #[arg(
        long,
        env = "RESTMOCK_BINARY",
        help = "Binary under test (default: derived from --backend and --mode)"
    )]
    pub binary: Option<PathBuf>,
    #[arg(
        long,
        default_value = "scylla",
        env = "RESTMOCK_BINARY_NAME",
        help = "File name of the native binary inside the build directory"
    )]
    pub binary_name: String,
    #[arg(
        long,
        env = "RESTMOCK_BRIDGE",
        help = "Bridge launcher (bridged backend only)"
    )]
    pub bridge: Option<PathBuf>,
    #[arg(
        long = "prefix-arg",
        default_values_t = ["nodetool".to_string()],
        allow_hyphen_values = true,
        value_delimiter = ',',
        env = "RESTMOCK_PREFIX_ARGS",
        help = "Argument(s) placed before the method (native backend)"
    )]
    pub prefix_args: Vec<String>,
    #[arg(
        long = "extra-arg",
        default_values_t = ["--logger-log-level".to_string(), "scylla-nodetool=trace".to_string()],
        allow_hyphen_values = true,
        value_delimiter = ',',
        env = "RESTMOCK_EXTRA_ARGS",
        help = "Argument(s) placed after the method (native backend)"
    )]
    pub extra_args: Vec<String>,
    #[arg(
        long,
        env = "RESTMOCK_RUN_WITHIN_UNSHARE",
        help = "Bring up `lo` and use a fixed address (inside `unshare -rn`)"
    )]
    pub run_within_unshare: bool,
    #[arg(
        long,
        default_value_t = 5_000,
        env = "RESTMOCK_STARTUP_TIMEOUT_MS",
        help = "Readiness timeout for mock and bridge, in milliseconds"
    )]
    pub startup_timeout_ms: u64,
    #[arg(
        long,
        default_value_t = 60_000,
        env = "RESTMOCK_COMMAND_TIMEOUT_MS",
        help = "Overall timeout for one command under test, in milliseconds"
    )]
    pub command_timeout_ms: u64,
    #[arg(
        long,
        default_value_t = 100,
        env = "RESTMOCK_POLL_INTERVAL_MS",
        help = "Readiness poll interval, in milliseconds"
    )]
    pub poll_interval_ms: u64,
}

#[derive(Parser)]
#[command(name = "restmock-harness", no_binary_name = true)]
struct HarnessCli {
    #[command(flatten)]
    args: HarnessArgs,
}

pub struct HarnessConfig;

impl HarnessConfig {
    /// Settings from `RESTMOCK_*` variables alone, for test suites without a CLI.
    pub fn from_env() -> Result<HarnessArgs, Error> {
        Self::from_args(std::iter::empty::<String>())
    }

    pub fn from_args<I, S>(args: I) -> Result<HarnessArgs, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString> + Clone,
    {
        HarnessCli::try_parse_from(args)
            .map(|cli| cli.args)
            .map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid harness settings: {}", err.kind()))
                    .with_detail(err.to_string())
            })
    }
}

impl HarnessArgs {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn rooted(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Binary to invoke for each step.
    pub fn binary_path(&self) -> PathBuf {
        if let Some(binary) = &self.binary {
            return self.rooted(binary);
        }
        match self.backend {
            Backend::Native => {
                let build = self.root.join("build");
                let multi_config = build.join("build.ninja").exists();
                build
                    .join(self.mode.build_subdir(multi_config))
                    .join(&self.binary_name)
            }
            Backend::Bridged => self.root.join("tools/java/bin/nodetool"),
        }
    }

    pub fn bridge_path(&self) -> PathBuf {
        match &self.bridge {
            Some(bridge) => self.rooted(bridge),
            None => self.root.join("tools/jmx/scripts/scylla-jmx"),
        }
    }

    /// Session allocator; inside a private namespace this brings `lo` up first.
    pub fn address_allocator(&self) -> Result<AddressAllocator, Error> {
        if self.run_within_unshare {
            prepare_namespace()?;
            return Ok(AddressAllocator::for_namespace());
        }
        Ok(AddressAllocator::new())
    }

    /// Layout for the native backend; the bridged layout comes from the running bridge.
    pub fn direct_layout(&self) -> CommandLayout {
        CommandLayout::Direct {
            prefix: self.prefix_args.clone(),
            extra: self.extra_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Backend, BuildMode, HarnessConfig};
    use crate::api::invoker::CommandLayout;
    use crate::core::error::ErrorKind;
    use std::path::PathBuf;

    #[test]
    fn defaults_target_native_dev_build() {
        let args = HarnessConfig::from_args(["--root", "/src/db"]).expect("parse");
        assert_eq!(args.backend, Backend::Native);
        assert_eq!(args.mode, BuildMode::Dev);
        assert_eq!(args.binary_path(), PathBuf::from("/src/db/build/dev/scylla"));
        assert_eq!(args.poll_interval().as_millis(), 100);
        match args.direct_layout() {
            CommandLayout::Direct { prefix, extra } => {
                assert_eq!(prefix, vec!["nodetool"]);
                assert_eq!(extra, vec!["--logger-log-level", "scylla-nodetool=trace"]);
            }
            other => panic!("unexpected layout {other:?}"),
        }
    }

    #[test]
    fn ninja_trees_use_configuration_names() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(root.path().join("build")).expect("mkdir");
        std::fs::write(root.path().join("build/build.ninja"), "").expect("write");
        let root_arg = root.path().to_string_lossy().to_string();
        let args = HarnessConfig::from_args(["--root", root_arg.as_str(), "--mode", "release"])
            .expect("parse");
        assert_eq!(
            args.binary_path(),
            root.path().join("build/RelWithDebInfo/scylla")
        );
    }

    #[test]
    fn explicit_paths_are_rooted() {
        let args = HarnessConfig::from_args([
            "--root",
            "/src/db",
            "--backend",
            "bridged",
            "--binary",
            "bin/nodetool",
            "--bridge",
            "/opt/jmx/scripts/jmx",
        ])
        .expect("parse");
        assert_eq!(args.binary_path(), PathBuf::from("/src/db/bin/nodetool"));
        assert_eq!(args.bridge_path(), PathBuf::from("/opt/jmx/scripts/jmx"));
    }

    #[test]
    fn bad_values_are_usage_errors() {
        let err = HarnessConfig::from_args(["--mode", "fastest"]).expect_err("bad mode");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn build_subdirs() {
        assert_eq!(BuildMode::Debug.build_subdir(true), "Debug");
        assert_eq!(BuildMode::Sanitize.build_subdir(false), "sanitize");
    }
}
