use std::path::PathBuf;
use std::process::Command;

use anyhow::Context as _;
use clap::{Args, Parser};

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the kernel programs for bpfel-unknown-none.
    BuildEbpf(Options),
    /// Build the kernel programs, then the userspace agent.
    Build(Options),
    /// Build the kernel programs, then run every userspace test suite.
    Test(Options),
    /// Build everything and run the agent with sudo.
    Run {
        #[command(flatten)]
        options: Options,
        /// Extra arguments passed to the agent, e.g. `-- -i eth0 --telemetry ring`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Clone, Copy)]
struct Options {
    /// Build in release mode. The agent embeds the object of the same profile.
    #[arg(long)]
    release: bool,
}

impl Options {
    fn profile(self) -> &'static str {
        if self.release {
            "release"
        } else {
            "debug"
        }
    }

    fn apply(self, cmd: &mut Command) {
        if self.release {
            cmd.arg("--release");
        }
    }
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf(options) => build_ebpf(options),
        Cli::Build(options) => {
            build_ebpf(options)?;
            build_userspace(options)
        }
        Cli::Test(options) => {
            build_ebpf(options)?;
            test(options)
        }
        Cli::Run { options, args } => {
            build_ebpf(options)?;
            build_userspace(options)?;
            run(options, &args)
        }
    }
}

fn workspace_root() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/.."))
}

/// Runs `cmd` to completion, failing unless it exits cleanly.
fn exec(mut cmd: Command, what: &str) -> anyhow::Result<()> {
    let status = cmd
        .status()
        .with_context(|| format!("failed to spawn {what}"))?;
    anyhow::ensure!(status.success(), "{what} failed ({status})");
    Ok(())
}

fn build_ebpf(options: Options) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root().join("tcredir-ebpf"));
    cmd.args([
        "+nightly",
        "build",
        "--target",
        EBPF_TARGET,
        "-Z",
        "build-std=core",
    ]);
    options.apply(&mut cmd);
    exec(cmd, "eBPF build")
}

fn build_userspace(options: Options) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root());
    cmd.args(["build", "--workspace"]);
    options.apply(&mut cmd);
    exec(cmd, "workspace build")
}

fn test(options: Options) -> anyhow::Result<()> {
    // Shared crate first, without the userspace feature.
    let mut core = Command::new("cargo");
    core.current_dir(workspace_root());
    core.args(["test", "-p", "tcredir-common", "--no-default-features"]);
    options.apply(&mut core);
    exec(core, "tcredir-common tests")?;

    let mut workspace = Command::new("cargo");
    workspace.current_dir(workspace_root());
    workspace.args(["test", "--workspace"]);
    options.apply(&mut workspace);
    exec(workspace, "workspace tests")
}

fn run(options: Options, extra_args: &[String]) -> anyhow::Result<()> {
    let bin = workspace_root()
        .join("target")
        .join(options.profile())
        .join("tcredir");

    let mut cmd = Command::new("sudo");
    cmd.arg("-E").arg(&bin);
    cmd.args(extra_args);
    exec(cmd, "tcredir")
}
