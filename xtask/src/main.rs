use std::path::PathBuf;
use std::process::Command;

use anyhow::Context as _;
use clap::{Args, Parser};

#[derive(Parser)]
enum Cli {
    /// Build the eBPF object for bpfel-unknown-none.
    BuildEbpf(BuildOptions),
    /// Build everything: eBPF first, then the userspace agent.
    Build(BuildOptions),
    /// Build everything and run the agent with sudo.
    Run {
        #[command(flatten)]
        options: BuildOptions,
        /// Extra arguments passed to the binary.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Clone, Copy)]
struct BuildOptions {
    /// Build in release mode.
    #[arg(long)]
    release: bool,
    /// Compile kernel-side trace logging into the eBPF object.
    #[arg(long)]
    trace: bool,
}

impl BuildOptions {
    fn profile(self) -> &'static str {
        if self.release {
            "release"
        } else {
            "debug"
        }
    }
}

fn ebpf_dir() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../ionet-ebpf"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli {
        Cli::BuildEbpf(options) => build_ebpf(options),
        Cli::Build(options) => {
            build_ebpf(options)?;
            build_userspace(options)
        }
        Cli::Run { options, args } => {
            build_ebpf(options)?;
            build_userspace(options)?;
            run(options, &args)
        }
    }
}

fn build_ebpf(options: BuildOptions) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(ebpf_dir());
    cmd.args([
        "+nightly",
        "build",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ]);
    if options.release {
        cmd.arg("--release");
    }
    if options.trace {
        cmd.args(["--features", "trace"]);
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for eBPF")?;
    anyhow::ensure!(status.success(), "eBPF build failed");
    Ok(())
}

fn build_userspace(options: BuildOptions) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--package", "ionet"]);
    if options.release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for ionet")?;
    anyhow::ensure!(status.success(), "userspace build failed");
    Ok(())
}

fn run(options: BuildOptions, extra_args: &[String]) -> anyhow::Result<()> {
    let profile = options.profile();
    let bin = format!("target/{profile}/ionet");
    let object = ebpf_dir()
        .join("target/bpfel-unknown-none")
        .join(profile)
        .join("ionet");

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    cmd.arg("--ebpf-object").arg(&object);
    if options.trace {
        cmd.arg("--kernel-trace");
    }
    cmd.args(extra_args);
    let status = cmd.status().context("failed to run ionet")?;
    anyhow::ensure!(status.success(), "ionet exited with error");
    Ok(())
}
