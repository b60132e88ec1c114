//! Kernel object loading and cgroup attachment.

use anyhow::{anyhow, Context, Result};
use aya::{
    maps::{MapData, RingBuf},
    programs::{CgroupAttachMode, CgroupSkb, CgroupSkbAttachType},
    Ebpf,
};
use std::fs::File;
use std::path::Path;

const RING_MAP: &str = "TRAFFIC_RING";

/// Programs in the kernel object and the hook each one attaches to.
const HOOKS: [(&str, CgroupSkbAttachType); 2] = [
    ("monitor_ingress", CgroupSkbAttachType::Ingress),
    ("monitor_egress", CgroupSkbAttachType::Egress),
];

/// Owns the loaded kernel object. Dropping it detaches both hooks.
pub struct Observer {
    bpf: Ebpf,
}

impl Observer {
    /// Load the compiled object from `path`.
    ///
    /// With `kernel_trace`, log lines emitted by a `trace` build of the kernel
    /// side are forwarded into the process logger.
    pub fn load(path: &Path, kernel_trace: bool) -> Result<Self> {
        check_privileges();

        tracing::info!("Loading eBPF object {}", path.display());
        let mut bpf = Ebpf::load_file(path)
            .with_context(|| format!("Failed to load eBPF object {}", path.display()))?;

        if kernel_trace {
            if let Err(e) = aya_log::EbpfLogger::init(&mut bpf) {
                tracing::warn!("Kernel trace unavailable (object built without `trace`?): {}", e);
            }
        }

        Ok(Self { bpf })
    }

    /// Load both programs and attach them to the cgroup v2 directory.
    pub fn attach(&mut self, cgroup_path: &Path) -> Result<()> {
        let cgroup = File::open(cgroup_path)
            .with_context(|| format!("Failed to open cgroup {}", cgroup_path.display()))?;

        for (name, attach_type) in HOOKS {
            let program: &mut CgroupSkb = self
                .bpf
                .program_mut(name)
                .ok_or_else(|| anyhow!("{} program not found in eBPF object", name))?
                .try_into()?;

            program
                .load()
                .with_context(|| format!("Failed to load {}", name))?;
            program
                .attach(&cgroup, attach_type, CgroupAttachMode::Single)
                .with_context(|| {
                    format!("Failed to attach {} to {}", name, cgroup_path.display())
                })?;
            tracing::info!("{} attached to {}", name, cgroup_path.display());
        }
        Ok(())
    }

    /// Take ownership of the ring buffer both hooks publish into.
    pub fn take_ring(&mut self) -> Result<RingBuf<MapData>> {
        let map = self
            .bpf
            .take_map(RING_MAP)
            .ok_or_else(|| anyhow!("{} map not found in eBPF object", RING_MAP))?;
        RingBuf::try_from(map).with_context(|| format!("Failed to open {} as a ring buffer", RING_MAP))
    }

    pub fn unload(self) {
        tracing::info!("Detaching eBPF programs...");
        drop(self.bpf);
    }
}

/// Loading and attaching need CAP_BPF and CAP_NET_ADMIN; the kernel has the
/// final say, so this only warns.
fn check_privileges() {
    // SAFETY: geteuid has no preconditions.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        tracing::warn!(
            "Not running as root (euid {}); loading may fail without CAP_BPF and CAP_NET_ADMIN",
            euid
        );
    }
}
