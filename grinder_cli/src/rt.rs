//! Real-time scheduling for the control loop (Linux SCHED_FIFO + mlockall).

use crate::cli::RtLock;

#[cfg(all(feature = "rt", target_os = "linux"))]
pub fn setup_rt_once(prio: Option<i32>, lock: RtLock) {
    use libc::{
        MCL_CURRENT, MCL_FUTURE, SCHED_FIFO, mlockall, sched_get_priority_max,
        sched_get_priority_min, sched_param, sched_setscheduler,
    };
    use std::sync::OnceLock;
    static RT_ONCE: OnceLock<()> = OnceLock::new();

    fn mlock(flags: libc::c_int) -> std::io::Result<()> {
        // SAFETY: mlockall takes only flags and touches no Rust-owned memory.
        let rc = unsafe { mlockall(flags) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn apply_mem_lock(lock: RtLock) -> eyre::Result<()> {
        let result = match lock {
            RtLock::None => return Ok(()),
            RtLock::Current => mlock(MCL_CURRENT),
            RtLock::All => mlock(MCL_CURRENT | MCL_FUTURE).or_else(|e| {
                // future pages may exceed the memlock limit; current alone often fits
                if matches!(e.raw_os_error(), Some(code) if code == libc::EPERM || code == libc::ENOMEM)
                {
                    mlock(MCL_CURRENT)
                } else {
                    Err(e)
                }
            }),
        };
        result.map_err(|e| {
            eyre::eyre!("mlockall failed: {e}; needs CAP_IPC_LOCK (or root) and enough 'ulimit -l'")
        })
    }

    fn apply_fifo(prio: Option<i32>) -> eyre::Result<i32> {
        // SAFETY: plain queries of the scheduler's priority range.
        let (min, max) = unsafe {
            (
                sched_get_priority_min(SCHED_FIFO),
                sched_get_priority_max(SCHED_FIFO),
            )
        };
        let (min, max) = if min < 0 || max < 0 { (1, 99) } else { (min, max) };
        let prio = prio.unwrap_or(max).clamp(min, max);
        let param = sched_param {
            sched_priority: prio,
        };
        // SAFETY: `param` outlives the call; pid 0 is the calling process.
        let rc = unsafe { sched_setscheduler(0, SCHED_FIFO, &param) };
        if rc != 0 {
            return Err(eyre::eyre!(
                "sched_setscheduler(SCHED_FIFO, {prio}) failed: {}; needs CAP_SYS_NICE or root",
                std::io::Error::last_os_error()
            ));
        }
        Ok(prio)
    }

    RT_ONCE.get_or_init(|| {
        match apply_mem_lock(lock) {
            Ok(()) => tracing::info!(?lock, "rt memory lock applied"),
            Err(e) => tracing::warn!(error = %e, "rt memory lock not applied"),
        }
        match apply_fifo(prio) {
            Ok(prio) => tracing::info!(prio, "rt SCHED_FIFO enabled"),
            Err(e) => tracing::warn!(error = %e, "rt priority not applied"),
        }
    });
}

#[cfg(not(all(feature = "rt", target_os = "linux")))]
pub fn setup_rt_once(_prio: Option<i32>, _lock: RtLock) {
    tracing::warn!("--rt needs a Linux build with the `rt` feature; running without it");
}
