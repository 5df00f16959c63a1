//! Best-effort process and OS sampling taken at scope open and close.
//!
//! Everything here is optional: a probe that cannot be read on the
//! current platform is simply absent from the snapshot, never
//! zero-filled and never an error.

/// Environment variable holding the deployment identifier (the Heroku
/// dyno name). Surfaced verbatim as the `dyno` field when present.
pub const DYNO_ENV: &str = "DYNO";

/// Point-in-time resource observation for the calling thread/process.
#[derive(Debug, Clone, Default)]
pub struct ProbeSnapshot {
    pub pid: u32,
    /// 1-minute load average.
    pub loadavg: Option<f64>,
    /// Thread (Linux) or process (other unix) user CPU time, microseconds.
    pub user_us: Option<u64>,
    /// Thread (Linux) or process (other unix) system CPU time, microseconds.
    pub sys_us: Option<u64>,
    /// Max resident set size, in the kernel's native unit (KiB on Linux).
    pub max_rss: Option<i64>,
    pub dyno: Option<String>,
}

/// CPU and memory deltas between an open-time and a close-time snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProbeDeltas {
    pub user_ms: Option<u64>,
    pub sys_ms: Option<u64>,
    pub max_rss: Option<i64>,
    pub inc_max_rss: Option<i64>,
}

/// Capture a snapshot for the current thread.
pub fn capture() -> ProbeSnapshot {
    let rusage = read_rusage();
    ProbeSnapshot {
        pid: std::process::id(),
        loadavg: read_loadavg(),
        user_us: rusage.map(|r| r.0),
        sys_us: rusage.map(|r| r.1),
        max_rss: rusage.map(|r| r.2),
        dyno: std::env::var(DYNO_ENV).ok(),
    }
}

/// Compute close-time deltas against the open-time snapshot.
///
/// Wall-clock or counter weirdness must never yield negative CPU
/// deltas, so subtraction saturates at zero.
pub fn deltas_since(open: &ProbeSnapshot) -> ProbeDeltas {
    let close = capture();
    ProbeDeltas {
        user_ms: match (close.user_us, open.user_us) {
            (Some(end), Some(start)) => Some(end.saturating_sub(start) / 1000),
            _ => None,
        },
        sys_ms: match (close.sys_us, open.sys_us) {
            (Some(end), Some(start)) => Some(end.saturating_sub(start) / 1000),
            _ => None,
        },
        max_rss: close.max_rss,
        inc_max_rss: match (close.max_rss, open.max_rss) {
            (Some(end), Some(start)) => Some(end - start),
            _ => None,
        },
    }
}

#[cfg(unix)]
fn read_loadavg() -> Option<f64> {
    let mut values = [0f64; 3];
    // SAFETY: getloadavg writes at most `nelem` doubles into the array.
    let n = unsafe { libc::getloadavg(values.as_mut_ptr(), 1) };
    if n >= 1 {
        Some(values[0])
    } else {
        None
    }
}

#[cfg(not(unix))]
fn read_loadavg() -> Option<f64> {
    None
}

/// (user_us, sys_us, max_rss) for the current thread where the platform
/// supports per-thread accounting, otherwise for the whole process.
#[cfg(unix)]
fn read_rusage() -> Option<(u64, u64, i64)> {
    #[cfg(target_os = "linux")]
    let who = libc::RUSAGE_THREAD;
    #[cfg(not(target_os = "linux"))]
    let who = libc::RUSAGE_SELF;

    // SAFETY: getrusage fills the struct when it returns 0.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(who, &mut usage) };
    if rc != 0 {
        return None;
    }
    let tv_us = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
    Some((
        tv_us(usage.ru_utime),
        tv_us(usage.ru_stime),
        usage.ru_maxrss as i64,
    ))
}

#[cfg(not(unix))]
fn read_rusage() -> Option<(u64, u64, i64)> {
    None
}
