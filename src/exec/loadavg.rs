// src/exec/loadavg.rs

//! System load average, used to throttle new build starts.

/// 1, 5 and 15 minute load averages, if the platform reports them.
#[cfg(unix)]
pub fn load_average() -> Option<[f64; 3]> {
    let mut loads = [0.0f64; 3];
    // SAFETY: the pointer is valid for three doubles, as the count says.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if n == 3 { Some(loads) } else { None }
}

#[cfg(not(unix))]
pub fn load_average() -> Option<[f64; 3]> {
    None
}
