//! Device topology resolution.
//!
//! Expands the caller's device-selector bitmask into a concrete ordered
//! device list and wires up all-pairs peer access among the survivors.

use crate::backend::{Backend, PeerStatus};
use crate::error::Result;

/// Resolve a device bitmask (0 = all present devices) into an ordered list
/// of usable devices, enabling peer access among them.
///
/// A device that fails its activation probe is dropped from the selection
/// and the run continues. If `resident` names a device outside the
/// selection, it participates in peer setup (so its memory can be reached
/// directly) but is removed from the returned list. An empty result is the
/// caller's signal to fail with a no-such-device error.
pub fn resolve_devices<B: Backend>(
    backend: &B,
    mask: u32,
    resident: Option<usize>,
) -> Result<Vec<usize>> {
    let mut mask = mask;
    if mask == 0 {
        let present = backend.device_count()?;
        if present == 0 {
            return Ok(Vec::new());
        }
        mask = ((1u64 << present) - 1) as u32;
    }

    let mut devs = Vec::new();
    let mut dev = 0usize;
    let mut bits = mask;
    while bits != 0 {
        if bits & 1 != 0 {
            devs.push(dev);
            if backend.make_current(dev).is_err() {
                log::warn!("failed to validate device {dev}, dropping it");
                devs.pop();
            }
        }
        bits >>= 1;
        dev += 1;
    }

    // A resident device outside the selection still needs peer wiring so its
    // memory can be used as a borrowed source; it is removed again below.
    let extra_resident = match resident {
        Some(r) if !devs.contains(&r) => {
            devs.push(r);
            true
        }
        _ => false,
    };

    if devs.len() > 1 {
        for &dev1 in &devs {
            for &dev2 in &devs {
                if dev1 <= dev2 {
                    continue;
                }
                match backend.can_access_peer(dev1, dev2) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::warn!("peer access {dev1} <-> {dev2} is impossible");
                    }
                    Err(e) => {
                        log::warn!("peer access probe {dev1} <-> {dev2} failed: {e}");
                    }
                }
            }
        }
        for &dev in &devs {
            if backend.make_current(dev).is_err() {
                continue;
            }
            for &other in &devs {
                if dev == other {
                    continue;
                }
                match backend.enable_peer_access(dev, other) {
                    Ok(PeerStatus::AlreadyEnabled) => {
                        log::info!("peer access is already enabled on device {dev}");
                    }
                    Ok(PeerStatus::Enabled) => {}
                    Err(e) => {
                        log::warn!("failed to enable peer access on device {dev}: {e}");
                    }
                }
            }
        }
    }

    if extra_resident {
        devs.pop();
    }
    Ok(devs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;

    #[test]
    fn test_zero_mask_selects_all_devices() {
        let backend = HostBackend::new(3);
        let devs = resolve_devices(&backend, 0, None).unwrap();
        assert_eq!(devs, vec![0, 1, 2]);
    }

    #[test]
    fn test_zero_mask_with_no_devices_is_empty() {
        let backend = HostBackend::new(0);
        let devs = resolve_devices(&backend, 0, None).unwrap();
        assert!(devs.is_empty());
    }

    #[test]
    fn test_mask_selects_bit_positions() {
        let backend = HostBackend::new(4);
        let devs = resolve_devices(&backend, 0b1010, None).unwrap();
        assert_eq!(devs, vec![1, 3]);
    }

    #[test]
    fn test_unusable_device_is_dropped() {
        let backend = HostBackend::new(3).mark_unusable(1);
        let devs = resolve_devices(&backend, 0b111, None).unwrap();
        assert_eq!(devs, vec![0, 2]);
    }

    #[test]
    fn test_resident_device_is_not_returned() {
        let backend = HostBackend::new(4);
        let devs = resolve_devices(&backend, 0b0011, Some(3)).unwrap();
        assert_eq!(devs, vec![0, 1]);
    }

    #[test]
    fn test_peerless_topology_still_resolves() {
        let backend = HostBackend::new(2).deny_peer_access();
        let devs = resolve_devices(&backend, 0b11, None).unwrap();
        assert_eq!(devs, vec![0, 1]);
    }
}
