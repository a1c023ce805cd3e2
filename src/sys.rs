/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Thin wrappers over the OS facilities the CMA channel relies on.

use std::fs;
use std::io::IoSliceMut;

use anyhow::Context as _;
use nix::errno::Errno;
use nix::sys::uio::process_vm_readv;
use nix::sys::uio::RemoteIoVec;
use nix::unistd::Pid;

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// The kernel's boot identifier: stable while the host stays up, distinct
/// across boots and across machines/VMs.
pub(crate) fn boot_id() -> anyhow::Result<String> {
    let raw = fs::read_to_string(BOOT_ID_PATH)
        .with_context(|| format!("unable to read boot id from {}", BOOT_ID_PATH))?;
    Ok(raw.trim().to_string())
}

/// Read `len` bytes from `remote_addr` in `pid`'s address space into
/// `local_addr` in ours. Returns the number of bytes transferred, which the
/// kernel may leave short of `len` without reporting an error.
///
/// A zero-length request still enters the kernel, so invalid pids fail the
/// same way they would for a non-empty request.
///
/// # Safety
///
/// `local_addr..local_addr + len` must be a writable allocation owned by the
/// caller for the duration of the call. The remote range needs no local
/// validity; the kernel reports `EFAULT` if it is not readable in `pid`.
pub(crate) unsafe fn copy_from_process(
    pid: Pid,
    remote_addr: usize,
    local_addr: usize,
    len: usize,
) -> Result<usize, Errno> {
    // SAFETY: writability and lifetime of the local range are guaranteed by
    // the caller per this function's contract.
    let local = unsafe { std::slice::from_raw_parts_mut(local_addr as *mut u8, len) };
    let mut local_iov = [IoSliceMut::new(local)];
    let remote_iov = [RemoteIoVec {
        base: remote_addr,
        len,
    }];
    process_vm_readv(pid, &mut local_iov, &remote_iov)
}

#[cfg(test)]
mod tests {
    use nix::unistd::getpid;

    use super::*;

    #[test]
    fn test_boot_id_is_nonempty_and_stable() {
        let first = boot_id().unwrap();
        assert!(!first.is_empty());
        assert!(!first.contains('\n'));
        assert_eq!(first, boot_id().unwrap());
    }

    #[test]
    fn test_copy_from_own_process() {
        let src: Vec<u8> = (0..64u8).collect();
        let mut dst = vec![0u8; 64];

        // SAFETY: dst is a live writable allocation for the duration of the
        // call.
        let nread = unsafe {
            copy_from_process(getpid(), src.as_ptr() as usize, dst.as_mut_ptr() as usize, 64)
        }
        .unwrap();

        assert_eq!(nread, 64);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_from_unreadable_address_faults() {
        let mut dst = vec![0u8; 8];

        // Page zero is never mapped.
        // SAFETY: dst is a live writable allocation.
        let err = unsafe {
            copy_from_process(getpid(), 8, dst.as_mut_ptr() as usize, 8)
        }
        .unwrap_err();

        assert_eq!(err, Errno::EFAULT);
    }

    #[test]
    fn test_copy_from_missing_process() {
        let mut dst = vec![0u8; 8];
        let src = [0u8; 8];

        // Far above any real pid_max.
        // SAFETY: dst is a live writable allocation.
        let err = unsafe {
            copy_from_process(
                Pid::from_raw(i32::MAX),
                src.as_ptr() as usize,
                dst.as_mut_ptr() as usize,
                8,
            )
        }
        .unwrap_err();

        assert_eq!(err, Errno::ESRCH);
    }
}
