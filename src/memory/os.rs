//! Host operating system virtual-memory primitives.
//!
//! Four primitives back the allocators: [`reserve`] an address range without
//! physical backing, [`commit`] pages inside it, [`decommit`] them again while
//! keeping the reservation, and [`release`] the whole range.
//!
//! On Unix a reservation is an anonymous `PROT_NONE` mapping; committing
//! flips protection to read/write and decommitting maps fresh `PROT_NONE`
//! pages over the range so the kernel drops the old ones. On Windows these
//! map directly onto `VirtualAlloc` / `VirtualFree`.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// CPU architecture of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArchitecture {
    X64,
    Arm64,
    Unsupported,
}

impl CpuArchitecture {
    fn current() -> Self {
        if cfg!(target_arch = "x86_64") {
            CpuArchitecture::X64
        } else if cfg!(target_arch = "aarch64") {
            CpuArchitecture::Arm64
        } else {
            CpuArchitecture::Unsupported
        }
    }
}

/// Static facts about the host used to size reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    /// Granularity of commit and decommit.
    pub page_size: usize,
    /// Alignment of every reservation base address.
    pub allocation_granularity: usize,
    pub logical_cpu_count: usize,
    pub cpu_architecture: CpuArchitecture,
}

impl SystemInfo {
    #[cfg(unix)]
    fn query() -> Self {
        // SAFETY: sysconf has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size < 1 { 4096 } else { page_size as usize };

        Self {
            page_size,
            allocation_granularity: page_size,
            logical_cpu_count: num_cpus::get(),
            cpu_architecture: CpuArchitecture::current(),
        }
    }

    #[cfg(windows)]
    fn query() -> Self {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

        // SAFETY: SYSTEM_INFO is plain data and GetSystemInfo fills it in.
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };

        Self {
            page_size: info.dwPageSize as usize,
            allocation_granularity: info.dwAllocationGranularity as usize,
            logical_cpu_count: info.dwNumberOfProcessors as usize,
            cpu_architecture: CpuArchitecture::current(),
        }
    }
}

/// Returns the host description, queried once per process.
pub fn system_info() -> &'static SystemInfo {
    static INFO: OnceLock<SystemInfo> = OnceLock::new();
    INFO.get_or_init(SystemInfo::query)
}

/// Reserves `size` bytes of address space with no physical backing.
#[cfg(unix)]
pub fn reserve(size: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: a fresh anonymous mapping at a kernel-chosen address.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            reserve_flags(),
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    NonNull::new(ptr.cast::<u8>())
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "null from mmap"))
}

#[cfg(unix)]
fn reserve_flags() -> libc::c_int {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = flags | libc::MAP_NORESERVE;

    flags
}

/// Makes `[ptr, ptr + size)` readable and writable.
///
/// # Safety
///
/// The range must be page aligned and lie inside a reservation obtained from
/// [`reserve`].
#[cfg(unix)]
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }

    let rc = libc::mprotect(
        ptr.as_ptr().cast(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    );
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Drops the physical pages of `[ptr, ptr + size)`, keeping the reservation.
///
/// # Safety
///
/// Same as [`commit`]. Any data in the range is lost.
#[cfg(unix)]
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }

    let mapped = libc::mmap(
        ptr.as_ptr().cast(),
        size,
        libc::PROT_NONE,
        reserve_flags() | libc::MAP_FIXED,
        -1,
        0,
    );
    if mapped == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Returns the whole reservation starting at `ptr` to the OS.
///
/// # Safety
///
/// `ptr` must be the base of a reservation of exactly `size` bytes that is no
/// longer referenced.
#[cfg(unix)]
pub unsafe fn release(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    if libc::munmap(ptr.as_ptr().cast(), size) != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub fn reserve(size: usize) -> io::Result<NonNull<u8>> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_READWRITE};

    // SAFETY: a fresh reservation at a system-chosen address.
    let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_READWRITE) };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
}

/// # Safety
///
/// The range must lie inside a reservation obtained from [`reserve`].
#[cfg(windows)]
pub unsafe fn commit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};

    if size == 0 {
        return Ok(());
    }

    let committed = VirtualAlloc(
        ptr.as_ptr().cast::<std::ffi::c_void>(),
        size,
        MEM_COMMIT,
        PAGE_READWRITE,
    );
    if committed.is_null() {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// # Safety
///
/// Same as [`commit`]. Any data in the range is lost.
#[cfg(windows)]
pub unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_DECOMMIT};

    if size == 0 {
        return Ok(());
    }

    if VirtualFree(ptr.as_ptr().cast(), size, MEM_DECOMMIT) == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// # Safety
///
/// `ptr` must be the base of a reservation that is no longer referenced.
#[cfg(windows)]
pub unsafe fn release(ptr: NonNull<u8>, _size: usize) -> io::Result<()> {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    // Size must be zero with MEM_RELEASE.
    if VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
