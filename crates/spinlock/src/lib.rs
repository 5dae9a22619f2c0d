#![cfg_attr(not(test), no_std)]

//! Test-and-set spinlocks with IRQ-state save/restore and a deadlock
//! watchdog, grounded in the original kernel's `spinlock_acquire`/
//! `spinlock_release` (a plain busy loop with a 3,000,000-iteration
//! panic bound) and generalized into a small strategy split: [`RawSpin`]
//! is the bare test-and-set core, [`Spin`] wraps it with interrupt
//! masking, and [`SpinPrimitive`] skips the masking for callers that
//! already run with interrupts disabled.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::panic::Location;
use core::sync::atomic::{AtomicBool, Ordering};

/// Matches the original's spin bound before the deadlock watchdog fires.
const WATCHDOG_LIMIT: usize = 3_000_000;

mod irq {
    /// Disable interrupts, returning whether they were enabled beforehand.
    #[cfg(all(target_arch = "x86_64", not(test)))]
    #[inline(always)]
    pub unsafe fn disable_save() -> bool {
        let flags: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {0}; cli", out(reg) flags, options(nomem, preserves_flags));
        }
        flags & (1 << 9) != 0
    }

    #[cfg(all(target_arch = "x86_64", not(test)))]
    #[inline(always)]
    pub unsafe fn restore(was_enabled: bool) {
        if was_enabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
        }
    }

    #[cfg(all(target_arch = "aarch64", not(test)))]
    #[inline(always)]
    pub unsafe fn disable_save() -> bool {
        let daif: u64;
        unsafe {
            core::arch::asm!("mrs {0}, daif", out(reg) daif, options(nomem, nostack));
            core::arch::asm!("msr daifset, #2", options(nomem, nostack));
        }
        daif & (1 << 7) == 0
    }

    #[cfg(all(target_arch = "aarch64", not(test)))]
    #[inline(always)]
    pub unsafe fn restore(was_enabled: bool) {
        if was_enabled {
            unsafe { core::arch::asm!("msr daifclr, #2", options(nomem, nostack)) };
        }
    }

    /// Host-side stand-in for `#[cfg(test)]` builds, which never run at
    /// CPL0/EL1 and cannot execute real interrupt-masking instructions.
    #[cfg(test)]
    #[inline(always)]
    pub unsafe fn disable_save() -> bool {
        true
    }

    #[cfg(test)]
    #[inline(always)]
    pub unsafe fn restore(_was_enabled: bool) {}
}

/// The bare test-and-set core, shared by [`Spin`] and [`SpinPrimitive`].
pub struct RawSpin {
    locked: AtomicBool,
}

impl RawSpin {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[track_caller]
    fn acquire_raw(&self) {
        let mut spins = 0usize;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
            spins += 1;
            if spins >= WATCHDOG_LIMIT {
                let caller = Location::caller();
                panic!("spinlock: deadlock watchdog fired, acquired from {caller}");
            }
        }
    }

    fn release_raw(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A spinlock that disables interrupts for the duration of the critical
/// section (matches `spinlock_acquire`/`spinlock_release`).
pub struct Spin<T: ?Sized> {
    raw: RawSpin,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Spin<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spin<T> {}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a Spin<T>,
    irqs_were_enabled: bool,
}

impl<T> Spin<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpin::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spin<T> {
    #[track_caller]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let irqs_were_enabled = unsafe { irq::disable_save() };
        self.raw.acquire_raw();
        SpinGuard {
            lock: self,
            irqs_were_enabled,
        }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release_raw();
        unsafe { irq::restore(self.irqs_were_enabled) };
    }
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// "Primitive" variant used where interrupt masking is already handled by
/// the caller (e.g. inside a trap handler that entered with IRQs off).
pub struct SpinPrimitive<T: ?Sized> {
    raw: RawSpin,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinPrimitive<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinPrimitive<T> {}

pub struct SpinPrimitiveGuard<'a, T: ?Sized> {
    lock: &'a SpinPrimitive<T>,
}

impl<T> SpinPrimitive<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpin::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinPrimitive<T> {
    #[track_caller]
    pub fn lock(&self) -> SpinPrimitiveGuard<'_, T> {
        self.raw.acquire_raw();
        SpinPrimitiveGuard { lock: self }
    }
}

impl<T: ?Sized> Drop for SpinPrimitiveGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release_raw();
    }
}

impl<T: ?Sized> Deref for SpinPrimitiveGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinPrimitiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutual_exclusion_is_respected_sequentially() {
        let lock = Spin::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn primitive_variant_skips_irq_masking() {
        let lock = SpinPrimitive::new(vec![1, 2, 3]);
        lock.lock().push(4);
        assert_eq!(*lock.lock(), vec![1, 2, 3, 4]);
    }
}
