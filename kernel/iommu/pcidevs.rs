//! Global device-operations lock.
//!
//! Device assignment, quarantine setup and reserved-region import are
//! serialized by one system-wide lock. State that relies on it (identity-map
//! registries, the pseudo domain-ID bitmap) takes no lock of its own; instead
//! access demands a [`PcidevsGuard`], so holding the lock is checked by the
//! type system.

use core::cell::UnsafeCell;
use core::fmt;

use spin::{Mutex, MutexGuard};

static PCIDEVS_LOCK: Mutex<()> = Mutex::new(());

/// Proof that the caller holds the device-operations lock.
pub struct PcidevsGuard {
    _guard: MutexGuard<'static, ()>,
}

impl fmt::Debug for PcidevsGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PcidevsGuard")
    }
}

/// Acquire the device-operations lock.
pub fn pcidevs_lock() -> PcidevsGuard {
    PcidevsGuard {
        _guard: PCIDEVS_LOCK.lock(),
    }
}

/// Whether some CPU holds the device-operations lock.
#[inline]
pub fn pcidevs_locked() -> bool {
    PCIDEVS_LOCK.is_locked()
}

/// Data serialized by the device-operations lock.
pub struct PcidevsCell<T> {
    value: UnsafeCell<T>,
}

// SAFETY: every access goes through `get_mut`, which requires the unique
// `PcidevsGuard`, so at most one CPU touches the contents at a time.
unsafe impl<T: Send> Sync for PcidevsCell<T> {}

impl<T> PcidevsCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Borrow the contents under the device-operations lock.
    ///
    /// The guard is borrowed mutably for as long as the contents, so two
    /// cells cannot be borrowed through the same guard at once.
    #[inline]
    pub fn get_mut<'a>(&'a self, _guard: &'a mut PcidevsGuard) -> &'a mut T {
        // SAFETY: only one `PcidevsGuard` exists at a time and it is
        // exclusively borrowed for the lifetime of the returned reference.
        unsafe { &mut *self.value.get() }
    }

    /// Exclusive access without the lock when the cell itself is unshared.
    #[inline]
    pub fn get_mut_exclusive(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for PcidevsCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Serializes tests that take the global lock.
#[cfg(test)]
pub(crate) static TEST_SERIAL: Mutex<()> = Mutex::new(());
