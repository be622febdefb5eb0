// Interrupt-disabling spinlock
//
// Wraps a spin mutex so the critical section also runs with local interrupts
// masked; the prior interrupt state is restored on unlock. Used for state
// shared with interrupt-level code, most prominently the PMM free lists.

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::arch;

pub struct IntrSpinMutex<T> {
    inner: Mutex<T>,
}

pub struct IntrSpinGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    restore_interrupts: bool,
}

impl<T> IntrSpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IntrSpinGuard<'_, T> {
        let restore_interrupts = arch::disable_interrupts();
        IntrSpinGuard {
            guard: Some(self.inner.lock()),
            restore_interrupts,
        }
    }
}

impl<T> Deref for IntrSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IntrSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IntrSpinGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock strictly before re-enabling interrupts.
        self.guard.take();
        if self.restore_interrupts {
            arch::enable_interrupts();
        }
    }
}
