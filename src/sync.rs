pub use std::sync::atomic;
pub use std::sync::{Arc, Weak};

/// A mutex that does not surface lock poisoning.
///
/// The simulation is single-threaded and event-driven; the lock only
/// expresses the single-writer-per-event rule, so a poisoned lock is
/// already a fatal bug and panicking is the right answer.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self(std::sync::Mutex::new(value))
    }
}

impl<T: ?Sized> Mutex<T> {
    #[must_use]
    pub fn lock(&self) -> std::sync::MutexGuard<T> {
        self.0.lock().unwrap()
    }
}
