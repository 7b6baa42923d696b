pub(crate) mod allocator;
pub(crate) mod bitmap;
pub(crate) mod block;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod index;
pub(crate) mod mapping;
pub(crate) mod pool;
pub mod stats;
pub(crate) mod vm;

// Tests that read the process-wide counters take this for writing; tests
// that map memory take it for reading.
#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
