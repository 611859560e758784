//! Leased log readers
//!
//! Opening a log reader is not free, so readers are pooled. A reader is
//! taken with [`ReaderPool::borrow_reader`] and handed back when the
//! returned [`ReaderLease`] is dropped. Because the return happens in
//! `Drop`, it also happens on `?` early returns and during unwinding.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{RecordReadResult, SeqReadResult, TransactionFileReader};
use crate::error::{IndexError, Result};

/// Creates new log readers for the pool
pub type ReaderFactory = Arc<dyn Fn() -> Box<dyn TransactionFileReader> + Send + Sync>;

struct PoolInner {
    factory: ReaderFactory,
    idle: Mutex<Vec<Box<dyn TransactionFileReader>>>,
    max_idle: usize,
    leased: AtomicUsize,
    created: AtomicUsize,
}

impl PoolInner {
    fn give_back(&self, reader: Box<dyn TransactionFileReader>) {
        self.leased.fetch_sub(1, Ordering::AcqRel);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(reader);
        }
    }
}

/// Pool of transaction log readers
#[derive(Clone)]
pub struct ReaderPool {
    inner: Arc<PoolInner>,
}

impl ReaderPool {
    /// Create a pool that keeps at most `max_idle` readers between leases
    pub fn new<F>(factory: F, max_idle: usize) -> Self
    where
        F: Fn() -> Box<dyn TransactionFileReader> + Send + Sync + 'static,
    {
        ReaderPool::from_factory(Arc::new(factory), max_idle)
    }

    /// Create a pool from a shared factory
    pub fn from_factory(factory: ReaderFactory, max_idle: usize) -> Self {
        ReaderPool {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(Vec::new()),
                max_idle,
                leased: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease a reader, creating one if none is idle
    pub fn borrow_reader(&self) -> ReaderLease {
        let reader = self.inner.idle.lock().pop();
        let reader = match reader {
            Some(reader) => reader,
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                (self.inner.factory)()
            }
        };
        self.inner.leased.fetch_add(1, Ordering::AcqRel);
        ReaderLease {
            reader,
            pool: Some(Arc::clone(&self.inner)),
        }
    }

    /// Number of leases currently outstanding
    pub fn leased(&self) -> usize {
        self.inner.leased.load(Ordering::Acquire)
    }

    /// Number of readers waiting in the pool
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of readers the factory has produced
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ReaderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPool")
            .field("leased", &self.leased())
            .field("idle", &self.idle())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

/// Scoped ownership of one log reader
///
/// Dereferences to the reader. Dropping the lease returns the reader to
/// its pool.
pub struct ReaderLease {
    reader: Box<dyn TransactionFileReader>,
    pool: Option<Arc<PoolInner>>,
}

impl ReaderLease {
    /// Wrap a reader that does not belong to any pool
    pub fn detached(reader: Box<dyn TransactionFileReader>) -> Self {
        ReaderLease { reader, pool: None }
    }
}

impl Deref for ReaderLease {
    type Target = dyn TransactionFileReader;

    fn deref(&self) -> &Self::Target {
        &*self.reader
    }
}

impl DerefMut for ReaderLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.reader
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let reader = std::mem::replace(&mut self.reader, Box::new(Released));
            pool.give_back(reader);
        }
    }
}

/// Stand-in left behind once a lease has handed its reader back
struct Released;

impl TransactionFileReader for Released {
    fn reposition(&mut self, _position: u64) {}

    fn try_read_next(&mut self) -> Result<SeqReadResult> {
        Err(released())
    }

    fn try_read_prev(&mut self) -> Result<SeqReadResult> {
        Err(released())
    }

    fn try_read_at(&mut self, _position: u64) -> Result<RecordReadResult> {
        Err(released())
    }

    fn exists_at(&mut self, _position: u64) -> Result<bool> {
        Err(released())
    }
}

fn released() -> IndexError {
    IndexError::log_read("reader lease already released")
}

impl fmt::Debug for ReaderLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderLease")
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}
