//! Node-wide memory accounting with RAII guards.

use crate::{ResourceOverdraftSnafu, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Memory categories tracked per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryCategory {
    /// Dynamic store payload.
    TabletDynamic,
    /// In-memory chunk data of preloaded tablets.
    TabletStatic,
}

#[derive(Debug, Default)]
struct CategoryUsage {
    used: i64,
    limit: i64,
}

/// Tracks used vs. limit per category; guards release on drop.
#[derive(Debug)]
pub struct MemoryTracker {
    categories: Mutex<HashMap<MemoryCategory, CategoryUsage>>,
}

impl MemoryTracker {
    /// Create a tracker with the given per-category limits.
    pub fn new(limits: &[(MemoryCategory, i64)]) -> Arc<Self> {
        let categories = limits
            .iter()
            .map(|(category, limit)| {
                (
                    *category,
                    CategoryUsage {
                        used: 0,
                        limit: *limit,
                    },
                )
            })
            .collect();
        Arc::new(Self {
            categories: Mutex::new(categories),
        })
    }

    /// Bytes currently charged to `category`.
    pub fn used(&self, category: MemoryCategory) -> i64 {
        self.categories
            .lock()
            .get(&category)
            .map(|u| u.used)
            .unwrap_or(0)
    }

    /// The configured limit of `category`.
    pub fn limit(&self, category: MemoryCategory) -> i64 {
        self.categories
            .lock()
            .get(&category)
            .map(|u| u.limit)
            .unwrap_or(i64::MAX)
    }

    /// Bytes left before `category` hits its limit.
    pub fn free(&self, category: MemoryCategory) -> i64 {
        let categories = self.categories.lock();
        categories
            .get(&category)
            .map(|u| (u.limit - u.used).max(0))
            .unwrap_or(i64::MAX)
    }

    /// Whether `category` is at or above its limit.
    pub fn is_exceeded(&self, category: MemoryCategory) -> bool {
        let categories = self.categories.lock();
        categories
            .get(&category)
            .map(|u| u.used >= u.limit)
            .unwrap_or(false)
    }

    /// Charge `size` bytes, failing on overdraft.
    pub fn acquire(self: &Arc<Self>, category: MemoryCategory, size: i64) -> Result<MemoryGuard> {
        {
            let mut categories = self.categories.lock();
            let usage = categories.entry(category).or_default();
            if usage.limit > 0 && usage.used + size > usage.limit {
                return ResourceOverdraftSnafu {
                    message: format!(
                        "category {category:?} would use {} of {} bytes",
                        usage.used + size,
                        usage.limit
                    ),
                }
                .fail();
            }
            usage.used += size;
        }
        Ok(MemoryGuard {
            tracker: Arc::clone(self),
            category,
            size,
        })
    }
}

/// Holds a memory charge; dropping it releases the bytes.
pub struct MemoryGuard {
    tracker: Arc<MemoryTracker>,
    category: MemoryCategory,
    size: i64,
}

impl fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("category", &self.category)
            .field("size", &self.size)
            .finish()
    }
}

impl MemoryGuard {
    /// Adjust the charge to a newly known size.
    pub fn update_size(&mut self, new_size: i64) {
        let mut categories = self.tracker.categories.lock();
        if let Some(usage) = categories.get_mut(&self.category) {
            usage.used += new_size - self.size;
        }
        self.size = new_size;
    }

    /// The currently charged size.
    pub fn size(&self) -> i64 {
        self.size
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        let mut categories = self.tracker.categories.lock();
        if let Some(usage) = categories.get_mut(&self.category) {
            usage.used -= self.size;
        }
    }
}
