//! Persistence bridge for the tracked-test set
//!
//! The services read the full set once at startup and write through on every
//! mutation. The store itself is a collaborator seam:
//! - `sqlite` - SQLite-backed store keyed by qr_code_hash
//! - `memory` - In-memory store and recycle bin, used in tests

// Submodules
pub mod memory;
pub mod sqlite;

// Re-export commonly used types
pub use memory::{MemoryRecycleBin, MemoryTestStore};
pub use sqlite::SqliteTestStore;

use crate::Result;
use crate::model::{CoronaTest, FamilyMemberTest};
use serde::{Deserialize, Serialize};

/// A persisted test entry, tagged with who it belongs to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredTest {
    /// Test tracked for the app user
    User(CoronaTest),
    /// Test tracked for a family member
    Family(FamilyMemberTest),
}

impl StoredTest {
    /// Stable local identity of the wrapped test
    pub fn qr_code_hash(&self) -> &str {
        match self {
            StoredTest::User(test) => test.qr_code_hash(),
            StoredTest::Family(member) => member.qr_code_hash(),
        }
    }
}

/// Durable key/value persistence of the full tracked-test set
pub trait TestStore: Send + Sync {
    /// Load all persisted entries (called once at service startup)
    fn load(&self) -> Result<Vec<StoredTest>>;

    /// Insert or replace the entry with the same qr_code_hash
    fn upsert(&self, entry: &StoredTest) -> Result<()>;

    /// Remove the entry with the given qr_code_hash, if present
    fn remove(&self, qr_code_hash: &str) -> Result<()>;
}

/// Receives soft-deleted tests for later restore
pub trait RecycleBin: Send + Sync {
    /// Hand over a test the user deleted
    fn recycle(&self, entry: StoredTest);
}
