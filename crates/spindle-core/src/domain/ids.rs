//! Ids - 型付き ID
//!
//! ID はすべて ULID を `Id<T>` で包んだもの。`T` はゼロサイズのマーカー型。
//! ULID は生成時刻順に並び、調整なしでどのノードでも生成できる。
//!
//! マーカーにより `JobId` / `TaskId` / `NodeId` をコンパイル時に区別しつつ、
//! 実装は一つで済ませる。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait for each ID kind.
///
/// Provides the prefix used by `Display` ("job-", "task-", "node-").
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic ULID-backed identifier.
///
/// `T` only exists at compile time (`PhantomData`), so `Id<T>` is exactly as
/// large as a `Ulid`.
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

// Manual impls: derive would require `T: Clone/Copy`, which markers are not
// required to be.
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// Fresh id from the system clock. Prefer `IdGenerator` in production
    /// code paths so the clock can be swapped in tests.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Markers
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Node {}

impl IdMarker for Node {
    fn prefix() -> &'static str {
        "node-"
    }
}

// ========================================
// Aliases
// ========================================

/// Identifier of a Job (one end-to-end transcode request).
pub type JobId = Id<Job>;

/// Identifier of a Task (one schedulable segment/pass of one stream).
pub type TaskId = Id<Task>;

/// Identifier of a cluster Node.
pub type NodeId = Id<Node>;
