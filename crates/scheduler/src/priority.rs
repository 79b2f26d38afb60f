//! Prefetch tasks and their ordering
//!
//! Tasks are kept in a stable max-priority-first list: a new task goes
//! immediately before the first task of strictly lower priority, so tasks of
//! equal priority keep their insertion order.

use std::collections::VecDeque;

use pageview_cache::SessionId;

/// Prefetch priority levels
///
/// Higher numeric values are processed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrefetchPriority {
    /// Behind the reader (low priority)
    Behind = 0,

    /// Predicted pages further out
    Predicted = 1,

    /// Pages adjacent to the current one
    Adjacent = 2,

    /// The page being navigated to
    Current = 3,
}

impl From<PrefetchPriority> for i32 {
    fn from(priority: PrefetchPriority) -> Self {
        priority as i32
    }
}

/// Descriptor of a page to decode
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef {
    /// Book or archive path
    pub source: String,

    /// Entry inside the archive, if any
    pub inner_path: Option<String>,

    /// Page index within the source
    pub page_index: usize,
}

impl ContentRef {
    /// Page of a book addressed by index
    pub fn new(source: impl Into<String>, page_index: usize) -> Self {
        Self {
            source: source.into(),
            inner_path: None,
            page_index,
        }
    }

    /// Set the archive entry path
    pub fn with_inner_path(mut self, inner_path: impl Into<String>) -> Self {
        self.inner_path = Some(inner_path.into());
        self
    }

    /// Stable cache/dedup key
    ///
    /// `source::inner_path` for archive entries, `source#page_index` otherwise.
    /// Returns `None` when the descriptor does not name a source.
    pub fn content_key(&self) -> Option<String> {
        let source = self.source.trim();
        if source.is_empty() {
            return None;
        }

        match self.inner_path.as_deref().map(str::trim) {
            Some("") => None,
            Some(inner) => Some(format!("{source}::{inner}")),
            None => Some(format!("{source}#{}", self.page_index)),
        }
    }
}

/// A queued prefetch request
#[derive(Debug, Clone)]
pub struct PrefetchTask {
    /// What to decode
    pub content: ContentRef,

    /// Session the task was created for
    pub session: SessionId,

    /// Content key derived from `content`
    pub key: String,

    /// Task priority (higher first)
    pub priority: i32,
}

impl PrefetchTask {
    /// Create a task; `None` if no content key can be derived
    pub fn new(content: ContentRef, priority: i32, session: SessionId) -> Option<Self> {
        let key = content.content_key()?;
        Some(Self {
            content,
            session,
            key,
            priority,
        })
    }
}

/// Stable priority-ordered task list
#[derive(Debug, Default)]
pub struct PriorityList {
    tasks: VecDeque<PrefetchTask>,
}

impl PriorityList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task before the first task of strictly lower priority
    pub fn insert(&mut self, task: PrefetchTask) {
        let position = self
            .tasks
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(position, task);
    }

    /// Remove the highest priority task
    pub fn pop(&mut self) -> Option<PrefetchTask> {
        self.tasks.pop_front()
    }

    /// Raise the priority of a queued task
    ///
    /// The task is re-positioned only when `priority` is higher than its
    /// current one. Returns `true` if a task with the key exists.
    pub fn raise_priority(&mut self, key: &str, priority: i32) -> bool {
        let Some(index) = self.tasks.iter().position(|task| task.key == key) else {
            return false;
        };

        if self.tasks[index].priority < priority {
            if let Some(mut task) = self.tasks.remove(index) {
                task.priority = priority;
                self.insert(task);
            }
        }
        true
    }

    /// Drop every task, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        count
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queued keys in processing order
    pub fn keys(&self) -> Vec<String> {
        self.tasks.iter().map(|task| task.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(page: usize, priority: i32) -> PrefetchTask {
        PrefetchTask::new(
            ContentRef::new("book.cbz", page),
            priority,
            SessionId::new("book.cbz"),
        )
        .unwrap()
    }

    #[test]
    fn test_priority_ordering() {
        assert!(PrefetchPriority::Current > PrefetchPriority::Adjacent);
        assert!(PrefetchPriority::Adjacent > PrefetchPriority::Predicted);
        assert!(PrefetchPriority::Predicted > PrefetchPriority::Behind);
        assert_eq!(i32::from(PrefetchPriority::Current), 3);
    }

    #[test]
    fn test_content_key() {
        assert_eq!(
            ContentRef::new("book.cbz", 3).content_key().as_deref(),
            Some("book.cbz#3")
        );
        assert_eq!(
            ContentRef::new("book.cbz", 3)
                .with_inner_path("ch1/003.jpg")
                .content_key()
                .as_deref(),
            Some("book.cbz::ch1/003.jpg")
        );
        assert_eq!(ContentRef::new("  ", 0).content_key(), None);
        assert_eq!(ContentRef::new("a.cbz", 0).with_inner_path("").content_key(), None);
        assert!(PrefetchTask::new(ContentRef::new("", 1), 0, SessionId::new("s")).is_none());
    }

    #[test]
    fn test_stable_insertion() {
        let mut list = PriorityList::new();
        list.insert(task(1, 1));
        list.insert(task(2, 3));
        list.insert(task(3, 1));
        list.insert(task(4, 3));
        list.insert(task(5, 2));

        assert_eq!(
            list.keys(),
            vec!["book.cbz#2", "book.cbz#4", "book.cbz#5", "book.cbz#1", "book.cbz#3"]
        );
        assert_eq!(list.pop().unwrap().key, "book.cbz#2");
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_raise_priority() {
        let mut list = PriorityList::new();
        list.insert(task(1, 2));
        list.insert(task(2, 1));
        list.insert(task(3, 1));

        assert!(list.raise_priority("book.cbz#3", 2));
        assert_eq!(list.keys(), vec!["book.cbz#1", "book.cbz#3", "book.cbz#2"]);

        // Lower priority leaves the task in place
        assert!(list.raise_priority("book.cbz#1", 0));
        assert_eq!(list.keys()[0], "book.cbz#1");

        assert!(!list.raise_priority("book.cbz#9", 5));
    }

    #[test]
    fn test_clear() {
        let mut list = PriorityList::new();
        list.insert(task(1, 1));
        list.insert(task(2, 2));
        list.insert(task(3, 1));

        assert_eq!(list.clear(), 3);
        assert!(list.is_empty());
        assert!(list.pop().is_none());
    }
}
