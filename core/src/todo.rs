//! Ordered, mutable list of work items used as the execution plan.
//!
//! Ids are monotonically increasing and never reused; execution order is
//! creation order.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::MagusErr;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    /// Glyph used when rendering a todo list.
    pub fn icon(self) -> &'static str {
        match self {
            TodoStatus::Pending => "[ ]",
            TodoStatus::InProgress => "[~]",
            TodoStatus::Completed => "[x]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TodoItem {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub status: TodoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`TodoStore::update`].
#[derive(Debug, Clone, Default)]
pub struct TodoPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TodoStatus>,
}

#[derive(Debug, Default)]
pub struct TodoStore {
    items: Vec<TodoItem>,
    next_id: u64,
}

impl TodoStore {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            next_id: 1,
        }
    }

    /// Insert a new pending item and return its id. The title must be
    /// non-empty after trimming.
    pub fn add(&mut self, title: &str, description: &str) -> Result<u64> {
        let title = title.trim();
        if title.is_empty() {
            return Err(MagusErr::InvalidArgument(
                "todo title must not be empty".to_string(),
            ));
        }
        let id = self.next_id;
        self.next_id += 1;
        let now = Utc::now();
        self.items.push(TodoItem {
            id,
            title: title.to_string(),
            description: description.trim().to_string(),
            status: TodoStatus::Pending,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    pub fn list(&self, include_completed: bool) -> Vec<TodoItem> {
        self.items
            .iter()
            .filter(|item| include_completed || item.status != TodoStatus::Completed)
            .cloned()
            .collect()
    }

    /// Apply the non-`None` fields of `patch`. Returns false when the id is
    /// unknown. `updated_at` advances on every successful call.
    pub fn update(&mut self, id: u64, patch: TodoPatch) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        if let Some(title) = patch.title {
            item.title = title;
        }
        if let Some(description) = patch.description {
            item.description = description;
        }
        if let Some(status) = patch.status {
            item.status = status;
        }
        item.updated_at = Utc::now().max(item.updated_at + chrono::Duration::nanoseconds(1));
        true
    }

    pub fn set_status(&mut self, id: u64, status: TodoStatus) -> bool {
        self.update(
            id,
            TodoPatch {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    pub fn delete(&mut self, id: u64) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    /// Remove every item. Ids are not reused afterwards.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, id: u64) -> Option<TodoItem> {
        self.items.iter().find(|item| item.id == id).cloned()
    }

    pub fn next_pending(&self) -> Option<TodoItem> {
        self.items
            .iter()
            .find(|item| item.status == TodoStatus::Pending)
            .cloned()
    }

    /// Pending items in creation order.
    pub fn execution_queue(&self) -> Vec<TodoItem> {
        self.items
            .iter()
            .filter(|item| item.status == TodoStatus::Pending)
            .cloned()
            .collect()
    }

    /// The queue slice preceding `stop_id` (exclusive). When no pending item
    /// has that id, the entire pending queue is returned.
    pub fn until(&self, stop_id: u64) -> Vec<TodoItem> {
        let queue = self.execution_queue();
        match queue.iter().position(|item| item.id == stop_id) {
            Some(index) => queue[..index].to_vec(),
            None => queue,
        }
    }

    /// Pending items from the first occurrence of `start_id` through the
    /// first occurrence of `end_id`, inclusive. An unseen `start_id` yields
    /// an empty list.
    pub fn range(&self, start_id: u64, end_id: u64) -> Vec<TodoItem> {
        let queue = self.execution_queue();
        let Some(start) = queue.iter().position(|item| item.id == start_id) else {
            return Vec::new();
        };
        let end = queue
            .iter()
            .position(|item| item.id == end_id)
            .unwrap_or(queue.len().saturating_sub(1));
        if end < start {
            return Vec::new();
        }
        queue[start..=end].to_vec()
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.status == TodoStatus::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Render the full list (completed included) the way the response
/// interpreter displays it: status icon, id, title, optional description.
pub fn render_list(items: &[TodoItem]) -> String {
    if items.is_empty() {
        return "No todos.".to_string();
    }
    let mut out = String::from("Todos:\n");
    for item in items {
        out.push_str(&format!("{} #{} {}", item.status.icon(), item.id, item.title));
        if !item.description.is_empty() {
            out.push_str(&format!(" — {}", item.description));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_with(n: u64) -> TodoStore {
        let mut store = TodoStore::new();
        for i in 1..=n {
            store.add(&format!("task {i}"), "").unwrap();
        }
        store
    }

    #[test]
    fn add_assigns_monotonic_ids_and_pending_status() {
        let mut store = TodoStore::new();
        let a = store.add("first", "desc").unwrap();
        let b = store.add("second", "").unwrap();
        assert_eq!((a, b), (1, 2));
        let item = store.get(a).unwrap();
        assert_eq!(item.title, "first");
        assert_eq!(item.status, TodoStatus::Pending);
        assert!(item.updated_at >= item.created_at);
    }

    #[test]
    fn empty_title_is_invalid_argument() {
        let mut store = TodoStore::new();
        assert!(matches!(
            store.add("   ", "desc"),
            Err(MagusErr::InvalidArgument(_))
        ));
    }

    #[test]
    fn ids_are_never_reused_after_delete_or_clear() {
        let mut store = store_with(2);
        assert!(store.delete(2));
        store.clear();
        let id = store.add("fresh", "").unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn update_advances_updated_at() {
        let mut store = store_with(1);
        let before = store.get(1).unwrap().updated_at;
        assert!(store.set_status(1, TodoStatus::Completed));
        let after = store.get(1).unwrap();
        assert!(after.updated_at > before);
        assert_eq!(after.status, TodoStatus::Completed);
    }

    #[test]
    fn update_unknown_id_returns_false() {
        let mut store = store_with(1);
        assert!(!store.update(99, TodoPatch::default()));
        assert!(!store.delete(99));
    }

    #[test]
    fn execution_queue_is_pending_in_creation_order() {
        let mut store = store_with(4);
        store.set_status(2, TodoStatus::Completed);
        let ids: Vec<u64> = store.execution_queue().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        // Strictly increasing by construction.
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn until_excludes_the_stop_item() {
        let store = store_with(4);
        let ids: Vec<u64> = store.until(3).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn until_with_unknown_id_returns_full_queue() {
        let store = store_with(3);
        let ids: Vec<u64> = store.until(99).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn range_is_inclusive_and_skips_completed() {
        let mut store = store_with(5);
        store.set_status(3, TodoStatus::Completed);
        let ids: Vec<u64> = store.range(2, 4).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 4]);
    }

    #[test]
    fn range_with_unseen_start_is_empty() {
        let store = store_with(3);
        assert!(store.range(99, 2).is_empty());
    }

    #[test]
    fn range_with_start_after_end_is_empty() {
        let store = store_with(3);
        assert!(store.range(3, 1).is_empty());
    }

    #[test]
    fn range_with_unseen_end_runs_to_queue_end() {
        let store = store_with(3);
        let ids: Vec<u64> = store.range(2, 99).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn next_pending_skips_in_progress() {
        let mut store = store_with(2);
        store.set_status(1, TodoStatus::InProgress);
        assert_eq!(store.next_pending().unwrap().id, 2);
    }

    #[test]
    fn render_list_shows_icons_and_ids() {
        let mut store = store_with(1);
        store.add("documented", "with details").unwrap();
        store.set_status(1, TodoStatus::Completed);
        let rendered = render_list(&store.list(true));
        assert!(rendered.contains("[x] #1 task 1"));
        assert!(rendered.contains("[ ] #2 documented — with details"));
    }
}
