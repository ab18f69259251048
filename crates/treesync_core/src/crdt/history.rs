//! Undo/redo over the document root.
//!
//! [`HistoryController`] wraps the engine's undo manager. Only transactions
//! carrying the [`LOCAL_ORIGIN`] are recorded, so merged remote updates never
//! land on the local undo stack. Each change command is closed off as its own
//! step with [`HistoryController::seal`].

use std::sync::{Mutex, MutexGuard};

use yrs::{Doc, UndoManager, XmlFragmentRef};

/// Transaction origin of changes made through this replica.
pub const LOCAL_ORIGIN: &str = "local";

/// Transaction origin of merged remote updates.
pub const REMOTE_ORIGIN: &str = "remote";

/// Undo/redo tracking for one document.
pub struct HistoryController {
    manager: Option<Mutex<UndoManager>>,
}

impl HistoryController {
    /// Track local changes below `root`.
    pub fn new(doc: &Doc, root: &XmlFragmentRef) -> Self {
        let mut manager = UndoManager::new(doc, root);
        manager.include_origin(LOCAL_ORIGIN);
        Self {
            manager: Some(Mutex::new(manager)),
        }
    }

    /// A controller that records nothing; undo and redo do nothing.
    pub fn disabled() -> Self {
        Self { manager: None }
    }

    /// Whether changes are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.manager.is_some()
    }

    fn lock(&self) -> Option<MutexGuard<'_, UndoManager>> {
        self.manager
            .as_ref()
            .map(|manager| manager.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Revert the most recent step. Returns `false` when there was nothing to undo.
    pub fn undo(&self) -> bool {
        let Some(mut manager) = self.lock() else {
            return false;
        };
        if !manager.can_undo() {
            return false;
        }
        let undone = manager.undo_blocking();
        log::debug!("HistoryController: undo (changed = {})", undone);
        undone
    }

    /// Reapply the most recently undone step. Returns `false` when there was nothing to redo.
    pub fn redo(&self) -> bool {
        let Some(mut manager) = self.lock() else {
            return false;
        };
        if !manager.can_redo() {
            return false;
        }
        let redone = manager.redo_blocking();
        log::debug!("HistoryController: redo (changed = {})", redone);
        redone
    }

    /// Whether there is a step to undo.
    pub fn can_undo(&self) -> bool {
        self.lock().is_some_and(|manager| manager.can_undo())
    }

    /// Whether there is a step to redo.
    pub fn can_redo(&self) -> bool {
        self.lock().is_some_and(|manager| manager.can_redo())
    }

    /// Close the current step so the next change starts a new one.
    pub fn seal(&self) {
        if let Some(mut manager) = self.lock() {
            manager.reset();
        }
    }

    /// Forget both stacks.
    pub fn clear(&self) {
        if let Some(mut manager) = self.lock() {
            manager.clear();
        }
    }
}

impl std::fmt::Debug for HistoryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryController")
            .field("enabled", &self.is_enabled())
            .field("can_undo", &self.can_undo())
            .field("can_redo", &self.can_redo())
            .finish()
    }
}
