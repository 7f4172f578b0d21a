//! Per-project session context.
//!
//! The session is the explicit object that replaces ambient globals: it
//! owns the project root, the persisted (non-sensitive) project file, the
//! secret store, the redaction rule set, and the run lock. Dropping the
//! session zeroizes the secret store; switching projects goes through
//! `SessionSlot`, which closes the previous session first.

use crate::errors::AppError;
use crate::runner::CancelHandle;
use crate::security::redact::RuleSet;
use crate::security::secrets::SecretStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Project-local state file. Holds non-sensitive data only; the secret
/// store has no serialization path into this struct.
pub const PROJECT_FILE: &str = ".terrapin.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    pub version: String,
    pub last_workspace: String,
    pub last_opened: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl Default for ProjectFile {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            last_workspace: "default".to_string(),
            last_opened: None,
            variables: BTreeMap::new(),
        }
    }
}

impl ProjectFile {
    fn load(root: &Path) -> Self {
        let path = root.join(PROJECT_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt project file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

pub struct Session {
    pub root: PathBuf,
    file: Mutex<ProjectFile>,
    secrets: Mutex<SecretStore>,
    rules: RwLock<Arc<RuleSet>>,
    /// Serializes lifecycle runs for this project; owned guards let the
    /// lock live across a streaming response.
    pub run_lock: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<CancelHandle>>,
    extra_patterns: Vec<String>,
}

impl Session {
    pub fn open(root: PathBuf, extra_patterns: Vec<String>) -> Self {
        let file = ProjectFile::load(&root);
        let rules = Arc::new(RuleSet::build([], &extra_patterns));
        info!(root = %root.display(), "project opened");
        Self {
            root,
            file: Mutex::new(file),
            secrets: Mutex::new(SecretStore::new()),
            rules: RwLock::new(rules),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            active: Mutex::new(None),
            extra_patterns,
        }
    }

    /// Current rule set; rebuilt only when the sensitive-value set changes,
    /// read concurrently by the streaming path.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .map(|r| r.clone())
            .unwrap_or_else(|_| Arc::new(RuleSet::empty()))
    }

    pub fn store_secret(&self, name: &str, value: String) {
        if let Ok(mut store) = self.secrets.lock() {
            store.store(name, value);
            self.rebuild_rules(&store);
        }
    }

    pub fn clear_secret(&self, name: &str) {
        if let Ok(mut store) = self.secrets.lock() {
            store.clear_one(name);
            self.rebuild_rules(&store);
        }
    }

    pub fn clear_secrets(&self) {
        if let Ok(mut store) = self.secrets.lock() {
            store.clear();
            self.rebuild_rules(&store);
        }
    }

    pub fn secret_names(&self) -> Vec<String> {
        self.secrets
            .lock()
            .map(|s| s.names())
            .unwrap_or_default()
    }

    pub fn has_secret(&self, name: &str) -> bool {
        self.secrets
            .lock()
            .map(|s| s.contains(name))
            .unwrap_or(false)
    }

    /// Transient name/value pairs for `-var` token assembly.
    pub fn secret_pairs(&self) -> Vec<(String, Zeroizing<String>)> {
        self.secrets.lock().map(|s| s.pairs()).unwrap_or_default()
    }

    fn rebuild_rules(&self, store: &SecretStore) {
        let rebuilt = Arc::new(RuleSet::build(store.values(), &self.extra_patterns));
        if let Ok(mut rules) = self.rules.write() {
            *rules = rebuilt;
        }
    }

    pub fn with_file<T>(&self, f: impl FnOnce(&ProjectFile) -> T) -> T {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        f(&file)
    }

    pub fn update_file<T>(&self, f: impl FnOnce(&mut ProjectFile) -> T) -> T {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut file)
    }

    /// Persist the non-sensitive snapshot and make sure the project file
    /// stays out of version control.
    pub fn save(&self) -> Result<(), AppError> {
        let rendered = {
            let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
            file.last_opened = Some(Utc::now());
            serde_json::to_string_pretty(&*file)
                .map_err(|e| AppError::Internal(e.to_string()))?
        };
        let path = self.root.join(PROJECT_FILE);
        fs::write(&path, rendered).map_err(|e| AppError::Internal(e.to_string()))?;
        ensure_gitignore(&self.root)?;
        Ok(())
    }

    pub fn set_active(&self, handle: Option<CancelHandle>) {
        if let Ok(mut active) = self.active.lock() {
            *active = handle;
        }
    }

    /// Cancel the in-flight run, if any. Returns whether one was signalled.
    pub fn cancel_active(&self) -> bool {
        match self.active.lock() {
            Ok(active) => match active.as_ref() {
                Some(handle) => {
                    handle.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn close(&self) {
        if let Err(e) = self.save() {
            warn!(root = %self.root.display(), error = %e, "failed to persist project file on close");
        }
        self.cancel_active();
        self.clear_secrets();
        info!(root = %self.root.display(), "project closed");
    }
}

fn ensure_gitignore(root: &Path) -> Result<(), AppError> {
    let path = root.join(".gitignore");
    let entry = format!("# terrapin project state (user-specific)\n{PROJECT_FILE}\n");
    match fs::read_to_string(&path) {
        Ok(content) => {
            if content.lines().any(|l| l.trim() == PROJECT_FILE) {
                return Ok(());
            }
            let mut updated = content;
            if !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str(&entry);
            fs::write(&path, updated).map_err(|e| AppError::Internal(e.to_string()))
        }
        Err(_) => fs::write(&path, entry).map_err(|e| AppError::Internal(e.to_string())),
    }
}

/// Holder for the active session. One project is open at a time, matching
/// the desktop front-end; opening a new one closes (persists and zeroizes)
/// the previous session.
#[derive(Default)]
pub struct SessionSlot {
    slot: RwLock<Option<Arc<Session>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Result<Arc<Session>, AppError> {
        self.slot
            .read()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(AppError::NoProject)
    }

    pub fn open(&self, root: PathBuf, extra_patterns: Vec<String>) -> Arc<Session> {
        let session = Arc::new(Session::open(root, extra_patterns));
        let previous = self
            .slot
            .write()
            .map(|mut slot| slot.replace(session.clone()))
            .unwrap_or(None);
        if let Some(previous) = previous {
            previous.close();
        }
        session
    }

    /// Close the active session, if any. Returns whether one was open.
    pub fn close(&self) -> bool {
        let previous = self
            .slot
            .write()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        match previous {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}
