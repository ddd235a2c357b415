// Copyright (C) 2023 gigablaster

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread,
    time::{Duration, SystemTime},
};

use log::{debug, error, info};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    modified: SystemTime,
    size: u64,
}

impl FileState {
    fn of(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;

        Some(Self {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: if metadata.is_file() { metadata.len() } else { 0 },
        })
    }
}

/// Recursive polling watcher over a set of root directories. Changes are
/// coalesced into per-path events: created, modified and removed entries
/// all surface as the affected path, and the refresh loop works out what
/// actually happened.
pub struct DirectoryWatcher {
    interval: Duration,
    roots: Arc<Mutex<Vec<PathBuf>>>,
    known: Arc<Mutex<HashMap<PathBuf, FileState>>>,
    running: Arc<AtomicBool>,
    sender: Sender<PathBuf>,
    receiver: Mutex<Receiver<PathBuf>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DirectoryWatcher {
    pub fn new(interval: Duration) -> Self {
        let (sender, receiver) = channel();

        Self {
            interval,
            roots: Arc::new(Mutex::new(Vec::new())),
            known: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            sender,
            receiver: Mutex::new(receiver),
            thread: None,
        }
    }

    /// Adds a root. Its current contents are recorded without emitting
    /// events; only changes from this point on are reported.
    pub fn add_directory(&self, path: &Path) {
        let mut roots = self.roots.lock();
        if roots.iter().any(|root| root == path) {
            return;
        }
        roots.push(path.to_path_buf());
        drop(roots);

        let mut known = self.known.lock();
        prime(path, &mut known);
        debug!("Watching directory {:?}", path);
    }

    pub fn remove_directory(&self, path: &Path) {
        self.roots.lock().retain(|root| root != path);
        self.known.lock().retain(|known, _| !known.starts_with(path));
    }

    pub fn watched_directories(&self) -> Vec<PathBuf> {
        self.roots.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = self.interval;
        let roots = self.roots.clone();
        let known = self.known.clone();
        let running = self.running.clone();
        let sender = self.sender.clone();

        self.thread = Some(thread::spawn(move || {
            info!("Asset watcher started");
            while running.load(Ordering::Acquire) {
                let snapshot = roots.lock().clone();
                scan(&snapshot, &known, &sender);
                thread::sleep(interval);
            }
            info!("Asset watcher stopped");
        }));
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Drains pending events, deduplicated while keeping first-seen
    /// order.
    pub fn pop_events(&self) -> Vec<PathBuf> {
        let receiver = self.receiver.lock();
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        while let Ok(path) = receiver.try_recv() {
            if seen.insert(path.clone()) {
                events.push(path);
            }
        }

        events
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn prime(root: &Path, known: &mut HashMap<PathBuf, FileState>) {
    walk(root, &mut |path, state| {
        known.insert(path.to_path_buf(), state);
    });
}

fn scan(roots: &[PathBuf], known: &Mutex<HashMap<PathBuf, FileState>>, sender: &Sender<PathBuf>) {
    let mut seen = HashMap::new();
    for root in roots {
        walk(root, &mut |path, state| {
            seen.insert(path.to_path_buf(), state);
        });
    }

    let mut known = known.lock();

    for (path, state) in &seen {
        if known.get(path) != Some(state) {
            known.insert(path.clone(), *state);
            let _ = sender.send(path.clone());
        }
    }

    let removed = known
        .keys()
        .filter(|path| !seen.contains_key(*path) && roots.iter().any(|root| path.starts_with(root)))
        .cloned()
        .collect::<Vec<_>>();
    for path in removed {
        known.remove(&path);
        let _ = sender.send(path);
    }
}

fn walk(root: &Path, visit: &mut impl FnMut(&Path, FileState)) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            error!("Failed to read directory {:?} - {:?}", root, err);
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(state) = FileState::of(&path) {
            visit(&path, state);
        }
        if path.is_dir() {
            walk(&path, visit);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{fs, path::Path, time::Duration};

    use super::DirectoryWatcher;

    fn wait_for_event(watcher: &DirectoryWatcher, path: &Path) -> bool {
        for _ in 0..200 {
            if watcher.pop_events().iter().any(|event| event == path) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        false
    }

    #[test]
    fn reports_new_and_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("existing.png"), b"old").unwrap();

        let mut watcher = DirectoryWatcher::new(Duration::from_millis(10));
        watcher.add_directory(dir.path());
        watcher.start();

        // priming means the pre-existing file stays quiet
        std::thread::sleep(Duration::from_millis(50));
        assert!(watcher.pop_events().is_empty());

        let created = dir.path().join("new.png");
        fs::write(&created, b"fresh").unwrap();
        assert!(wait_for_event(&watcher, &created));

        let existing = dir.path().join("existing.png");
        fs::write(&existing, b"changed").unwrap();
        assert!(wait_for_event(&watcher, &existing));

        watcher.stop();
    }

    #[test]
    fn reports_removed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doomed.png");
        fs::write(&path, b"bytes").unwrap();

        let mut watcher = DirectoryWatcher::new(Duration::from_millis(10));
        watcher.add_directory(dir.path());
        watcher.start();

        fs::remove_file(&path).unwrap();
        assert!(wait_for_event(&watcher, &path));

        watcher.stop();
    }

    #[test]
    fn recurses_into_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let mut watcher = DirectoryWatcher::new(Duration::from_millis(10));
        watcher.add_directory(dir.path());
        watcher.start();

        let deep = dir.path().join("nested").join("deep.png");
        fs::write(&deep, b"bytes").unwrap();
        assert!(wait_for_event(&watcher, &deep));

        watcher.stop();
    }

    #[test]
    fn removed_roots_stop_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryWatcher::new(Duration::from_millis(10));
        watcher.add_directory(dir.path());
        watcher.remove_directory(dir.path());
        watcher.start();

        fs::write(dir.path().join("ignored.png"), b"bytes").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(watcher.pop_events().is_empty());

        watcher.stop();
    }
}
