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

use std::{collections::HashMap, sync::Arc};

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Counted gate over a set of jobs. Joining the group means waiting until
/// every job added so far has signalled completion. Cloning shares the
/// underlying counter.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<GroupInner>,
}

#[derive(Default)]
struct GroupInner {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self) {
        *self.inner.pending.lock() += 1;
    }

    pub(crate) fn done(&self) {
        let mut pending = self.inner.pending.lock();
        debug_assert!(*pending > 0);
        *pending -= 1;
        if *pending == 0 {
            self.inner.cond.notify_all();
        }
    }

    pub fn pending(&self) -> usize {
        *self.inner.pending.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    pub fn wait(&self) {
        let mut pending = self.inner.pending.lock();
        while *pending > 0 {
            self.inner.cond.wait(&mut pending);
        }
    }
}

/// Fixed-size worker pool. Jobs are closures bound to one or more wait
/// groups; every group is signalled when the closure returns.
///
/// Pool is owned by the system.
pub struct JobSystem {
    pool: ThreadPool,
}

impl JobSystem {
    pub fn new(worker_count: usize) -> Self {
        Self {
            pool: ThreadPoolBuilder::new()
                .num_threads(worker_count)
                .build()
                .unwrap(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn spawn<F>(&self, groups: &[WaitGroup], f: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        for group in groups {
            group.add();
        }
        let groups = groups.to_vec();
        self.pool.spawn(move || {
            let worker = rayon::current_thread_index().unwrap_or(0);
            f(worker);
            for group in &groups {
                group.done();
            }
        });
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        Self {
            pool: ThreadPoolBuilder::default().build().unwrap(),
        }
    }
}

#[derive(Clone, Default)]
struct DependencyEntry {
    write: WaitGroup,
    read: WaitGroup,
    sched: Arc<Mutex<()>>,
}

/// Per-fingerprint read/write ordering for jobs. Writers scheduled on a
/// key run alone and in order; readers run concurrently with each other
/// but never overlap a writer. Keys are 32-bit fingerprints of whatever
/// resource the caller wants ordered (a source path, an asset GUID).
pub struct DependencyCache {
    jobs: Arc<JobSystem>,
    all: WaitGroup,
    entries: Mutex<HashMap<u32, DependencyEntry>>,
}

impl DependencyCache {
    pub fn new(jobs: Arc<JobSystem>) -> Self {
        Self {
            jobs,
            all: WaitGroup::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule_write<F>(&self, key: u32, parent: Option<&WaitGroup>, f: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        let entry = self.entry(key);
        let _guard = entry.sched.lock();
        entry.write.wait();
        entry.read.wait();

        let mut groups = vec![entry.write.clone(), self.all.clone()];
        if let Some(parent) = parent {
            groups.push(parent.clone());
        }
        self.jobs.spawn(&groups, f);
    }

    pub fn schedule_read<F>(&self, key: u32, parent: Option<&WaitGroup>, f: F)
    where
        F: FnOnce(usize) + Send + 'static,
    {
        let entry = self.entry(key);
        let _guard = entry.sched.lock();
        entry.write.wait();

        let mut groups = vec![entry.read.clone(), self.all.clone()];
        if let Some(parent) = parent {
            groups.push(parent.clone());
        }
        self.jobs.spawn(&groups, f);
    }

    pub fn wait(&self, key: u32) {
        if let Some(entry) = self.find_entry(key) {
            entry.write.wait();
            entry.read.wait();
        }
    }

    pub fn wait_write(&self, key: u32) {
        if let Some(entry) = self.find_entry(key) {
            entry.write.wait();
        }
    }

    pub fn wait_read(&self, key: u32) {
        if let Some(entry) = self.find_entry(key) {
            entry.read.wait();
        }
    }

    pub fn wait_all(&self) {
        self.all.wait();
    }

    /// Drops entries with nothing in flight. Called periodically so the
    /// map does not grow with every path ever touched.
    pub fn trim(&self) {
        self.entries
            .lock()
            .retain(|_, entry| !entry.write.is_idle() || !entry.read.is_idle());
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }

    fn entry(&self, key: u32) -> DependencyEntry {
        self.entries.lock().entry(key).or_default().clone()
    }

    fn find_entry(&self, key: u32) -> Option<DependencyEntry> {
        self.entries.lock().get(&key).cloned()
    }
}

impl Drop for DependencyCache {
    fn drop(&mut self) {
        self.wait_all();
    }
}
