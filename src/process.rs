/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Parent/child process-lifecycle bookkeeping and the per-process open-file
//! list.

use crate::{
    config::{FIRST_FD, MAX_CHILDREN},
    error::{KResult, KernelError},
    inode::Inode,
};
use std::sync::{Arc, Condvar, Mutex};

/// The outcome a process record settles into once it stops running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    NormalExit,
    ErrorExit,
}

struct ChildSlot {
    id: u32,
    record: Arc<ProcessRecord>,
}

struct Shared {
    status: Status,
    exit_code: i32,
    /// Set once the process has actually exited; the condvar wakes a
    /// `wait`er out of the "still running" spin.
    exited: bool,
}

/// One process's exit bookkeeping, shared between the process itself and
/// whichever parent eventually calls [`ProcessRecord::wait`] on it.
pub struct ProcessRecord {
    pub id: u32,
    shared: Mutex<Shared>,
    exit_signal: Condvar,
    orphan: Mutex<bool>,
    children: Mutex<Vec<ChildSlot>>,
}

impl ProcessRecord {
    /// Creates a fresh record for a not-yet-running process.
    pub fn new(id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            shared: Mutex::new(Shared {
                status: Status::Running,
                exit_code: 0,
                exited: false,
            }),
            exit_signal: Condvar::new(),
            orphan: Mutex::new(false),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Installs `child` into this process's children array. Fails if the
    /// array is already at [`MAX_CHILDREN`].
    pub fn add_child(&self, child: Arc<ProcessRecord>) -> KResult<()> {
        let mut children = self.children.lock().unwrap();
        if children.len() >= MAX_CHILDREN {
            return Err(KernelError::TooManyChildren);
        }
        children.push(ChildSlot {
            id: child.id,
            record: child,
        });
        Ok(())
    }

    /// Blocks until the child identified by `child_id` exits, then removes
    /// and consumes its record, returning its exit code. A second `wait` for
    /// the same id (already removed) returns `Err(ChildWaitMiss)`, matching
    /// a `-1` return to the caller.
    pub fn wait(&self, child_id: u32) -> KResult<i32> {
        let child = {
            let mut children = self.children.lock().unwrap();
            let pos = children
                .iter()
                .position(|c| c.id == child_id)
                .ok_or(KernelError::ChildWaitMiss)?;
            children.remove(pos).record
        };
        let shared = child.shared.lock().unwrap();
        let shared = child
            .exit_signal
            .wait_while(shared, |s| !s.exited)
            .unwrap();
        Ok(shared.exit_code)
    }

    /// Records the process's exit outcome and wakes up any parent blocked in
    /// [`ProcessRecord::wait`]. Every remaining child is marked orphaned (it
    /// will free itself) rather than waited on further.
    pub fn exit(&self, exit_code: i32, status: Status) {
        for child in self.children.lock().unwrap().drain(..) {
            child.record.mark_orphan();
        }
        let mut shared = self.shared.lock().unwrap();
        shared.exit_code = exit_code;
        shared.status = status;
        shared.exited = true;
        drop(shared);
        self.exit_signal.notify_all();
    }

    fn mark_orphan(&self) {
        *self.orphan.lock().unwrap() = true;
    }

    /// Whether this process's parent exited before it did, meaning it must
    /// free its own record instead of waiting to be joined.
    pub fn is_orphan(&self) -> bool {
        *self.orphan.lock().unwrap()
    }

    pub fn status(&self) -> Status {
        self.shared.lock().unwrap().status
    }
}

struct FdEntry {
    fd: i32,
    file: Arc<Inode>,
}

/// The per-process open-file table, a sorted-by-fd list starting allocation
/// at [`FIRST_FD`] (fds 0/1 are reserved for stdio and never handed out).
#[derive(Default)]
pub struct FdList {
    entries: Mutex<Vec<FdEntry>>,
}

impl FdList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `file`, returning the lowest fd `>= FIRST_FD` not already in
    /// use.
    pub fn insert(&self, file: Arc<Inode>) -> i32 {
        let mut entries = self.entries.lock().unwrap();
        let mut fd = FIRST_FD;
        for entry in entries.iter() {
            if entry.fd != fd {
                break;
            }
            fd += 1;
        }
        let pos = entries.iter().position(|e| e.fd > fd).unwrap_or(entries.len());
        entries.insert(pos, FdEntry { fd, file });
        fd
    }

    /// Returns the file open at `fd`, if any.
    pub fn get(&self, fd: i32) -> Option<Arc<Inode>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| e.file.clone())
    }

    /// Removes `fd` from the table, returning its file so the caller can
    /// close it through the inode table.
    pub fn remove(&self, fd: i32) -> Option<Arc<Inode>> {
        let mut entries = self.entries.lock().unwrap();
        let pos = entries.iter().position(|e| e.fd == fd)?;
        Some(entries.remove(pos).file)
    }

    /// Drains every entry, for use at process exit.
    pub fn clear(&self) -> Vec<Arc<Inode>> {
        self.entries
            .lock()
            .unwrap()
            .drain(..)
            .map(|e| e.file)
            .collect()
    }
}
