// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registry of locked buffers, keyed by ID.
//!
//! A buffer is registered in two steps. [`BufferRegistry::create`] reserves
//! an ID for a buffer under construction; the entry is invisible to lookups
//! and sweeps until [`BufferRegistry::publish`] stores the finished buffer,
//! or [`BufferRegistry::abandon`] drops the reservation on a failed
//! construction.
//!
//! Short operations run under the registry lock. [`BufferRegistry::with_buffer`]
//! instead checks the buffer out and runs without the lock, so only other
//! operations on the same ID wait for it. Removals and sweeps wait for
//! checked-out buffers to come back before taking them.

use crate::BufferId;
use crate::ProcessId;
use crate::buffer::LockedBuffer;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;

enum Entry<B> {
    Constructing { owner: ProcessId },
    Published(B),
    CheckedOut { owner: ProcessId },
}

impl<B: LockedBuffer> Entry<B> {
    /// The owner of a published or checked-out buffer.
    fn published_owner(&self) -> Option<ProcessId> {
        match self {
            Entry::Published(buffer) => Some(buffer.owner().pid),
            Entry::CheckedOut { owner } => Some(*owner),
            Entry::Constructing { .. } => None,
        }
    }
}

struct RegistryInner<B> {
    next_id: u64,
    entries: BTreeMap<BufferId, Entry<B>>,
}

/// The buffers of one kind.
pub struct BufferRegistry<B> {
    inner: Mutex<RegistryInner<B>>,
    returned: Condvar,
}

impl<B: LockedBuffer> Default for BufferRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: LockedBuffer> BufferRegistry<B> {
    /// Creates an empty registry. IDs start at zero.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                entries: BTreeMap::new(),
            }),
            returned: Condvar::new(),
        }
    }

    /// Reserves a fresh ID for a buffer owned by `owner`.
    pub fn create(&self, owner: ProcessId) -> BufferId {
        let mut inner = self.inner.lock();
        let id = BufferId(inner.next_id);
        inner.next_id = inner
            .next_id
            .checked_add(1)
            .expect("buffer id space exhausted");
        inner.entries.insert(id, Entry::Constructing { owner });
        tracing::trace!(kind = %B::KIND, %id, %owner, "reserved buffer id");
        id
    }

    /// Stores the finished buffer for a reserved ID, making it visible.
    pub fn publish(&self, id: BufferId, buffer: B) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&id)
            .expect("published id must be reserved");
        assert!(
            matches!(entry, Entry::Constructing { .. }),
            "buffer {id} published twice"
        );
        *entry = Entry::Published(buffer);
    }

    /// Drops the reservation for a buffer whose construction failed.
    pub fn abandon(&self, id: BufferId) {
        let mut inner = self.inner.lock();
        match inner.entries.remove(&id) {
            Some(Entry::Constructing { .. }) => {}
            Some(entry) => {
                inner.entries.insert(id, entry);
                panic!("buffer {id} abandoned after publication");
            }
            None => panic!("abandoned id {id} was never reserved"),
        }
    }

    /// Blocks until `id` is not checked out.
    fn wait_returned(&self, inner: &mut MutexGuard<'_, RegistryInner<B>>, id: BufferId) {
        while matches!(inner.entries.get(&id), Some(Entry::CheckedOut { .. })) {
            self.returned.wait(inner);
        }
    }

    /// Runs `f` on the published buffer with ID `id`, under the registry
    /// lock. Waits first if the buffer is checked out.
    pub fn find<R>(&self, id: BufferId, f: impl FnOnce(&B) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        self.wait_returned(&mut inner, id);
        match inner.entries.get(&id) {
            Some(Entry::Published(buffer)) => Some(f(buffer)),
            _ => None,
        }
    }

    /// Runs `f` on the published buffer with ID `id` without holding the
    /// registry lock.
    ///
    /// The buffer stays registered while `f` runs, and removals of `id` wait
    /// until it returns. Operations on other IDs proceed.
    pub fn with_buffer<R>(&self, id: BufferId, f: impl FnOnce(&B) -> R) -> Option<R> {
        let checkout = {
            let mut inner = self.inner.lock();
            self.wait_returned(&mut inner, id);
            let entry = inner.entries.get_mut(&id)?;
            let Some(owner) = entry.published_owner() else {
                return None;
            };
            let Entry::Published(buffer) = std::mem::replace(entry, Entry::CheckedOut { owner })
            else {
                unreachable!()
            };
            Checkout {
                registry: self,
                id,
                buffer: Some(buffer),
            }
        };
        let buffer = checkout.buffer.as_ref()?;
        Some(f(buffer))
    }

    /// Removes and returns the published buffer with ID `id`.
    pub fn remove(&self, id: BufferId) -> Option<B> {
        let mut inner = self.inner.lock();
        self.wait_returned(&mut inner, id);
        if !matches!(inner.entries.get(&id), Some(Entry::Published(_))) {
            return None;
        }
        match inner.entries.remove(&id) {
            Some(Entry::Published(buffer)) => Some(buffer),
            _ => unreachable!(),
        }
    }

    /// The IDs of all published buffers, in ID order.
    pub fn each(&self) -> impl Iterator<Item = BufferId> + use<B> {
        self.ids_matching(|_| true).into_iter()
    }

    /// The IDs of the published buffers owned by `pid`, in ID order.
    pub fn each_owned_by(&self, pid: ProcessId) -> impl Iterator<Item = BufferId> + use<B> {
        self.ids_matching(|owner| owner == pid).into_iter()
    }

    fn ids_matching(&self, mut f: impl FnMut(ProcessId) -> bool) -> Vec<BufferId> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.published_owner().is_some_and(&mut f))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Removes every published buffer owned by `pid`.
    pub fn take_owned_by(&self, pid: ProcessId) -> Vec<(BufferId, B)> {
        self.take_matching(|owner| owner == pid)
    }

    /// Removes every published buffer.
    pub fn take_all(&self) -> Vec<(BufferId, B)> {
        self.take_matching(|_| true)
    }

    fn take_matching(&self, mut f: impl FnMut(ProcessId) -> bool) -> Vec<(BufferId, B)> {
        let mut inner = self.inner.lock();
        while inner
            .entries
            .values()
            .any(|entry| matches!(entry, Entry::CheckedOut { owner } if f(*owner)))
        {
            self.returned.wait(&mut inner);
        }

        let ids: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, entry)| match entry {
                Entry::Published(buffer) => f(buffer.owner().pid),
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| match inner.entries.remove(&id) {
                Some(Entry::Published(buffer)) => Some((id, buffer)),
                _ => None,
            })
            .collect()
    }

    /// The number of published buffers.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.published_owner().is_some())
            .count()
    }

    /// Whether no buffers are published.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The owners of buffers still under construction.
    pub fn constructing(&self) -> Vec<ProcessId> {
        self.inner
            .lock()
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Constructing { owner } => Some(*owner),
                _ => None,
            })
            .collect()
    }
}

/// A buffer checked out of the registry. Dropping it puts the buffer back
/// and wakes waiters, including when the caller's closure panics.
struct Checkout<'a, B: LockedBuffer> {
    registry: &'a BufferRegistry<B>,
    id: BufferId,
    buffer: Option<B>,
}

impl<B: LockedBuffer> Drop for Checkout<'_, B> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut inner = self.registry.inner.lock();
            if let Some(entry) = inner.entries.get_mut(&self.id) {
                *entry = Entry::Published(buffer);
            }
        }
        self.registry.returned.notify_all();
    }
}
