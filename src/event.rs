use std::{cmp::Ordering, collections::BinaryHeap, mem::take};

/// Simulation time in picoseconds.
pub type Time = u64;

/// Index of a registered entity within its timeline.
pub type EntityId = usize;

/// Insertion sequence number stamped on a scheduled event. Doubles as the
/// handle for removal and rescheduling.
pub type EventId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<M> {
    pub time: Time,
    pub target: EntityId,
    pub message: M,
}

#[derive(Debug)]
struct Entry<M> {
    seq: EventId,
    event: Event<M>,
}

impl<M> PartialEq for Entry<M> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<M> Eq for Entry<M> {}

impl<M> PartialOrd for Entry<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Entry<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap, so the least `(time, seq)` must compare
        // greatest. the seq tie-break keeps same-time events FIFO
        (other.event.time)
            .cmp(&self.event.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending events ordered by `(time, insertion sequence)`.
///
/// Ties on `time` resolve in insertion order, so delivery over a
/// constant-delay channel is FIFO without extra bookkeeping.
#[derive(Debug)]
pub struct EventList<M> {
    heap: BinaryHeap<Entry<M>>,
    seq: EventId,
}

impl<M> Default for EventList<M> {
    fn default() -> Self {
        Self {
            heap: Default::default(),
            seq: 0,
        }
    }
}

impl<M> EventList<M> {
    pub fn push(&mut self, event: Event<M>) -> EventId {
        self.seq += 1;
        let seq = self.seq;
        self.heap.push(Entry { seq, event });
        seq
    }

    pub fn pop(&mut self) -> Option<Event<M>> {
        self.heap.pop().map(|entry| entry.event)
    }

    pub fn peek(&self) -> Option<&Event<M>> {
        self.heap.peek().map(|entry| &entry.event)
    }

    /// Withdraw a scheduled event. A withdrawn event never fires.
    ///
    /// Linear rebuild of the heap. Removal is rare (expiration-style
    /// rescheduling), the hot path stays push/pop.
    pub fn remove(&mut self, id: EventId) -> Option<Event<M>> {
        let mut entries = take(&mut self.heap).into_vec();
        let removed = entries
            .iter()
            .position(|entry| entry.seq == id)
            .map(|index| entries.swap_remove(index).event);
        self.heap = entries.into();
        removed
    }

    /// Remove + re-push under a new time. The event is stamped with a fresh
    /// sequence number, i.e. it goes behind anything already queued at
    /// `time`.
    pub fn update_time(&mut self, id: EventId, time: Time) -> Option<EventId> {
        let mut event = self.remove(id)?;
        event.time = time;
        Some(self.push(event))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
