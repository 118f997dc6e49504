//! Pending hardware events, ordered by the cycle they fall due on.
//!
//! The cycle counter is the 32bit COP0 Count register, which wraps. Every ordering decision is
//! made on the signed distance `due - now`, so an event in the past (negative distance) always
//! sorts ahead of one in the future, no matter where the counter currently sits.

use log::{error, warn};

use crate::Error;

/// Default pool size. There can only ever be one live event per kind.
pub const POOL_CAPACITY: usize = 16;

pub const EVENT_KINDS: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum EventKind {
    Vi = 0x001,
    Compare = 0x002,
    Check = 0x004,
    Si = 0x008,
    Pi = 0x010,
    /// Housekeeping. Always runs after anything else due on the same cycle.
    Special = 0x020,
    Ai = 0x040,
    Sp = 0x080,
    Dp = 0x100,
    Hw2 = 0x200,
    Nmi = 0x400,
    RspDma = 0x800,
    DdMc = 0x1000,
    DdBm = 0x2000,
    DdDv = 0x4000,
    RspTsk = 0x8000,
}

impl EventKind {
    pub const ALL: [EventKind; EVENT_KINDS] = [
        EventKind::Vi, EventKind::Compare, EventKind::Check, EventKind::Si,
        EventKind::Pi, EventKind::Special, EventKind::Ai, EventKind::Sp,
        EventKind::Dp, EventKind::Hw2, EventKind::Nmi, EventKind::RspDma,
        EventKind::DdMc, EventKind::DdBm, EventKind::DdDv, EventKind::RspTsk,
    ];

    #[inline(always)]
    pub fn code(self) -> u32 {
        self as u32
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        (self as u32).trailing_zeros() as usize
    }

    pub fn from_code(code: u32) -> Result<EventKind, Error> {
        if code.count_ones() == 1 && code.trailing_zeros() < EVENT_KINDS as u32 {
            return Ok(Self::ALL[code.trailing_zeros() as usize]);
        }
        return Err(Error::UnknownEventKind(code));
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub due: u32,
}

impl PendingEvent {
    /// Signed distance from `now`. Zero or negative means the event has elapsed.
    #[inline(always)]
    pub fn distance(&self, now: u32) -> i32 {
        self.due.wrapping_sub(now) as i32
    }

    #[inline(always)]
    pub fn is_due(&self, now: u32) -> bool {
        self.distance(now) <= 0
    }
}

#[derive(Clone, Copy)]
struct Node {
    event: PendingEvent,
    next: Option<usize>,
}

/// Sorted singly linked list over a fixed pool of nodes
#[derive(Clone)]
pub struct EventQueue {
    pool: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    by_kind: [Option<usize>; EVENT_KINDS],
    len: usize,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        Self::with_capacity(POOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> EventQueue {
        let dummy = Node {
            event: PendingEvent { kind: EventKind::Special, due: 0 },
            next: None,
        };
        EventQueue {
            pool: vec![dummy; capacity],
            free: (0..capacity).rev().collect(),
            head: None,
            by_kind: [None; EVENT_KINDS],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn contains(&self, kind: EventKind) -> bool {
        self.by_kind[kind.index()].is_some()
    }

    /// Due cycle of the pending event of `kind`, if any
    pub fn due_of(&self, kind: EventKind) -> Option<u32> {
        self.by_kind[kind.index()].map(|node| self.pool[node].event.due)
    }

    pub fn peek(&self) -> Option<PendingEvent> {
        self.head.map(|node| self.pool[node].event)
    }

    pub fn next_due(&self) -> Option<u32> {
        self.peek().map(|e| e.due)
    }

    /// True when the earliest event has elapsed at `now`
    #[inline(always)]
    pub fn is_due(&self, now: u32) -> bool {
        match self.peek() {
            Some(e) => e.is_due(now),
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = PendingEvent> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = cursor?;
            cursor = self.pool[node].next;
            Some(self.pool[node].event)
        })
    }

    fn alloc(&mut self, event: PendingEvent) -> usize {
        let Some(node) = self.free.pop() else {
            error!("event pool exhausted ({} nodes) while scheduling {:?}", self.pool.len(), event.kind);
            panic!("event pool exhausted");
        };
        self.pool[node] = Node { event, next: None };
        self.by_kind[event.kind.index()] = Some(node);
        self.len += 1;
        return node;
    }

    fn release(&mut self, node: usize) {
        let kind = self.pool[node].event.kind;
        self.by_kind[kind.index()] = None;
        self.free.push(node);
        self.len -= 1;
    }

    fn reject_duplicate(&self, kind: EventKind) -> Result<(), Error> {
        if self.contains(kind) {
            warn!("two events of type {:?} in interrupt queue", kind);
            return Err(Error::DuplicateEvent(kind));
        }
        Ok(())
    }

    /// Schedule `kind` on the absolute cycle `due`.
    ///
    /// Only one event of each kind may be pending; a second request is logged and dropped.
    pub fn schedule(&mut self, kind: EventKind, due: u32, now: u32) -> Result<(), Error> {
        self.reject_duplicate(kind)?;

        let event = PendingEvent { kind, due };
        let key = event.distance(now);
        let node = self.alloc(event);

        // Find the last node that sorts at or before the new one
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let other = self.pool[current].event;
            let other_key = other.distance(now);
            let goes_after = other_key < key
                || (other_key == key && (kind == EventKind::Special || other.kind != EventKind::Special));
            if !goes_after {
                break;
            }
            prev = Some(current);
            cursor = self.pool[current].next;
        }

        self.pool[node].next = cursor;
        match prev {
            Some(p) => self.pool[p].next = Some(node),
            None => self.head = Some(node),
        }
        Ok(())
    }

    #[inline(always)]
    pub fn schedule_after(&mut self, kind: EventKind, delay: u32, now: u32) -> Result<(), Error> {
        self.schedule(kind, now.wrapping_add(delay), now)
    }

    /// Put an event at the head of the queue regardless of its due cycle.
    ///
    /// Used for interrupt checks, which must run before anything else.
    pub fn push_front(&mut self, kind: EventKind, due: u32) -> Result<(), Error> {
        self.reject_duplicate(kind)?;
        let node = self.alloc(PendingEvent { kind, due });
        self.pool[node].next = self.head;
        self.head = Some(node);
        Ok(())
    }

    /// Remove the pending event of `kind`. No-op when there isn't one.
    pub fn cancel(&mut self, kind: EventKind) -> Option<PendingEvent> {
        let target = self.by_kind[kind.index()]?;

        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == target {
                let next = self.pool[current].next;
                match prev {
                    Some(p) => self.pool[p].next = next,
                    None => self.head = next,
                }
                let event = self.pool[current].event;
                self.release(current);
                return Some(event);
            }
            prev = Some(current);
            cursor = self.pool[current].next;
        }
        unreachable!("event {:?} indexed but not linked", kind);
    }

    /// Remove the earliest event, due or not
    pub fn pop(&mut self) -> Option<PendingEvent> {
        let node = self.head?;
        self.head = self.pool[node].next;
        let event = self.pool[node].event;
        self.release(node);
        return Some(event);
    }

    /// Remove the earliest event only if it has elapsed at `now`
    pub fn pop_due(&mut self, now: u32) -> Option<PendingEvent> {
        if self.is_due(now) {
            return self.pop();
        }
        None
    }

    pub fn clear(&mut self) {
        while self.pop().is_some() {}
    }

    /// Pending events in queue order, for save states
    pub fn export(&self) -> Vec<PendingEvent> {
        self.iter().collect()
    }

    /// Replace the queue contents with a previously exported list
    pub fn import(&mut self, events: &[PendingEvent], now: u32) -> Result<(), Error> {
        self.clear();
        for event in events {
            self.schedule(event.kind, event.due, now)?;
        }
        Ok(())
    }

    /// Move every pending event so it keeps its distance to the counter when the counter
    /// jumps from `old_now` to `new_now`.
    pub fn rebase(&mut self, old_now: u32, new_now: u32) {
        let shift = new_now.wrapping_sub(old_now);
        let mut cursor = self.head;
        while let Some(node) = cursor {
            let event = &mut self.pool[node].event;
            event.due = event.due.wrapping_add(shift);
            cursor = self.pool[node].next;
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

pub type EventHandler<C> = fn(&mut C, PendingEvent);

/// At most one handler per event kind
pub struct EventHandlers<C> {
    handlers: [Option<EventHandler<C>>; EVENT_KINDS],
}

impl<C> EventHandlers<C> {
    pub fn new() -> Self {
        EventHandlers { handlers: [None; EVENT_KINDS] }
    }

    /// Returns the handler this one replaced
    pub fn register(&mut self, kind: EventKind, handler: EventHandler<C>) -> Option<EventHandler<C>> {
        self.handlers[kind.index()].replace(handler)
    }

    #[inline(always)]
    pub fn get(&self, kind: EventKind) -> Option<EventHandler<C>> {
        self.handlers[kind.index()]
    }
}

impl<C> Default for EventHandlers<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whatever owns both a queue and the handlers for it
pub trait EventContext: Sized {
    fn event_queue(&mut self) -> &mut EventQueue;
    fn event_handlers(&self) -> &EventHandlers<Self>;
}

/// Remove the earliest event and run its handler against `ctx`
pub fn pop_and_dispatch<C: EventContext>(ctx: &mut C) -> Option<PendingEvent> {
    let event = ctx.event_queue().pop()?;
    match ctx.event_handlers().get(event.kind) {
        Some(handler) => handler(ctx, event),
        None => error!("no handler for event {:?} (due {:#010x})", event.kind, event.due),
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kinds(queue: &EventQueue) -> Vec<EventKind> {
        queue.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let mut queue = EventQueue::new();
        let now = 1000;
        queue.schedule_after(EventKind::Vi, 5000, now).unwrap();
        queue.schedule_after(EventKind::Ai, 10, now).unwrap();
        assert_eq!(queue.len(), 2);

        let second = queue.schedule_after(EventKind::Ai, 20, now);
        assert_eq!(second, Err(Error::DuplicateEvent(EventKind::Ai)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.due_of(EventKind::Ai), Some(now + 10));

        let before = queue.export();
        assert!(queue.push_front(EventKind::Vi, now).is_err());
        assert_eq!(queue.export(), before);

        assert_eq!(queue.pop(), Some(PendingEvent { kind: EventKind::Ai, due: now + 10 }));
        assert_eq!(queue.pop(), Some(PendingEvent { kind: EventKind::Vi, due: now + 5000 }));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn ties_keep_insertion_order_with_special_last() {
        let mut queue = EventQueue::new();
        queue.schedule(EventKind::Special, 100, 0).unwrap();
        queue.schedule(EventKind::Pi, 100, 0).unwrap();
        queue.schedule(EventKind::Si, 100, 0).unwrap();
        queue.schedule(EventKind::Vi, 50, 0).unwrap();
        assert_eq!(kinds(&queue), vec![EventKind::Vi, EventKind::Pi, EventKind::Si, EventKind::Special]);
    }

    #[test]
    fn now_precedes_later_across_wrap() {
        let now: u32 = 0xffff_ffc0;
        let mut queue = EventQueue::new();
        queue.schedule(EventKind::Pi, now.wrapping_add(100), now).unwrap();
        queue.schedule(EventKind::Si, now, now).unwrap();
        assert_eq!(kinds(&queue), vec![EventKind::Si, EventKind::Pi]);
        assert!(queue.is_due(now));
        assert_eq!(queue.pop_due(now).map(|e| e.kind), Some(EventKind::Si));
        assert_eq!(queue.pop_due(now), None);
    }

    #[test]
    fn elapsed_precedes_far_future() {
        let now = 0x1234_5678u32;
        let mut queue = EventQueue::new();
        queue.schedule(EventKind::Ai, now.wrapping_add(0x7000_0000), now).unwrap();
        queue.schedule(EventKind::Dp, now.wrapping_sub(1), now).unwrap();
        assert_eq!(kinds(&queue), vec![EventKind::Dp, EventKind::Ai]);
    }

    #[test]
    fn cancel_and_push_front() {
        let mut queue = EventQueue::new();
        queue.schedule(EventKind::Vi, 10, 0).unwrap();
        queue.schedule(EventKind::Compare, 20, 0).unwrap();
        queue.push_front(EventKind::Check, 5).unwrap();
        assert_eq!(kinds(&queue), vec![EventKind::Check, EventKind::Vi, EventKind::Compare]);

        assert_eq!(queue.cancel(EventKind::Vi).map(|e| e.due), Some(10));
        assert_eq!(queue.cancel(EventKind::Vi), None);
        assert_eq!(kinds(&queue), vec![EventKind::Check, EventKind::Compare]);
        assert!(queue.push_front(EventKind::Check, 5).is_err());
    }

    #[test]
    fn export_import_and_rebase() {
        let mut queue = EventQueue::new();
        queue.schedule(EventKind::Vi, 300, 0).unwrap();
        queue.schedule(EventKind::Ai, 100, 0).unwrap();
        let saved = queue.export();

        let mut restored = EventQueue::new();
        restored.schedule(EventKind::Sp, 1, 0).unwrap();
        restored.import(&saved, 0).unwrap();
        assert_eq!(restored.export(), saved);

        restored.rebase(0, 0xffff_ff00);
        assert_eq!(restored.due_of(EventKind::Ai), Some(0xffff_ff00u32.wrapping_add(100)));
        assert_eq!(restored.due_of(EventKind::Vi), Some(0xffff_ff00u32.wrapping_add(300)));
        assert_eq!(restored.peek().map(|e| e.kind), Some(EventKind::Ai));
    }

    #[test]
    fn kind_codes() {
        assert_eq!(EventKind::from_code(0x20), Ok(EventKind::Special));
        assert_eq!(EventKind::from_code(0x8000), Ok(EventKind::RspTsk));
        assert_eq!(EventKind::from_code(0x3), Err(Error::UnknownEventKind(0x3)));
        assert_eq!(EventKind::from_code(0x10000), Err(Error::UnknownEventKind(0x10000)));
    }

    #[test]
    #[should_panic(expected = "event pool exhausted")]
    fn pool_exhaustion_is_fatal() {
        let mut queue = EventQueue::with_capacity(2);
        queue.schedule(EventKind::Vi, 1, 0).unwrap();
        queue.schedule(EventKind::Ai, 2, 0).unwrap();
        let _ = queue.schedule(EventKind::Pi, 3, 0);
    }

    struct Recorder {
        queue: EventQueue,
        handlers: EventHandlers<Recorder>,
        seen: Vec<EventKind>,
    }

    impl EventContext for Recorder {
        fn event_queue(&mut self) -> &mut EventQueue { &mut self.queue }
        fn event_handlers(&self) -> &EventHandlers<Self> { &self.handlers }
    }

    fn record(ctx: &mut Recorder, event: PendingEvent) {
        ctx.seen.push(event.kind);
        if event.kind == EventKind::Ai {
            // handlers may schedule more work
            ctx.queue.schedule(EventKind::Pi, event.due + 1, event.due).unwrap();
        }
    }

    #[test]
    fn dispatch_runs_registered_handlers() {
        let mut ctx = Recorder { queue: EventQueue::new(), handlers: EventHandlers::new(), seen: vec![] };
        ctx.handlers.register(EventKind::Ai, record);
        ctx.handlers.register(EventKind::Pi, record);
        ctx.queue.schedule(EventKind::Ai, 10, 0).unwrap();
        ctx.queue.schedule(EventKind::Vi, 20, 0).unwrap();

        while pop_and_dispatch(&mut ctx).is_some() {}
        // Vi has no handler, it is dropped with an error
        assert_eq!(ctx.seen, vec![EventKind::Ai, EventKind::Pi]);
        assert!(ctx.queue.is_empty());
    }

    proptest! {
        #[test]
        fn pop_order_matches_reference(
            now in any::<u32>(),
            picks in proptest::collection::vec((0usize..EVENT_KINDS, -0x7fff_0000i32..0x7fff_0000i32), 1..40),
        ) {
            let mut queue = EventQueue::new();
            // (distance, insertion order, kind)
            let mut reference: Vec<(i32, usize, EventKind)> = vec![];
            for (order, (kind_idx, delta)) in picks.into_iter().enumerate() {
                let kind = EventKind::ALL[kind_idx];
                let due = now.wrapping_add(delta as u32);
                let accepted = queue.schedule(kind, due, now).is_ok();
                let duplicate = reference.iter().any(|r| r.2 == kind);
                prop_assert_eq!(accepted, !duplicate);
                if accepted {
                    reference.push((delta, order, kind));
                }
            }
            reference.sort_by_key(|&(delta, order, kind)| (delta, kind == EventKind::Special, order));

            let mut last = i32::MIN;
            for expected in reference {
                let event = queue.pop().unwrap();
                prop_assert_eq!(event.kind, expected.2);
                prop_assert!(event.distance(now) >= last);
                last = event.distance(now);
            }
            prop_assert!(queue.is_empty());
        }
    }
}
