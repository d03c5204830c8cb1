//! Intrusive list helpers.
//!
//! Threads participate in doubly-linked membership lists (the ready list,
//! an object's waiter queue) and, independently, in one timing list (the
//! delay list or the infinite-wait list). Rather than threading raw
//! pointers through control blocks, the links are arena indices stored in
//! the thread control block itself; which of the two link pairs a helper
//! operates on is selected by a [`LinkAdapter`].
//!
//! Ordered insertion is by *descending* effective priority with FIFO order
//! among equal priorities: a newly inserted thread goes behind every thread
//! of the same priority. Insert/remove are O(1) apart from the ordered
//! insert's walk.
use crate::thread::ThreadCb;
use crate::utils::arena::Arena;

/// A pair of neighbor indices embedded in a [`ThreadCb`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    pub next: Option<u32>,
    pub prev: Option<u32>,
}

/// The head of an intrusive thread list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub first: Option<u32>,
    pub last: Option<u32>,
}

impl ListHead {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Selects which link pair of a [`ThreadCb`] a list operation uses.
pub(crate) trait LinkAdapter {
    fn link(cb: &ThreadCb) -> &Link;
    fn link_mut(cb: &mut ThreadCb) -> &mut Link;
}

/// Ready-list / waiter-queue membership. A thread is in at most one such
/// list at a time.
pub(crate) struct Membership;

impl LinkAdapter for Membership {
    #[inline]
    fn link(cb: &ThreadCb) -> &Link {
        &cb.link
    }
    #[inline]
    fn link_mut(cb: &mut ThreadCb) -> &mut Link {
        &mut cb.link
    }
}

/// Delay-list / infinite-wait-list membership.
pub(crate) struct Timing;

impl LinkAdapter for Timing {
    #[inline]
    fn link(cb: &ThreadCb) -> &Link {
        &cb.dlink
    }
    #[inline]
    fn link_mut(cb: &mut ThreadCb) -> &mut Link {
        &mut cb.dlink
    }
}

/// Insert `ix` before `pos` (`None` = at the back).
pub(crate) fn insert_before<A: LinkAdapter>(
    threads: &mut Arena<ThreadCb>,
    head: &mut ListHead,
    pos: Option<u32>,
    ix: u32,
) {
    let prev = match pos {
        Some(p) => A::link(threads.by_index(p)).prev,
        None => head.last,
    };

    *A::link_mut(threads.by_index_mut(ix)) = Link { next: pos, prev };

    match prev {
        Some(p) => A::link_mut(threads.by_index_mut(p)).next = Some(ix),
        None => head.first = Some(ix),
    }
    match pos {
        Some(p) => A::link_mut(threads.by_index_mut(p)).prev = Some(ix),
        None => head.last = Some(ix),
    }
}

/// Append `ix` at the back.
#[inline]
pub(crate) fn push_back<A: LinkAdapter>(
    threads: &mut Arena<ThreadCb>,
    head: &mut ListHead,
    ix: u32,
) {
    insert_before::<A>(threads, head, None, ix);
}

/// Insert `ix` in descending effective-priority order, behind every thread
/// of equal priority.
pub(crate) fn push_by_priority<A: LinkAdapter>(
    threads: &mut Arena<ThreadCb>,
    head: &mut ListHead,
    ix: u32,
) {
    let priority = threads.by_index(ix).effective_priority;
    let mut pos = head.first;
    while let Some(p) = pos {
        if threads.by_index(p).effective_priority < priority {
            break;
        }
        pos = A::link(threads.by_index(p)).next;
    }
    insert_before::<A>(threads, head, pos, ix);
}

/// Unlink `ix` from the list headed by `head`.
pub(crate) fn unlink<A: LinkAdapter>(threads: &mut Arena<ThreadCb>, head: &mut ListHead, ix: u32) {
    let link = *A::link(threads.by_index(ix));

    match link.prev {
        Some(p) => A::link_mut(threads.by_index_mut(p)).next = link.next,
        None => head.first = link.next,
    }
    match link.next {
        Some(n) => A::link_mut(threads.by_index_mut(n)).prev = link.prev,
        None => head.last = link.prev,
    }

    *A::link_mut(threads.by_index_mut(ix)) = Link::default();
}

/// Pop the front thread, if any.
pub(crate) fn pop_front<A: LinkAdapter>(
    threads: &mut Arena<ThreadCb>,
    head: &mut ListHead,
) -> Option<u32> {
    let ix = head.first?;
    unlink::<A>(threads, head, ix);
    Some(ix)
}

/// Re-sort `ix` after a change of its effective priority.
#[inline]
pub(crate) fn reorder<A: LinkAdapter>(
    threads: &mut Arena<ThreadCb>,
    head: &mut ListHead,
    ix: u32,
) {
    unlink::<A>(threads, head, ix);
    push_by_priority::<A>(threads, head, ix);
}

/// Collect the list's indices front to back. Test support; the kernel
/// proper walks links in place.
#[cfg(test)]
pub(crate) fn collect<A: LinkAdapter>(
    threads: &Arena<ThreadCb>,
    head: &ListHead,
) -> alloc::vec::Vec<u32> {
    let mut out = alloc::vec::Vec::new();
    let mut pos = head.first;
    while let Some(p) = pos {
        out.push(p);
        pos = A::link(threads.by_index(p)).next;
    }
    out
}
