//! Default collector implementations. The machine only depends on the
//! `Heap` trait; these are the batteries used by the tests and by hosts
//! without their own collector.

use std::collections::HashMap;

use tracing::debug;

use crate::runtime::{CollectionKind, Heap, Ref, Roots, RootVisitor, Store};

/// Non-moving collector: trace from the roots, release everything
/// unreachable. Ids of surviving cells are stable, which keeps host-held
/// references valid across collections.
pub struct MarkSweep;

impl Heap for MarkSweep {
    fn collect(&self, _kind: CollectionKind, store: &mut Store, roots: &mut dyn Roots) {
        let mut marks = vec![false; store.capacity()];
        let mut work = Vec::new();

        struct Marker<'a> {
            marks: &'a mut Vec<bool>,
            work: &'a mut Vec<Ref>,
        }
        impl RootVisitor for Marker<'_> {
            fn visit(&mut self, slot: &mut Ref) {
                let r = *slot;
                if !r.is_null() && !self.marks[r.index()] {
                    self.marks[r.index()] = true;
                    self.work.push(r);
                }
            }
        }

        roots.iterate(&mut Marker {
            marks: &mut marks,
            work: &mut work,
        });

        while let Some(r) = work.pop() {
            store.get_mut(r).visit_refs(&mut |slot| {
                let child = *slot;
                if !child.is_null() && !marks[child.index()] {
                    marks[child.index()] = true;
                    work.push(child);
                }
            });
        }

        let dead: Vec<Ref> = store.refs().filter(|r| !marks[r.index()]).collect();
        let freed = dead.len();
        for r in dead {
            store.release(r);
        }
        debug!(freed, live = store.live_count(), "mark-sweep finished");
    }
}

/// Moving collector: evacuates every live cell to a fresh id and rewrites
/// all root and interior slots through the visitor contract. Exercised by
/// the tests to prove root iteration hands out rewritable slot addresses.
pub struct Relocating;

impl Heap for Relocating {
    fn collect(&self, _kind: CollectionKind, store: &mut Store, roots: &mut dyn Roots) {
        // mark
        let mut marks = vec![false; store.capacity()];
        let mut work = Vec::new();

        struct Tracer<'a> {
            marks: &'a mut Vec<bool>,
            work: &'a mut Vec<Ref>,
        }
        impl RootVisitor for Tracer<'_> {
            fn visit(&mut self, slot: &mut Ref) {
                let r = *slot;
                if !r.is_null() && !self.marks[r.index()] {
                    self.marks[r.index()] = true;
                    self.work.push(r);
                }
            }
        }

        roots.iterate(&mut Tracer {
            marks: &mut marks,
            work: &mut work,
        });
        let mut live = Vec::new();
        while let Some(r) = work.pop() {
            live.push(r);
            store.get_mut(r).visit_refs(&mut |slot| {
                let child = *slot;
                if !child.is_null() && !marks[child.index()] {
                    marks[child.index()] = true;
                    work.push(child);
                }
            });
        }

        // evacuate: move each survivor to a fresh id
        let mut forward: HashMap<Ref, Ref> = HashMap::with_capacity(live.len());
        for &old in &live {
            let cell = store.take(old);
            let new = store.insert(cell);
            forward.insert(old, new);
        }

        // rewrite interior slots, then the roots
        for &new in forward.values() {
            store.get_mut(new).visit_refs(&mut |slot| {
                if !slot.is_null() {
                    *slot = forward[slot];
                }
            });
        }

        struct Rewriter<'a> {
            forward: &'a HashMap<Ref, Ref>,
        }
        impl RootVisitor for Rewriter<'_> {
            fn visit(&mut self, slot: &mut Ref) {
                if !slot.is_null() {
                    *slot = self.forward[slot];
                }
            }
        }
        roots.iterate(&mut Rewriter { forward: &forward });

        // dead cells and vacated ids become reusable
        let dead: Vec<Ref> = store
            .refs()
            .filter(|r| !forward.contains_key(r) && !forward.values().any(|v| v == r))
            .collect();
        for r in dead {
            store.release(r);
        }
        for old in forward.keys() {
            store.free_id(*old);
        }
        debug!(live = store.live_count(), "relocation finished");
    }
}
