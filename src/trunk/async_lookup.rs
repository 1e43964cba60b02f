// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Suspendable point lookups.
//!
//! An [`AsyncLookup`] walks the same descent as the synchronous path,
//! but suspends at page-cache misses: the missing page is filled in the
//! background and the context is resumed by polling once its ticket
//! fires. Only cache-miss boundaries suspend; everything else runs
//! synchronously inside `poll`.

use super::{Branch, NodeId, Trunk};
use crate::btree::{lookup_step, ProbeStep};
use crate::cache::FillTicket;
use crate::hash::KeyHash;
use crate::schema::fold_step;
use crate::store::PageAddr;
use crate::{Message, UserKey};
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of polling an [`AsyncLookup`]
pub enum Poll {
    /// Folded message chain (not yet finalized); `None` = no entry
    Ready(Option<Message>),

    /// A page fill is in flight; poll again later
    Pending,
}

struct Probe {
    /// Keeps the branch's extents alive while probing
    _branch: Arc<Branch>,
    addr: PageAddr,
    height: u8,
    ticket: Option<FillTicket>,
}

enum State {
    AtNode {
        candidates: VecDeque<Arc<Branch>>,
        child: Option<NodeId>,
        probe: Option<Probe>,
    },
    Done(Option<Message>),
}

/// A parked point lookup, resumed by cache-fill completions
pub struct AsyncLookup {
    tid: usize,
    key: UserKey,
    hash: KeyHash,
    initial: Option<Message>,
    acc: Option<Message>,
    snapshot_gen: u64,
    state: State,
}

impl AsyncLookup {
    /// Starts a lookup below the memtables; `initial` is the message
    /// chain the memtables already produced, `tid` the registered id of
    /// the polling thread (its band-lock reader stripe).
    #[must_use]
    pub fn new(
        trunk: &Trunk,
        tid: usize,
        key: UserKey,
        hash: KeyHash,
        initial: Option<Message>,
    ) -> Self {
        if initial.as_ref().is_some_and(Message::is_definitive) {
            return Self {
                tid,
                key,
                hash,
                initial: initial.clone(),
                acc: initial.clone(),
                snapshot_gen: 0,
                state: State::Done(initial),
            };
        }

        let snapshot_gen = trunk.structure_generation();
        let state = Self::enter_node(trunk, trunk.root_id(), tid, &key, hash);

        Self {
            tid,
            key,
            hash,
            initial: initial.clone(),
            acc: initial,
            snapshot_gen,
            state,
        }
    }

    #[allow(clippy::expect_used)]
    fn enter_node(trunk: &Trunk, id: NodeId, tid: usize, key: &[u8], hash: KeyHash) -> State {
        let node = trunk.node(id);
        let _band = node.band.read(tid);
        let state = node.state.read().expect("lock is poisoned");

        let band = state.band_of(key, &*trunk.schema);
        let band_bit = 1u64 << band;
        let filter_hits = state.filter.query(hash);

        let candidates: VecDeque<Arc<Branch>> = state
            .branches
            .iter()
            .filter(|b| b.live_bands & band_bit != 0)
            .filter(|b| filter_hits & (1u64 << b.slot) != 0)
            .map(|b| b.branch.clone())
            .collect();

        let child = state.children.get(band).copied();

        State::AtNode {
            candidates,
            child,
            probe: None,
        }
    }

    fn restart(&mut self, trunk: &Trunk) {
        self.acc = self.initial.clone();
        self.snapshot_gen = trunk.structure_generation();
        self.state = Self::enter_node(trunk, trunk.root_id(), self.tid, &self.key, self.hash);
    }

    /// Drives the lookup until it either completes or parks on a page
    /// fill.
    pub fn poll(&mut self, trunk: &Trunk) -> crate::Result<Poll> {
        loop {
            let state = std::mem::replace(&mut self.state, State::Done(None));

            match state {
                State::Done(msg) => {
                    self.state = State::Done(msg.clone());
                    return Ok(Poll::Ready(msg));
                }

                State::AtNode {
                    mut candidates,
                    child,
                    probe,
                } => {
                    // Drive an in-flight branch probe first.
                    if let Some(mut p) = probe {
                        if let Some(ticket) = &p.ticket {
                            if !ticket.is_ready() {
                                self.state = State::AtNode {
                                    candidates,
                                    child,
                                    probe: Some(p),
                                };
                                return Ok(Poll::Pending);
                            }
                            p.ticket = None;
                        }

                        match lookup_step(&trunk.cache, &*trunk.schema, p.addr, p.height, &self.key)?
                        {
                            ProbeStep::Pending(ticket) => {
                                p.ticket = Some(ticket);
                                self.state = State::AtNode {
                                    candidates,
                                    child,
                                    probe: Some(p),
                                };
                                return Ok(Poll::Pending);
                            }
                            ProbeStep::Descend { addr, height } => {
                                p.addr = addr;
                                p.height = height;
                                self.state = State::AtNode {
                                    candidates,
                                    child,
                                    probe: Some(p),
                                };
                                continue;
                            }
                            ProbeStep::Done(found) => {
                                if let Some(found) = found {
                                    let acc = match self.acc.take() {
                                        None => found,
                                        Some(newer) => {
                                            fold_step(&*trunk.schema, &self.key, &newer, &found)
                                        }
                                    };

                                    if acc.is_definitive() {
                                        self.state = State::Done(Some(acc));
                                        continue;
                                    }
                                    self.acc = Some(acc);
                                }

                                self.state = State::AtNode {
                                    candidates,
                                    child,
                                    probe: None,
                                };
                                continue;
                            }
                        }
                    }

                    if let Some(branch) = candidates.pop_front() {
                        self.state = State::AtNode {
                            candidates,
                            child,
                            probe: Some(Probe {
                                addr: branch.tree.root,
                                height: branch.tree.height,
                                _branch: branch,
                                ticket: None,
                            }),
                        };
                        continue;
                    }

                    // Done with this node; data movement since the
                    // snapshot would make the child fold a duplicate.
                    if trunk.structure_generation() != self.snapshot_gen {
                        self.restart(trunk);
                        continue;
                    }

                    match child {
                        Some(id) => {
                            self.state = Self::enter_node(trunk, id, self.tid, &self.key, self.hash);
                        }
                        None => {
                            self.state = State::Done(self.acc.clone());
                        }
                    }
                }
            }
        }
    }
}
