//! Lazy in-order cursors over an index.
//!
//! Both cursors walk the tree with an explicit stack of frames rather than
//! recursion, loading blocks through the index's cache as they go. They hold
//! the index mutably, so the tree cannot change underneath them; start a new
//! cursor to restart a walk.

use std::cmp::Ordering;

use crate::index::node::NodeRef;
use crate::index::{Index, IndexError};
use crate::storage::IndexHost;

type Item = Result<(Vec<u8>, Vec<u8>), IndexError>;

struct Frame {
    node: NodeRef,
    pos: usize,
    /// The child of the entry at `pos` has been walked.
    descended: bool,
}

impl Frame {
    const fn new(node: NodeRef) -> Self {
        Self {
            node,
            pos: 0,
            descended: false,
        }
    }
}

/// Every `(key, value)` pair in collation order.
pub struct Entries<'a, H: IndexHost> {
    index: &'a mut Index<H>,
    stack: Vec<Frame>,
}

impl<'a, H: IndexHost> Entries<'a, H> {
    pub(crate) fn new(index: &'a mut Index<H>) -> Self {
        Self {
            index,
            stack: vec![Frame::new(NodeRef::Root)],
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let node = self.index.node(frame.node)?;
            let Some(entry) = node.entries().get(frame.pos) else {
                self.stack.pop();
                continue;
            };

            if !frame.descended {
                frame.descended = true;
                if let Some(child) = entry.child() {
                    let parent = frame.node;
                    self.index.descend(parent, child)?;
                    self.stack.push(Frame::new(NodeRef::Block(child)));
                    continue;
                }
            }

            frame.pos += 1;
            frame.descended = false;
            if !entry.is_end() {
                return Ok(Some((entry.key_bytes().to_vec(), entry.data().to_vec())));
            }
        }
    }
}

impl<H: IndexHost> Iterator for Entries<'_, H> {
    type Item = Item;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.advance().transpose();
        if matches!(next, Some(Err(_))) {
            self.stack.clear();
        }
        next
    }
}

struct SearchFrame {
    node: NodeRef,
    pos: usize,
    /// Comparison for the entry at `pos`, kept while its child is walked.
    pending: Option<Ordering>,
}

/// The `(key, value)` pairs a range query accepts, in collation order.
///
/// Subtrees the query rules out are never loaded.
pub struct FindAll<'a, H: IndexHost, Q> {
    index: &'a mut Index<H>,
    query: Q,
    stack: Vec<SearchFrame>,
}

impl<'a, H, Q> FindAll<'a, H, Q>
where
    H: IndexHost,
    Q: FnMut(&[u8]) -> Ordering,
{
    pub(crate) fn new(index: &'a mut Index<H>, query: Q) -> Self {
        Self {
            index,
            query,
            stack: vec![SearchFrame {
                node: NodeRef::Root,
                pos: 0,
                pending: None,
            }],
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, IndexError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let node = self.index.node(frame.node)?;
            let Some(entry) = node.entries().get(frame.pos) else {
                self.stack.pop();
                continue;
            };

            let comparison = match frame.pending {
                Some(comparison) => comparison,
                None => {
                    // The End entry bounds everything after the previous key.
                    let comparison = if entry.is_end() {
                        Ordering::Less
                    } else {
                        (self.query)(entry.key_bytes())
                    };
                    frame.pending = Some(comparison);

                    if comparison != Ordering::Greater {
                        if let Some(child) = entry.child() {
                            let parent = frame.node;
                            self.index.descend(parent, child)?;
                            self.stack.push(SearchFrame {
                                node: NodeRef::Block(child),
                                pos: 0,
                                pending: None,
                            });
                            continue;
                        }
                    }
                    comparison
                }
            };

            frame.pending = None;
            match comparison {
                Ordering::Equal => {
                    frame.pos += 1;
                    return Ok(Some((entry.key_bytes().to_vec(), entry.data().to_vec())));
                }
                Ordering::Greater => frame.pos += 1,
                Ordering::Less => {
                    self.stack.pop();
                }
            }
        }
    }
}

impl<H, Q> Iterator for FindAll<'_, H, Q>
where
    H: IndexHost,
    Q: FnMut(&[u8]) -> Ordering,
{
    type Item = Item;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.advance().transpose();
        if matches!(next, Some(Err(_))) {
            self.stack.clear();
        }
        next
    }
}
