//! Cursor: single-pass traversal of a net.
//!
//! The cursor yields one node at a time. Before it yields the next node it
//! follows the path the previous task selected (default 0), then resets the
//! selection. An out-of-range selection is yielded once as an error, after
//! which the cursor is exhausted.

use crate::error::Result;
use crate::net::{Net, NetNode};
use petgraph::graph::NodeIndex;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Start,
    At(NodeIndex),
    Done,
}

#[derive(Debug)]
pub struct Cursor {
    net: Rc<Net>,
    position: Position,
    next_path: usize,
}

impl Cursor {
    pub fn new(net: Rc<Net>) -> Self {
        Self {
            net,
            position: Position::Start,
            next_path: 0,
        }
    }

    pub fn net(&self) -> &Rc<Net> {
        &self.net
    }

    /// Follow path list `index` of the current node when advancing
    pub fn select_path(&mut self, index: usize) {
        self.next_path = index;
    }

    /// Path the cursor will follow from the current node
    pub fn selected_path(&self) -> usize {
        self.next_path
    }

    /// Node most recently yielded, if traversal is still in progress
    pub fn current(&self) -> Option<&NetNode> {
        match self.position {
            Position::At(index) => Some(self.net.node(index)),
            Position::Start | Position::Done => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.position == Position::Done
    }
}

impl Iterator for Cursor {
    type Item = Result<NodeIndex>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.position {
            Position::Done => return None,
            Position::Start => self.net.entry(),
            Position::At(current) => match self.net.successor(current, self.next_path) {
                Ok(next) => next,
                Err(err) => {
                    self.position = Position::Done;
                    return Some(Err(err));
                }
            },
        };

        self.next_path = 0;
        match next {
            Some(index) => {
                self.position = Position::At(index);
                Some(Ok(index))
            }
            None => {
                self.position = Position::Done;
                None
            }
        }
    }
}
