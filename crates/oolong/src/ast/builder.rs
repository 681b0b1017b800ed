//! Incremental AST construction with operator-precedence rebuilding.
//!
//! The builder receives nodes in source order. When an operator that needs a
//! left-hand side arrives, the right-most finished tree is rotated so that
//! precedence order holds: an incoming operator of higher-or-equal precedence
//! absorbs the pending tree as its LHS; a lower one steals the pending tree's
//! right-most operand chain until its precedence fits. Nodes left incomplete
//! by the rotation are repaired once the next complete operand arrives (the
//! go-backwards-and-close pass).

use std::rc::Rc;

use super::{Node, NodePtr};
use crate::{
    error::{ErrorKind, EvalError, EvalResult},
    loc::SourceLocation,
};

/// Builds statement trees from a stream of nodes.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    working: Vec<Node>,
    open_statement: bool,
}

impl TreeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a node that needs a LHS can currently be added.
    #[must_use]
    pub fn can_add_node_which_needs_lhs(&self) -> bool {
        self.open_statement && self.working.last().is_some_and(Node::is_complete)
    }

    /// Whether the last statement is still open (an incomplete node pends).
    #[must_use]
    pub fn has_open_statement(&self) -> bool {
        self.open_statement && self.working.last().is_some_and(Node::is_incomplete)
    }

    /// Number of pending top-level nodes.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.working.len()
    }

    /// Adds the next node, rotating the pending tree as needed.
    pub fn add(&mut self, mut node: Node) -> EvalResult<()> {
        if node.needs_lhs() {
            let Some(last) = self.working.last() else {
                return Err(lhs_missing(&node));
            };
            if !self.open_statement {
                return Err(lhs_missing(&node));
            }
            if last.is_incomplete() {
                return Err(EvalError::located(
                    ErrorKind::LhsMissing,
                    "operator needs a LHS but the pending node is not complete yet",
                    last.loc().clone(),
                ));
            }

            // smaller precedences are the inner expressions of the bigger
            // precedence operators, e.g. true and true or false
            // --> or( and(true, true), false )
            if node.precedence() >= last.precedence() {
                let lhs = self.working.pop().expect("pending node checked above");
                node.add_child(Rc::new(lhs))?;
                self.working.push(node);
            } else {
                // steal the right-most operand chain until precedence fits;
                // the detached operators stay on the working stack incomplete
                // and get closed again by the repair pass below.
                let top = self.working.last_mut().expect("pending node checked above");
                let mut popped = top.pop_child()?;
                while node.precedence() < popped.precedence() {
                    let mut owned = unwrap_unique(popped)?;
                    let next = owned.pop_child()?;
                    self.working.push(owned);
                    popped = next;
                }
                node.add_child(popped)?;
                self.working.push(node);
            }
        } else if self.working.last().is_some_and(Node::is_incomplete) {
            // the node is an operand (or operator awaiting its RHS)
            if node.is_complete() {
                let top = self.working.last_mut().expect("pending node checked above");
                top.add_child(Rc::new(node))?;
                if top.is_complete() {
                    self.close_backwards()?;
                }
            } else {
                // make it complete first before it joins the previous one
                self.working.push(node);
            }
        } else {
            // first node of a statement
            self.working.push(node);
            self.open_statement = true;
        }
        Ok(())
    }

    /// Go backwards and feed every freshly completed node into the still
    /// incomplete one before it.
    fn close_backwards(&mut self) -> EvalResult<()> {
        while self.working.len() >= 2 {
            let prev = &self.working[self.working.len() - 2];
            if prev.is_complete() {
                break;
            }
            let child = self.working.pop().expect("len checked above");
            let prev = self.working.last_mut().expect("len checked above");
            prev.add_child(Rc::new(child))?;
            if prev.is_incomplete() {
                break;
            }
        }
        Ok(())
    }

    /// Marks the current statement finished (the parser calls this at
    /// statement boundaries).
    pub fn finish_statement(&mut self) {
        self.open_statement = false;
    }

    /// Consumes the builder into a file root carrying all statements.
    /// Fails when incomplete nodes are left pending.
    pub fn into_file(self, name: impl Into<String>, loc: SourceLocation) -> EvalResult<Node> {
        let mut file = Node::file(name, loc);
        for node in self.working {
            if node.is_incomplete() {
                return Err(EvalError::parsing(
                    format!("statement is incomplete: {} node still open", node.kind_name()),
                    node.loc().clone(),
                ));
            }
            file.add_child(Rc::new(node))?;
        }
        Ok(file)
    }

    /// Consumes the builder into the single finished statement it holds.
    pub fn into_statement(mut self) -> EvalResult<Node> {
        if self.working.len() != 1 {
            return Err(EvalError::parsing(
                format!("expected one finished statement, {} pending", self.working.len()),
                SourceLocation::default(),
            ));
        }
        let node = self.working.pop().expect("length checked above");
        if node.is_incomplete() {
            return Err(EvalError::parsing(
                format!("statement is incomplete: {} node still open", node.kind_name()),
                node.loc().clone(),
            ));
        }
        Ok(node)
    }
}

fn lhs_missing(node: &Node) -> EvalError {
    EvalError::located(
        ErrorKind::LhsMissing,
        format!("operator \"{}\" arrived without a left-hand side", node.detail()),
        node.loc().clone(),
    )
}

fn unwrap_unique(ptr: NodePtr) -> EvalResult<Node> {
    Rc::try_unwrap(ptr).map_err(|_| EvalError::runtime("AST node unexpectedly shared during tree building"))
}
