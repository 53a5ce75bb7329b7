use std::slice;

use crate::{Block, Stmt};

/// Lazy pre-order traversal of a statement tree.
///
/// The walk is a plain value: clone it to fork, or ask the program for a new
/// one to restart from the top.
#[derive(Clone, Debug)]
pub struct StmtWalk<'a> {
    stack: Vec<slice::Iter<'a, Stmt>>,
}

impl<'a> StmtWalk<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self {
            stack: vec![block.stmts.iter()],
        }
    }
}

impl<'a> Iterator for StmtWalk<'a> {
    type Item = &'a Stmt;

    fn next(&mut self) -> Option<&'a Stmt> {
        loop {
            let top = self.stack.last_mut()?;
            let Some(stmt) = top.next() else {
                self.stack.pop();
                continue;
            };
            // Children are pushed in reverse so the then-block is visited first.
            match stmt {
                Stmt::If(s) => {
                    if let Some(else_block) = &s.else_block {
                        self.stack.push(else_block.stmts.iter());
                    }
                    self.stack.push(s.then_block.stmts.iter());
                }
                Stmt::While(s) => self.stack.push(s.body.stmts.iter()),
                Stmt::Block(b) => self.stack.push(b.stmts.iter()),
                _ => {}
            }
            return Some(stmt);
        }
    }
}
