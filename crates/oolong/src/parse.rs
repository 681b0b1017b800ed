//! The parser interface. The textual parser is an external collaborator; the
//! core only consumes it as a factory producing AST roots. Implementations
//! wrap a grammar of their choice around [`crate::ast::TreeBuilder`].

use crate::{ast::Node, error::EvalResult};

/// Factory producing AST roots from source text, with support for
/// incremental (chunked) parsing and open-statement detection.
pub trait Parser {
    /// Parses a complete source text into a file root node.
    fn parse(&mut self, content: &str, name: &str) -> EvalResult<Node>;

    /// Feeds the next chunk of an incrementally parsed source. Statements
    /// may span chunk boundaries.
    fn parse_partial(&mut self, chunk: &str) -> EvalResult<()>;

    /// Whether a statement is still open after the chunks fed so far (more
    /// input is required before [`Parser::finalize`] can succeed).
    fn is_open(&self) -> bool;

    /// Finishes incremental parsing and returns the file root.
    fn finalize(&mut self, name: &str) -> EvalResult<Node>;

    /// Discards all incremental state.
    fn reset(&mut self);
}
