//! A single-pass bytecode compiler for [Lox][lox].
//!
//! Source text goes in one end; a compact stack-machine bytecode [Chunk]
//! wrapped in a [Function][value::Function] comes out the other, ready for a
//! bytecode VM to execute. Scanning, parsing, name resolution, closure
//! capture analysis, and code emission all happen in a single left-to-right
//! pass, in the style of [part III][bytecode] of
//! [Crafting Interpreters][book].
//!
//! [book]: https://craftinginterpreters.com/
//! [bytecode]: https://craftinginterpreters.com/a-bytecode-virtual-machine.html
//! [lox]: https://craftinginterpreters.com/the-lox-language.html

pub mod chunk;
pub mod compiler;
pub mod debug;
pub mod error;
pub mod gc;
pub mod scanner;
pub mod value;

/// The type returned by functions that parse and compile Lox code.
/// This is the standard [std::result::Result], but the error is always
/// [error::CompileError]. The type alias is generic over the success type.
///
/// ```
/// fn check() -> rox::Result<()> {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, error::CompileError>;

/// Re-exports the most common items.
///
/// The compiler touches nearly every module in the crate, so the names it
/// shares with its collaborators are gathered here:
pub mod prelude {
    pub use crate::chunk::{Chunk, OpCode};
    pub use crate::error::{CompileError, Diagnostic};
    pub use crate::gc::ActiveGC;
    pub use crate::scanner::{Lexeme, Scanner, Token};
    pub use crate::value::{Function, Value};
}
