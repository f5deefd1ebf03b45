#![doc = include_str!("../../../README.md")]

mod env;
mod error;
mod intern;
mod memo;
mod memoize;
mod module;
mod reader;
mod unmemoize;
mod value;
mod variable;

pub use crate::{
    env::Env,
    error::{ExcKind, Exception, MemoResult},
    intern::{Symbol, gensym},
    memo::{Arity, KwSpec, Memoized, Typecode},
    memoize::{
        EmitFn, ExpandFn, MemoizerPrim, SyntaxTransformer, macroexpand, memoize,
        memoize_expression,
    },
    module::{Module, boot_module, current_module, resolve_module, set_current_module},
    reader::Reader,
    unmemoize::unmemoize_expression,
    value::{ListIter, Pair, Srcloc, Value},
    variable::{Variable, memoize_variable_access},
};
